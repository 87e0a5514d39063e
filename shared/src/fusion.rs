use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::grid::CellId;

const COUNT_FIELD: &str = "count";
const TIMESTAMP_FIELD: &str = "timestamp";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Live,
    Forecast,
}

impl SourceKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "live" | "current" => Some(Self::Live),
            "forecast" => Some(Self::Forecast),
            _ => None,
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Live => f.write_str("live"),
            Self::Forecast => f.write_str("forecast"),
        }
    }
}

/// Cache partition: live, or one forecast horizon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SourceKey {
    Live,
    Forecast(u32),
}

impl SourceKey {
    /// Horizon is ignored for live; a forecast without one means horizon 0.
    pub fn new(source: SourceKind, horizon: Option<u32>) -> Self {
        match source {
            SourceKind::Live => Self::Live,
            SourceKind::Forecast => Self::Forecast(horizon.unwrap_or(0)),
        }
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Live => f.write_str("live"),
            Self::Forecast(h) => write!(f, "forecast+{h}h"),
        }
    }
}

/// Latest reading for one (source, horizon, cell). Every stored value is finite.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FusionRecord {
    pub values: BTreeMap<String, f64>,
    pub sample_count: u64,
    pub observed_at: Option<String>,
}

impl FusionRecord {
    /// Normalize one raw reading. Non-object entries (including `null`) carry
    /// no record; non-numeric or non-finite fields are dropped.
    pub fn from_raw(raw: &Value) -> Option<Self> {
        let fields = raw.as_object()?;
        Some(Self::from_fields(fields))
    }

    fn from_fields(fields: &Map<String, Value>) -> Self {
        let mut record = Self::default();
        for (name, value) in fields {
            match name.as_str() {
                COUNT_FIELD => record.sample_count = parse_count(value),
                TIMESTAMP_FIELD => record.observed_at = parse_timestamp(value),
                _ => match value.as_f64().filter(|v| v.is_finite()) {
                    Some(v) => {
                        record.values.insert(name.clone(), v);
                    }
                    None => debug!(field = %name, "dropping non-numeric reading field"),
                },
            }
        }
        record
    }

    pub fn value(&self, field: &str) -> Option<f64> {
        self.values.get(field).copied()
    }
}

fn parse_count(value: &Value) -> u64 {
    if let Some(n) = value.as_u64() {
        return n;
    }
    match value.as_f64() {
        Some(v) if v.is_finite() && v >= 0.0 && v.fract() == 0.0 => v as u64,
        _ => 0,
    }
}

fn parse_timestamp(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Decode a per-cell snapshot. Objects are keyed by `cell_<id>` or `<id>`;
/// arrays use the slot index as the id and skip `null` slots.
pub fn parse_snapshot(payload: &Value) -> Vec<(CellId, FusionRecord)> {
    match payload {
        Value::Object(map) => map
            .iter()
            .filter_map(|(key, raw)| {
                FusionRecord::from_raw(raw).map(|r| (CellId::from_snapshot_key(key), r))
            })
            .collect(),
        Value::Array(slots) => slots
            .iter()
            .enumerate()
            .filter_map(|(i, raw)| FusionRecord::from_raw(raw).map(|r| (CellId::new(i.to_string()), r)))
            .collect(),
        Value::Null => Vec::new(),
        other => {
            warn!(kind = json_kind(other), "ignoring snapshot that is not an object or array");
            Vec::new()
        }
    }
}

/// Horizon from a series key such as `3`, `h3` or `hour_3`.
pub fn parse_horizon_key(key: &str) -> Option<u32> {
    key.trim()
        .trim_start_matches(|c: char| c.is_ascii_alphabetic() || c == '_')
        .parse()
        .ok()
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Latest-known reading per (source, horizon, cell).
#[derive(Debug, Default)]
pub struct FusionCache {
    slices: HashMap<SourceKey, HashMap<CellId, FusionRecord>>,
}

impl FusionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the slice for `(source, horizon)` with `snapshot`. Other slices
    /// are untouched. Returns the number of cells now held for the key.
    pub fn apply_update(
        &mut self,
        source: SourceKind,
        horizon: Option<u32>,
        snapshot: &Value,
    ) -> usize {
        let key = SourceKey::new(source, horizon);
        let slice: HashMap<CellId, FusionRecord> = parse_snapshot(snapshot).into_iter().collect();
        let count = slice.len();
        self.slices.insert(key, slice);
        debug!(key = %key, cells = count, "applied fusion snapshot");
        count
    }

    /// Apply an hour-indexed forecast series, one independent slice per horizon.
    /// Returns the horizons that were applied, in ascending order.
    pub fn apply_forecast_series(&mut self, series: &Value) -> Vec<u32> {
        let mut slices: Vec<(u32, &Value)> = match series {
            Value::Object(map) => map
                .iter()
                .filter_map(|(key, slice)| match parse_horizon_key(key) {
                    Some(h) => Some((h, slice)),
                    None => {
                        warn!(key = %key, "skipping forecast slice with unparseable horizon");
                        None
                    }
                })
                .collect(),
            Value::Array(slots) => slots
                .iter()
                .enumerate()
                .filter(|(_, slice)| !slice.is_null())
                .filter_map(|(i, slice)| u32::try_from(i).ok().map(|h| (h, slice)))
                .collect(),
            Value::Null => Vec::new(),
            other => {
                warn!(kind = json_kind(other), "ignoring forecast series that is not an object or array");
                Vec::new()
            }
        };
        slices.sort_by_key(|(h, _)| *h);

        slices
            .into_iter()
            .map(|(h, slice)| {
                self.apply_update(SourceKind::Forecast, Some(h), slice);
                h
            })
            .collect()
    }

    /// Record for a grid cell id. Snapshot keys are stored without their
    /// `cell_` prefix, so a grid id that carries the prefix is looked up in
    /// its normalized form when there is no exact match.
    pub fn query(&self, source: SourceKind, horizon: Option<u32>, cell: &str) -> Option<&FusionRecord> {
        let slice = self.slices.get(&SourceKey::new(source, horizon))?;
        slice.get(cell).or_else(|| {
            let normalized = CellId::from_snapshot_key(cell);
            slice.get(normalized.as_str())
        })
    }

    pub fn cell_count(&self, source: SourceKind, horizon: Option<u32>) -> usize {
        self.slices
            .get(&SourceKey::new(source, horizon))
            .map_or(0, HashMap::len)
    }

    /// Forecast horizons currently cached, ascending.
    pub fn horizons(&self) -> Vec<u32> {
        let mut horizons: Vec<u32> = self
            .slices
            .keys()
            .filter_map(|key| match key {
                SourceKey::Forecast(h) => Some(*h),
                SourceKey::Live => None,
            })
            .collect();
        horizons.sort_unstable();
        horizons
    }

    pub fn total_records(&self) -> usize {
        self.slices.values().map(HashMap::len).sum()
    }
}
