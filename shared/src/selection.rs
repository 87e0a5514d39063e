use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::colors::{MetricKind, MetricRegistry};
use crate::error::{FuseError, FuseResult};
use crate::fusion::SourceKind;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub source: SourceKind,
    pub metric: MetricKind,
    /// Hours ahead. Only read when `source` is forecast.
    pub horizon: u32,
}

impl Default for Selection {
    fn default() -> Self {
        Self {
            source: SourceKind::Live,
            metric: MetricKind::temperature(),
            horizon: 0,
        }
    }
}

impl Selection {
    pub fn effective_horizon(&self) -> Option<u32> {
        match self.source {
            SourceKind::Forecast => Some(self.horizon),
            SourceKind::Live => None,
        }
    }
}

/// Partial selection change as delivered by the control surface. Fields stay
/// untyped JSON so that a wrongly typed value is rejected by `apply` as an
/// invalid selection rather than by the transport.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectionPatch {
    #[serde(default)]
    pub source: Option<Value>,
    #[serde(default)]
    pub metric: Option<Value>,
    #[serde(default)]
    pub horizon: Option<Value>,
}

/// Current user selection. Setters validate first and never leave a partial
/// update behind; each returns whether the selection actually changed.
#[derive(Debug, Clone, Default)]
pub struct SelectionState {
    current: Selection,
}

impl SelectionState {
    pub fn new(initial: Selection) -> Self {
        Self { current: initial }
    }

    pub fn current(&self) -> &Selection {
        &self.current
    }

    pub fn set_source(&mut self, source: SourceKind) -> bool {
        replace(&mut self.current.source, source)
    }

    pub fn set_metric(&mut self, metric: MetricKind, registry: &MetricRegistry) -> FuseResult<bool> {
        let metric = validate_metric(metric, registry)?;
        Ok(replace(&mut self.current.metric, metric))
    }

    pub fn set_horizon(&mut self, horizon: i64) -> FuseResult<bool> {
        let horizon = validate_horizon(horizon)?;
        Ok(replace(&mut self.current.horizon, horizon))
    }

    pub fn apply(&mut self, patch: &SelectionPatch, registry: &MetricRegistry) -> FuseResult<bool> {
        let mut next = self.current.clone();
        if let Some(value) = &patch.source {
            let raw = text_field("source", value)?;
            next.source = SourceKind::parse(raw)
                .ok_or_else(|| FuseError::InvalidSelection(format!("unknown source '{raw}'")))?;
        }
        if let Some(value) = &patch.metric {
            let raw = text_field("metric", value)?;
            next.metric = validate_metric(MetricKind::new(raw.trim()), registry)?;
        }
        if let Some(value) = &patch.horizon {
            let raw = value.as_i64().ok_or_else(|| {
                FuseError::InvalidSelection(format!("horizon must be a whole number of hours, got {value}"))
            })?;
            next.horizon = validate_horizon(raw)?;
        }

        Ok(replace(&mut self.current, next))
    }
}

fn replace<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        return false;
    }
    *slot = value;
    true
}

fn text_field<'a>(name: &str, value: &'a Value) -> FuseResult<&'a str> {
    value
        .as_str()
        .ok_or_else(|| FuseError::InvalidSelection(format!("{name} must be a string, got {value}")))
}

fn validate_metric(metric: MetricKind, registry: &MetricRegistry) -> FuseResult<MetricKind> {
    if registry.contains(&metric) {
        Ok(metric)
    } else {
        Err(FuseError::InvalidSelection(format!("unknown metric '{metric}'")))
    }
}

fn validate_horizon(horizon: i64) -> FuseResult<u32> {
    u32::try_from(horizon)
        .map_err(|_| FuseError::InvalidSelection(format!("horizon {horizon} is out of range")))
}
