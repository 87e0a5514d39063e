use std::borrow::Borrow;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{FuseError, FuseResult};

/// Feature property carrying the cell identifier.
pub const CELL_ID_PROPERTY: &str = "cell_id";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CellId(String);

impl CellId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Normalize an upstream snapshot key: `cell_17` and `17` name the same cell.
    pub fn from_snapshot_key(key: &str) -> Self {
        let trimmed = key.trim();
        Self(trimmed.strip_prefix("cell_").unwrap_or(trimmed).to_string())
    }

    fn from_property(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) if !s.trim().is_empty() => Some(Self(s.trim().to_string())),
            Value::Number(n) => n
                .as_u64()
                .map(|v| v.to_string())
                .or_else(|| n.as_i64().map(|v| v.to_string()))
                .map(Self),
            _ => None,
        }
    }
}

impl Borrow<str> for CellId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Raw geometry document: a GeoJSON-style feature collection. Both `type`
/// and `features` are required, so an upstream error body never parses as an
/// empty grid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeometryDocument {
    #[serde(rename = "type")]
    pub kind: CollectionKind,
    pub features: Vec<GeometryFeature>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollectionKind {
    FeatureCollection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeometryFeature {
    #[serde(default)]
    pub properties: Option<Map<String, Value>>,
    #[serde(default)]
    pub geometry: Option<Value>,
}

impl GeometryDocument {
    pub fn from_slice(bytes: &[u8]) -> FuseResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| FuseError::GeometryLoad(e.to_string()))
    }
}

pub type Ring = Vec<Vec<f64>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "coordinates")]
pub enum CellGeometry {
    Polygon(Vec<Ring>),
    MultiPolygon(Vec<Vec<Ring>>),
}

impl CellGeometry {
    fn parse(value: &Value) -> Result<Self, String> {
        let geometry: CellGeometry = serde_json::from_value(value.clone())
            .map_err(|e| format!("geometry is not a polygon: {e}"))?;
        let polygons: Vec<&Vec<Ring>> = match &geometry {
            CellGeometry::Polygon(rings) => vec![rings],
            CellGeometry::MultiPolygon(polys) => polys.iter().collect(),
        };
        if polygons.is_empty() || polygons.iter().any(|rings| rings.is_empty()) {
            return Err("polygon has no rings".to_string());
        }
        let bad_position = polygons
            .iter()
            .flat_map(|rings| rings.iter())
            .flat_map(|ring| ring.iter())
            .any(|pos| pos.len() < 2 || pos.iter().any(|c| !c.is_finite()));
        if bad_position {
            return Err("polygon has an invalid position".to_string());
        }
        Ok(geometry)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    pub id: CellId,
    pub geometry: CellGeometry,
    pub metadata: Map<String, Value>,
}

/// Immutable spatial partition, populated exactly once.
#[derive(Debug, Default)]
pub struct GridStore {
    cells: Vec<Cell>,
    index: HashMap<CellId, usize>,
    loaded: bool,
}

impl GridStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and install every feature of `document`. Nothing is stored
    /// unless the whole document is valid.
    pub fn load(&mut self, document: &GeometryDocument) -> FuseResult<usize> {
        if self.loaded {
            return Err(FuseError::AlreadyLoaded);
        }

        let mut cells = Vec::with_capacity(document.features.len());
        let mut index = HashMap::with_capacity(document.features.len());

        for (i, feature) in document.features.iter().enumerate() {
            let mut metadata = feature.properties.clone().unwrap_or_default();
            let id = metadata
                .remove(CELL_ID_PROPERTY)
                .as_ref()
                .and_then(CellId::from_property)
                .ok_or_else(|| FuseError::malformed(i, "missing or invalid cell_id"))?;
            let geometry = feature
                .geometry
                .as_ref()
                .ok_or_else(|| FuseError::malformed(i, format!("cell {id} has no geometry")))
                .and_then(|value| {
                    CellGeometry::parse(value).map_err(|reason| FuseError::malformed(i, reason))
                })?;

            match index.entry(id.clone()) {
                Entry::Occupied(_) => {
                    return Err(FuseError::malformed(i, format!("duplicate cell_id {id}")));
                }
                Entry::Vacant(slot) => {
                    slot.insert(cells.len());
                }
            }
            cells.push(Cell {
                id,
                geometry,
                metadata,
            });
        }

        self.cells = cells;
        self.index = index;
        self.loaded = true;
        Ok(self.cells.len())
    }

    pub const fn is_ready(&self) -> bool {
        self.loaded
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Cell> {
        self.index.get(id).map(|&i| &self.cells[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Cells in document order. Each call starts a fresh pass.
    pub fn cells(&self) -> impl Iterator<Item = &Cell> + '_ {
        self.cells.iter()
    }

    pub fn for_each_cell(&self, f: impl FnMut(&Cell)) {
        self.cells().for_each(f);
    }

    /// The loaded partition as a feature collection, in document order.
    pub fn to_feature_collection(&self) -> Value {
        let features: Vec<Value> = self
            .cells
            .iter()
            .map(|cell| {
                let mut properties = cell.metadata.clone();
                properties.insert(
                    CELL_ID_PROPERTY.to_string(),
                    Value::String(cell.id.to_string()),
                );
                serde_json::json!({
                    "type": "Feature",
                    "properties": properties,
                    "geometry": cell.geometry,
                })
            })
            .collect();
        serde_json::json!({ "type": "FeatureCollection", "features": features })
    }
}
