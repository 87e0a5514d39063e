use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Fill opacity for any cell that has a value. No-data cells use 0.0.
pub const PRESENT_FILL_OPACITY: f64 = 0.7;

pub const TEMPERATURE: &str = "temperature";
pub const PRESSURE: &str = "pressure";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rgb(pub u8, pub u8, pub u8);

impl Rgb {
    pub fn css(self) -> String {
        format!("rgb({},{},{})", self.0, self.1, self.2)
    }
}

/// Registered metric identifier, e.g. `temperature`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetricKind(String);

impl MetricKind {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn temperature() -> Self {
        Self::new(TEMPERATURE)
    }

    pub fn pressure() -> Self {
        Self::new(PRESSURE)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Value range, gradient endpoints and field accessor for one metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricScale {
    pub label: String,
    pub unit: String,
    pub min: f64,
    pub max: f64,
    pub low_color: Rgb,
    pub high_color: Rgb,
    /// Reading field holding this metric, e.g. `avg_temp`.
    pub field: String,
    /// Forecast-only fallback field. Defaults to `<field>_forecast`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forecast_field: Option<String>,
}

impl MetricScale {
    pub fn forecast_field(&self) -> String {
        self.forecast_field
            .clone()
            .unwrap_or_else(|| format!("{}_forecast", self.field))
    }

    pub fn is_valid(&self) -> bool {
        self.min.is_finite() && self.max.is_finite() && !self.field.is_empty()
    }

    /// Position of `value` inside `[min, max]`, saturated to `0..=1`.
    pub fn ratio(&self, value: f64) -> f64 {
        let span = self.max - self.min;
        if span <= 0.0 {
            return 0.0;
        }
        ((value - self.min) / span).clamp(0.0, 1.0)
    }

    pub fn color_at(&self, ratio: f64) -> Rgb {
        let t = ratio.clamp(0.0, 1.0);
        Rgb(
            lerp_channel(self.low_color.0, self.high_color.0, t),
            lerp_channel(self.low_color.1, self.high_color.1, t),
            lerp_channel(self.low_color.2, self.high_color.2, t),
        )
    }
}

fn lerp_channel(low: u8, high: u8, t: f64) -> u8 {
    let delta = (f64::from(high) - f64::from(low)) * t;
    (f64::from(low) + delta.round()).clamp(0.0, 255.0) as u8
}

/// Resolved style for one cell.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub rgb: Option<Rgb>,
    pub opacity: f64,
}

impl Fill {
    pub const NO_DATA: Fill = Fill {
        rgb: None,
        opacity: 0.0,
    };

    pub const fn is_no_data(&self) -> bool {
        self.rgb.is_none()
    }

    pub fn css(&self) -> String {
        match self.rgb {
            Some(rgb) => rgb.css(),
            None => "rgba(0,0,0,0)".to_string(),
        }
    }
}

/// Legend contract handed to the external renderer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Legend {
    pub metric: MetricKind,
    pub title: String,
    pub unit: String,
    pub low_label: String,
    pub high_label: String,
    pub gradient: String,
}

/// Metric table. Every metric-dependent decision goes through here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetricRegistry {
    scales: BTreeMap<MetricKind, MetricScale>,
}

impl Default for MetricRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(
            MetricKind::temperature(),
            MetricScale {
                label: "Average Temp".to_string(),
                unit: "°C".to_string(),
                min: 0.0,
                max: 20.0,
                low_color: Rgb(0, 0, 255),
                high_color: Rgb(255, 0, 0),
                field: "avg_temp".to_string(),
                forecast_field: None,
            },
        );
        registry.register(
            MetricKind::pressure(),
            MetricScale {
                label: "Average Pressure".to_string(),
                unit: "hPa".to_string(),
                min: 950.0,
                max: 1050.0,
                low_color: Rgb(0, 0, 255),
                high_color: Rgb(0, 255, 0),
                field: "avg_pressure".to_string(),
                forecast_field: None,
            },
        );
        registry
    }
}

impl MetricRegistry {
    pub fn empty() -> Self {
        Self {
            scales: BTreeMap::new(),
        }
    }

    /// Built-in metrics overlaid with the scales in `json`
    /// (`{"<metric>": {label, unit, min, max, low_color, high_color, field}}`).
    /// Entries with non-finite bounds or an empty field are skipped.
    pub fn with_overrides_json(json: &str) -> Result<Self, serde_json::Error> {
        let overrides: BTreeMap<MetricKind, MetricScale> = serde_json::from_str(json)?;
        let mut registry = Self::default();
        for (kind, scale) in overrides {
            if scale.is_valid() {
                registry.register(kind, scale);
            } else {
                tracing::warn!(metric = %kind, "ignoring metric scale with invalid bounds or field");
            }
        }
        Ok(registry)
    }

    pub fn register(&mut self, kind: MetricKind, scale: MetricScale) {
        self.scales.insert(kind, scale);
    }

    /// Replace the bounds of an existing metric. Returns false for unknown metrics.
    pub fn set_bounds(&mut self, kind: &MetricKind, min: f64, max: f64) -> bool {
        match self.scales.get_mut(kind) {
            Some(scale) if min.is_finite() && max.is_finite() => {
                scale.min = min;
                scale.max = max;
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, kind: &MetricKind) -> Option<&MetricScale> {
        self.scales.get(kind)
    }

    pub fn contains(&self, kind: &MetricKind) -> bool {
        self.scales.contains_key(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &MetricKind> {
        self.scales.keys()
    }

    /// Map a value to its fill. `None` and unknown metrics are no-data.
    pub fn map_value(&self, value: Option<f64>, kind: &MetricKind) -> Fill {
        let (Some(value), Some(scale)) = (value, self.scales.get(kind)) else {
            return Fill::NO_DATA;
        };
        if !value.is_finite() {
            return Fill::NO_DATA;
        }
        Fill {
            rgb: Some(scale.color_at(scale.ratio(value))),
            opacity: PRESENT_FILL_OPACITY,
        }
    }

    pub fn legend(&self, kind: &MetricKind) -> Option<Legend> {
        let scale = self.scales.get(kind)?;
        Some(Legend {
            metric: kind.clone(),
            title: scale.label.clone(),
            unit: scale.unit.clone(),
            low_label: format!("{} {}", format_bound(scale.min), scale.unit),
            high_label: format!("{} {}", format_bound(scale.max), scale.unit),
            gradient: format!(
                "linear-gradient(to right, {}, {})",
                scale.low_color.css(),
                scale.high_color.css()
            ),
        })
    }
}

fn format_bound(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{value:.0}")
    } else {
        format!("{value}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temperature() -> MetricKind {
        MetricKind::temperature()
    }

    #[test]
    fn midpoint_temperature_matches_reference_color() {
        let registry = MetricRegistry::default();
        let fill = registry.map_value(Some(10.0), &temperature());
        assert_eq!(fill.rgb, Some(Rgb(128, 0, 127)));
        assert_eq!(fill.css(), "rgb(128,0,127)");
        assert_eq!(fill.opacity, PRESENT_FILL_OPACITY);
    }

    #[test]
    fn range_edges_hit_low_and_high_colors() {
        let registry = MetricRegistry::default();
        let scale = registry.get(&temperature()).expect("temperature registered");
        assert_eq!(
            registry.map_value(Some(scale.min), &temperature()).rgb,
            Some(scale.low_color)
        );
        assert_eq!(
            registry.map_value(Some(scale.max), &temperature()).rgb,
            Some(scale.high_color)
        );
    }

    #[test]
    fn out_of_range_values_saturate() {
        let registry = MetricRegistry::default();
        let kind = temperature();
        assert_eq!(
            registry.map_value(Some(-0.001), &kind),
            registry.map_value(Some(0.0), &kind)
        );
        assert_eq!(
            registry.map_value(Some(-500.0), &kind),
            registry.map_value(Some(0.0), &kind)
        );
        assert_eq!(
            registry.map_value(Some(20.001), &kind),
            registry.map_value(Some(20.0), &kind)
        );
        assert_eq!(
            registry.map_value(Some(1e9), &kind),
            registry.map_value(Some(20.0), &kind)
        );
    }

    #[test]
    fn mapping_is_monotonic_inside_range() {
        let registry = MetricRegistry::default();
        let kind = temperature();
        let mut previous_red = 0u8;
        let mut previous_blue = 255u8;
        for step in 0..=200 {
            let value = f64::from(step) * 0.1;
            let rgb = registry
                .map_value(Some(value), &kind)
                .rgb
                .expect("present value has a color");
            assert!(rgb.0 >= previous_red, "red decreased at {value}");
            assert!(rgb.2 <= previous_blue, "blue increased at {value}");
            assert_eq!(rgb.1, 0);
            previous_red = rgb.0;
            previous_blue = rgb.2;
        }
    }

    #[test]
    fn absent_value_is_transparent_and_distinct_from_low_end() {
        let registry = MetricRegistry::default();
        let kind = temperature();
        let absent = registry.map_value(None, &kind);
        let low = registry.map_value(Some(0.0), &kind);

        assert!(absent.is_no_data());
        assert_eq!(absent.opacity, 0.0);
        assert_eq!(absent.css(), "rgba(0,0,0,0)");
        assert!(low.opacity > 0.0);
        assert_ne!(absent, low);
    }

    #[test]
    fn pressure_uses_blue_to_green_gradient() {
        let registry = MetricRegistry::default();
        let fill = registry.map_value(Some(1000.0), &MetricKind::pressure());
        assert_eq!(fill.rgb, Some(Rgb(0, 128, 127)));
    }

    #[test]
    fn degenerate_range_maps_to_low_color() {
        let mut registry = MetricRegistry::default();
        assert!(registry.set_bounds(&temperature(), 5.0, 5.0));
        assert_eq!(
            registry.map_value(Some(100.0), &temperature()).rgb,
            Some(Rgb(0, 0, 255))
        );
    }

    #[test]
    fn unknown_metric_renders_as_no_data() {
        let registry = MetricRegistry::default();
        let fill = registry.map_value(Some(1.0), &MetricKind::new("humidity"));
        assert!(fill.is_no_data());
    }

    #[test]
    fn overrides_json_adds_metrics_and_replaces_bounds() {
        let json = r#"{
            "pressure": {
                "label": "Average Pressure", "unit": "hPa", "min": 990, "max": 1020,
                "low_color": [0, 0, 255], "high_color": [0, 255, 0], "field": "avg_pressure"
            },
            "humidity": {
                "label": "Humidity", "unit": "%", "min": 0, "max": 100,
                "low_color": [255, 255, 255], "high_color": [0, 0, 128], "field": "avg_humidity"
            },
            "broken": {
                "label": "Broken", "unit": "", "min": 0, "max": 1,
                "low_color": [0, 0, 0], "high_color": [0, 0, 0], "field": ""
            }
        }"#;
        let registry = MetricRegistry::with_overrides_json(json).expect("overrides parse");
        let pressure = registry.get(&MetricKind::pressure()).expect("pressure kept");
        assert_eq!((pressure.min, pressure.max), (990.0, 1020.0));
        assert!(registry.contains(&MetricKind::new("humidity")));
        assert!(!registry.contains(&MetricKind::new("broken")));
        assert!(registry.contains(&temperature()));
    }

    #[test]
    fn forecast_field_defaults_to_suffixed_name() {
        let registry = MetricRegistry::default();
        let scale = registry.get(&temperature()).expect("temperature registered");
        assert_eq!(scale.forecast_field(), "avg_temp_forecast");
    }

    #[test]
    fn legend_describes_scale_and_gradient() {
        let registry = MetricRegistry::default();
        let legend = registry.legend(&temperature()).expect("legend");
        assert_eq!(legend.low_label, "0 °C");
        assert_eq!(legend.high_label, "20 °C");
        assert_eq!(
            legend.gradient,
            "linear-gradient(to right, rgb(0,0,255), rgb(255,0,0))"
        );
    }
}
