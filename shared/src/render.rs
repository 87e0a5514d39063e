use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::colors::{Legend, MetricRegistry, MetricScale};
use crate::fusion::{FusionCache, FusionRecord, SourceKind};
use crate::grid::{Cell, CellId, GridStore};
use crate::selection::Selection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderPhase {
    Uninitialized,
    GridPending,
    Ready,
}

/// Style and popup for one cell, as applied by the external renderer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderInstruction {
    pub cell_id: CellId,
    pub fill_color: String,
    pub fill_opacity: f64,
    pub popup_text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderFrame {
    pub selection: Selection,
    pub legend: Option<Legend>,
    pub instructions: Vec<RenderInstruction>,
}

impl RenderFrame {
    pub fn to_json_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn no_data_count(&self) -> usize {
        self.instructions
            .iter()
            .filter(|i| i.fill_opacity == 0.0)
            .count()
    }
}

/// CRC32 of a serialized frame, used as its ETag.
pub fn frame_fingerprint(json: &[u8]) -> u32 {
    crc32fast::hash(json)
}

/// Orchestrates when frames may be produced and suppresses redundant ones.
#[derive(Debug)]
pub struct RenderController {
    phase: RenderPhase,
    last_frame: Option<RenderFrame>,
}

impl Default for RenderController {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderController {
    pub const fn new() -> Self {
        Self {
            phase: RenderPhase::Uninitialized,
            last_frame: None,
        }
    }

    pub const fn phase(&self) -> RenderPhase {
        self.phase
    }

    pub const fn is_ready(&self) -> bool {
        matches!(self.phase, RenderPhase::Ready)
    }

    /// Geometry fetch and channel subscriptions have started.
    pub fn begin_subscription(&mut self) -> bool {
        if self.phase != RenderPhase::Uninitialized {
            return false;
        }
        self.phase = RenderPhase::GridPending;
        debug!("render controller waiting for grid geometry");
        true
    }

    /// The geometry fetch failed; a retry starts from `Uninitialized` again.
    pub fn geometry_failed(&mut self) {
        if self.phase == RenderPhase::GridPending {
            self.phase = RenderPhase::Uninitialized;
        }
    }

    /// Enter `Ready` once the grid is loaded. `Ready` is terminal.
    pub fn grid_ready(&mut self, grid: &GridStore) -> bool {
        if self.is_ready() || !grid.is_ready() {
            return false;
        }
        self.phase = RenderPhase::Ready;
        info!(cells = grid.len(), "grid ready, rendering enabled");
        true
    }

    pub fn last_frame(&self) -> Option<&RenderFrame> {
        self.last_frame.as_ref()
    }

    /// Full frame for the current state, or `None` before `Ready`.
    pub fn render(
        &self,
        grid: &GridStore,
        cache: &FusionCache,
        selection: &Selection,
        registry: &MetricRegistry,
    ) -> Option<RenderFrame> {
        if !self.is_ready() {
            return None;
        }

        let scale = registry.get(&selection.metric);
        let horizon = selection.effective_horizon();
        let instructions = grid
            .cells()
            .map(|cell| {
                let record = cache.query(selection.source, horizon, cell.id.as_str());
                let value = scale.and_then(|scale| resolve_value(record, scale, selection.source));
                let fill = registry.map_value(value, &selection.metric);
                RenderInstruction {
                    cell_id: cell.id.clone(),
                    fill_color: fill.css(),
                    fill_opacity: fill.opacity,
                    popup_text: popup_text(cell, selection, scale, value, record),
                }
            })
            .collect();

        Some(RenderFrame {
            selection: selection.clone(),
            legend: registry.legend(&selection.metric),
            instructions,
        })
    }

    /// Render and memoize; returns the frame only when it differs from the
    /// last one returned.
    pub fn render_if_changed(
        &mut self,
        grid: &GridStore,
        cache: &FusionCache,
        selection: &Selection,
        registry: &MetricRegistry,
    ) -> Option<RenderFrame> {
        let frame = self.render(grid, cache, selection, registry)?;
        if self.last_frame.as_ref() == Some(&frame) {
            debug!("render trigger produced an identical frame");
            return None;
        }
        self.last_frame = Some(frame.clone());
        Some(frame)
    }
}

/// The metric's own field wins; the forecast-suffixed field is only a
/// fallback for forecast slices. The two are never combined.
fn resolve_value(
    record: Option<&FusionRecord>,
    scale: &MetricScale,
    source: SourceKind,
) -> Option<f64> {
    let record = record?;
    record.value(&scale.field).or_else(|| match source {
        SourceKind::Forecast => record.value(&scale.forecast_field()),
        SourceKind::Live => None,
    })
}

fn popup_text(
    cell: &Cell,
    selection: &Selection,
    scale: Option<&MetricScale>,
    value: Option<f64>,
    record: Option<&FusionRecord>,
) -> String {
    let mut text = format!("<b>Cell {}</b>", escape_html(cell.id.as_str()));
    if let Some(h) = selection.effective_horizon() {
        let _ = write!(text, " (forecast +{h}h)");
    }

    let (Some(scale), Some(value)) = (scale, value) else {
        text.push_str("<br>No data");
        return text;
    };

    let _ = write!(
        text,
        "<br><b>{}:</b> {value:.2} {}",
        escape_html(&scale.label),
        escape_html(&scale.unit)
    );
    let count = record.map_or(0, |r| r.sample_count);
    let _ = write!(text, "<br><b>Count:</b> {count}");
    if let Some(observed_at) = record.and_then(|r| r.observed_at.as_deref()) {
        let _ = write!(text, "<br><b>Time:</b> {}", escape_html(observed_at));
    }
    text
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
