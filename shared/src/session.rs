use tracing::{info, warn};

use crate::colors::MetricRegistry;
use crate::error::FuseResult;
use crate::events::{Channel, ChannelSnapshot};
use crate::fusion::{FusionCache, SourceKind};
use crate::grid::{GeometryDocument, GridStore};
use crate::health::{self, DeviceHealthSummary};
use crate::render::{RenderController, RenderFrame, RenderPhase};
use crate::selection::{Selection, SelectionPatch, SelectionState};

/// Everything that can mutate a session. Events are handled one at a time.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    GeometryRequested,
    GeometryLoaded(GeometryDocument),
    GeometryFailed(String),
    Channel(ChannelSnapshot),
    Select(SelectionPatch),
}

/// What a handled event produced for publication.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionOutcome {
    /// New frame, present only when it differs from the last published one.
    pub frame: Option<RenderFrame>,
    pub devices: Option<DeviceHealthSummary>,
}

/// Session context owning the grid, the fusion cache, the selection and the
/// render controller.
#[derive(Debug, Default)]
pub struct Session {
    registry: MetricRegistry,
    grid: GridStore,
    cache: FusionCache,
    selection: SelectionState,
    controller: RenderController,
    devices: Option<DeviceHealthSummary>,
}

impl Session {
    pub fn new(registry: MetricRegistry) -> Self {
        Self {
            registry,
            ..Self::default()
        }
    }

    pub fn handle(&mut self, event: SessionEvent) -> FuseResult<SessionOutcome> {
        match event {
            SessionEvent::GeometryRequested => {
                self.controller.begin_subscription();
                Ok(SessionOutcome::default())
            }
            SessionEvent::GeometryLoaded(document) => {
                let cells = self.grid.load(&document)?;
                info!(cells, "grid geometry loaded");
                self.controller.grid_ready(&self.grid);
                Ok(self.rerender())
            }
            SessionEvent::GeometryFailed(reason) => {
                warn!(%reason, "grid geometry load failed");
                self.controller.geometry_failed();
                Ok(SessionOutcome::default())
            }
            SessionEvent::Channel(snapshot) => Ok(self.ingest(snapshot)),
            SessionEvent::Select(patch) => {
                if self.selection.apply(&patch, &self.registry)? {
                    Ok(self.rerender())
                } else {
                    Ok(SessionOutcome::default())
                }
            }
        }
    }

    fn ingest(&mut self, snapshot: ChannelSnapshot) -> SessionOutcome {
        match (snapshot.channel, snapshot.horizon) {
            (Channel::Live, _) => {
                self.cache.apply_update(SourceKind::Live, None, &snapshot.payload);
            }
            (Channel::Forecast, Some(h)) => {
                self.cache
                    .apply_update(SourceKind::Forecast, Some(h), &snapshot.payload);
            }
            (Channel::Forecast, None) => {
                self.cache.apply_forecast_series(&snapshot.payload);
            }
            (Channel::DeviceStatus, _) => {
                let summary = health::summarize(&snapshot.payload);
                self.devices = Some(summary);
                return SessionOutcome {
                    frame: None,
                    devices: Some(summary),
                };
            }
        }
        self.rerender()
    }

    fn rerender(&mut self) -> SessionOutcome {
        SessionOutcome {
            frame: self.controller.render_if_changed(
                &self.grid,
                &self.cache,
                self.selection.current(),
                &self.registry,
            ),
            devices: None,
        }
    }

    /// Current frame computed on demand, `None` until the grid is ready.
    pub fn frame(&self) -> Option<RenderFrame> {
        self.controller.render(
            &self.grid,
            &self.cache,
            self.selection.current(),
            &self.registry,
        )
    }

    pub fn phase(&self) -> RenderPhase {
        self.controller.phase()
    }

    pub fn selection(&self) -> &Selection {
        self.selection.current()
    }

    pub fn grid(&self) -> &GridStore {
        &self.grid
    }

    pub fn cache(&self) -> &FusionCache {
        &self.cache
    }

    pub fn devices(&self) -> Option<DeviceHealthSummary> {
        self.devices
    }
}
