use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use fusemap_shared::render::frame_fingerprint;
use fusemap_shared::{
    DeviceHealthSummary, FuseError, MapEvent, RenderFrame, Session, SessionEvent, SessionOutcome,
    SourceKind,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::state::{AppState, PreSerializedEvent, SessionCommand};

/// Single consumer of session events. Every mutation of the session happens
/// here, one event at a time; rendering is synchronous inside the loop.
pub async fn run(state: AppState, mut rx: mpsc::Receiver<SessionCommand>, mut session: Session) {
    info!("session worker started");

    while let Some(SessionCommand { event, reply }) = rx.recv().await {
        let loads_geometry = matches!(event, SessionEvent::GeometryLoaded(_));

        let result = session.handle(event);
        match &result {
            Ok(outcome) => publish(&state, &session, outcome, loads_geometry).await,
            Err(e @ FuseError::InvalidSelection(_)) => {
                state.observability.record_rejected_selection();
                debug!(error = %e, "selection rejected");
            }
            Err(e @ FuseError::AlreadyLoaded) => {
                error!(error = %e, "geometry delivered twice");
            }
            Err(e) => {
                error!(error = %e, "session event failed");
            }
        }
        if let Some(reply) = reply {
            let _ = reply.send(result.map(|_| ()));
        }
    }

    info!("session worker stopped: all senders dropped");
}

async fn publish(state: &AppState, session: &Session, outcome: &SessionOutcome, grid_loaded: bool) {
    let grid_json = if grid_loaded && session.grid().is_ready() {
        serialize(&session.grid().to_feature_collection(), "grid feature collection")
    } else {
        None
    };
    let render = outcome
        .frame
        .as_ref()
        .and_then(|frame| serialize_render(state, frame));
    let devices = outcome
        .devices
        .and_then(|summary| serialize_devices(state, summary));

    {
        let mut live = state.live.write().await;
        live.phase = session.phase();
        live.selection = session.selection().clone();
        live.cell_count = session.grid().len();
        let cache = session.cache();
        let selection = session.selection();
        live.horizons = cache.horizons();
        live.live_cells = cache.cell_count(SourceKind::Live, None);
        live.selected_cells = cache.cell_count(selection.source, selection.effective_horizon());
        live.cached_records = cache.total_records();
        if let Some(json) = grid_json {
            live.grid_json = Some(json);
        }
        if let Some((seq, json, _)) = &render {
            live.render_seq = *seq;
            live.render_etag = Some(format!("\"frame-{:08x}\"", frame_fingerprint(json)));
            live.render_json = Some(Arc::clone(json));
        }
        if let Some((seq, json)) = &devices {
            live.devices_seq = *seq;
            live.devices_json = Some(Arc::clone(json));
        }
    }

    if let Some((seq, json, no_data)) = render {
        state.observability.record_frame_published();
        debug!(seq, no_data, "publishing render frame");
        // No receivers is fine: the latest frame is kept in the live view.
        let _ = state.event_tx.send(PreSerializedEvent::Render { seq, json });
    }
    if let Some((seq, json)) = devices {
        let _ = state.event_tx.send(PreSerializedEvent::Devices { seq, json });
    }
}

fn serialize_render(state: &AppState, frame: &RenderFrame) -> Option<(u64, Arc<Bytes>, usize)> {
    let seq = state.next_seq();
    let event = MapEvent::Render {
        seq,
        timestamp: Utc::now().to_rfc3339(),
        frame: frame.clone(),
    };
    serialize(&event, "render event").map(|json| (seq, json, frame.no_data_count()))
}

fn serialize_devices(state: &AppState, summary: DeviceHealthSummary) -> Option<(u64, Arc<Bytes>)> {
    let seq = state.next_seq();
    let event = MapEvent::Devices {
        seq,
        timestamp: Utc::now().to_rfc3339(),
        summary,
    };
    serialize(&event, "devices event").map(|json| (seq, json))
}

fn serialize<T: serde::Serialize>(value: &T, label: &str) -> Option<Arc<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(json) => Some(Arc::new(Bytes::from(json))),
        Err(e) => {
            warn!(error = %e, "failed to serialize {label}");
            None
        }
    }
}
