//! Push endpoints for upstream producers that deliver snapshots instead of
//! being polled. Each call waits until the snapshot has been fused and any
//! resulting frame published.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use fusemap_shared::{ChannelSnapshot, SessionEvent};
use serde_json::Value;

use super::api::{error_response, session_closed_response};
use crate::state::AppState;

pub async fn ingest_live(State(state): State<AppState>, Json(payload): Json<Value>) -> Response {
    accept(&state, ChannelSnapshot::live(payload)).await
}

/// Hour-indexed forecast series, `{ "<horizon>": { "<cell>": {...} } }`.
pub async fn ingest_forecast(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Response {
    accept(&state, ChannelSnapshot::forecast_series(payload)).await
}

pub async fn ingest_forecast_slice(
    State(state): State<AppState>,
    Path(horizon): Path<u32>,
    Json(payload): Json<Value>,
) -> Response {
    accept(&state, ChannelSnapshot::forecast_slice(horizon, payload)).await
}

pub async fn ingest_devices(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Response {
    accept(&state, ChannelSnapshot::device_status(payload)).await
}

async fn accept(state: &AppState, snapshot: ChannelSnapshot) -> Response {
    let channel = snapshot.channel;
    match state.submit(SessionEvent::Channel(snapshot)).await {
        Ok(Ok(())) => {
            let phase = state.live.read().await.phase;
            (
                StatusCode::ACCEPTED,
                Json(serde_json::json!({ "channel": channel, "phase": phase })),
            )
                .into_response()
        }
        Ok(Err(e)) => error_response(&e),
        Err(_) => session_closed_response(),
    }
}
