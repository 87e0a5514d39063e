use std::fmt::Write as _;

use axum::Json;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use fusemap_shared::{FuseError, RenderPhase, SelectionPatch, SessionEvent};

use crate::state::{AppState, ObservabilitySnapshot};

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let (phase, cells, render_seq, cache) = {
        let live = state.live.read().await;
        let cache = serde_json::json!({
            "horizons": live.horizons,
            "live_cells": live.live_cells,
            "selected_cells": live.selected_cells,
            "records": live.cached_records,
        });
        (live.phase, live.cell_count, live.render_seq, cache)
    };
    let observability = state.observability.snapshot();
    Json(serde_json::json!({
        "status": "ok",
        "phase": phase,
        "cells": cells,
        "render_seq": render_seq,
        "cache": cache,
        "observability": {
            "live_snapshots_total": observability.live_snapshots_total,
            "forecast_snapshots_total": observability.forecast_snapshots_total,
            "device_snapshots_total": observability.device_snapshots_total,
            "frames_published_total": observability.frames_published_total,
            "rejected_selections_total": observability.rejected_selections_total,
            "geometry_load_failures_total": observability.geometry_load_failures_total,
            "sse_lagged_total": observability.sse_lagged_total,
        }
    }))
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let (phase, cells) = {
        let live = state.live.read().await;
        (live.phase, live.cell_count)
    };
    let body = render_prometheus_metrics(phase, cells, state.observability.snapshot());

    (
        [
            (header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-store"),
        ],
        body,
    )
}

fn render_prometheus_metrics(
    phase: RenderPhase,
    cells: usize,
    observability: ObservabilitySnapshot,
) -> String {
    let mut body = String::new();
    write_metric(
        &mut body,
        "fusemap_grid_cells",
        "gauge",
        "Number of cells in the loaded grid.",
        cells as u64,
    );
    write_metric(
        &mut body,
        "fusemap_ready",
        "gauge",
        "Whether the render controller is ready (1 or 0).",
        u64::from(phase == RenderPhase::Ready),
    );

    let counters = [
        (
            "fusemap_live_snapshots_total",
            "Total live channel snapshots received.",
            observability.live_snapshots_total,
        ),
        (
            "fusemap_forecast_snapshots_total",
            "Total forecast channel snapshots received.",
            observability.forecast_snapshots_total,
        ),
        (
            "fusemap_device_snapshots_total",
            "Total device-status snapshots received.",
            observability.device_snapshots_total,
        ),
        (
            "fusemap_frames_published_total",
            "Total render frames published.",
            observability.frames_published_total,
        ),
        (
            "fusemap_rejected_selections_total",
            "Total selection changes rejected as invalid.",
            observability.rejected_selections_total,
        ),
        (
            "fusemap_geometry_load_failures_total",
            "Total failed grid geometry fetches.",
            observability.geometry_load_failures_total,
        ),
        (
            "fusemap_sse_lagged_total",
            "Total times an SSE subscriber fell behind the broadcast buffer.",
            observability.sse_lagged_total,
        ),
    ];
    for (name, help, value) in counters {
        write_metric(&mut body, name, "counter", help, value);
    }
    body
}

fn write_metric(body: &mut String, name: &str, kind: &str, help: &str, value: u64) {
    let _ = writeln!(body, "# HELP {name} {help}");
    let _ = writeln!(body, "# TYPE {name} {kind}");
    let _ = writeln!(body, "{name} {value}");
}

/// Latest render frame. Unchanged frames answer `If-None-Match` with 304.
pub async fn get_render(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let (phase, json, etag) = {
        let live = state.live.read().await;
        (live.phase, live.render_json.clone(), live.render_etag.clone())
    };

    let Some(json) = json else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "phase": phase })),
        )
            .into_response();
    };

    if let Some(etag) = etag.as_deref()
        && if_none_match_matches(&headers, etag)
    {
        return not_modified_response("no-cache", Some(etag));
    }
    json_bytes_response((*json).clone(), "no-cache", etag.as_deref())
}

pub async fn get_grid(State(state): State<AppState>) -> Response {
    let json = state.live.read().await.grid_json.clone();
    match json {
        Some(json) => json_bytes_response((*json).clone(), "public, max-age=3600", None),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": "grid not loaded" })),
        )
            .into_response(),
    }
}

pub async fn get_selection(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.live.read().await.selection.clone())
}

pub async fn put_selection(
    State(state): State<AppState>,
    Json(patch): Json<SelectionPatch>,
) -> Response {
    match state.submit(SessionEvent::Select(patch)).await {
        Ok(Ok(())) => Json(state.live.read().await.selection.clone()).into_response(),
        Ok(Err(e)) => error_response(&e),
        Err(_) => session_closed_response(),
    }
}

pub async fn get_scales(State(state): State<AppState>) -> impl IntoResponse {
    let scales: Vec<serde_json::Value> = state
        .registry
        .kinds()
        .filter_map(|kind| {
            let scale = state.registry.get(kind)?;
            Some(serde_json::json!({
                "metric": kind,
                "scale": scale,
                "legend": state.registry.legend(kind),
            }))
        })
        .collect();
    Json(scales)
}

pub async fn get_devices_summary(State(state): State<AppState>) -> Response {
    let json = state.live.read().await.devices_json.clone();
    match json {
        Some(json) => json_bytes_response((*json).clone(), "no-cache", None),
        None => json_bytes_response(Bytes::from_static(br#"{"summary":null}"#), "no-cache", None),
    }
}

pub(crate) fn error_response(error: &FuseError) -> Response {
    let status = match error {
        FuseError::InvalidSelection(_) => StatusCode::BAD_REQUEST,
        FuseError::AlreadyLoaded => StatusCode::CONFLICT,
        FuseError::MalformedGeometry { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        FuseError::GeometryLoad(_) => StatusCode::BAD_GATEWAY,
    };
    (status, Json(serde_json::json!({ "error": error.to_string() }))).into_response()
}

pub(crate) fn session_closed_response() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(serde_json::json!({ "error": "session is shutting down" })),
    )
        .into_response()
}

fn json_bytes_response(body: Bytes, cache_control: &'static str, etag: Option<&str>) -> Response {
    let mut response = Response::new(Body::from(body));
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static(cache_control),
    );
    if let Some(etag) = etag
        && let Ok(etag_header) = HeaderValue::from_str(etag)
    {
        headers.insert(header::ETAG, etag_header);
    }
    response
}

fn not_modified_response(cache_control: &'static str, etag: Option<&str>) -> Response {
    let mut response = StatusCode::NOT_MODIFIED.into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static(cache_control),
    );
    if let Some(etag) = etag
        && let Ok(etag_header) = HeaderValue::from_str(etag)
    {
        headers.insert(header::ETAG, etag_header);
    }
    response
}

fn normalize_etag(candidate: &str) -> &str {
    candidate.strip_prefix("W/").unwrap_or(candidate).trim()
}

fn if_none_match_matches(headers: &HeaderMap, etag: &str) -> bool {
    let Some(value) = headers.get(header::IF_NONE_MATCH) else {
        return false;
    };
    let Ok(raw) = value.to_str() else {
        return false;
    };

    raw.split(',').any(|candidate| {
        let candidate = candidate.trim();
        candidate == "*" || normalize_etag(candidate) == normalize_etag(etag)
    })
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use fusemap_shared::{MapEvent, SourceKind};

    use super::*;
    use crate::services::session_worker::tests::{geometry, spawn_worker};

    async fn spawn_test_server(state: AppState) -> (SocketAddr, tokio::task::JoinHandle<()>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("listener address");
        let app = crate::app::build_app(state);
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve test app");
        });
        (addr, handle)
    }

    #[test]
    fn metrics_output_contains_prometheus_help_type_and_values() {
        let observability = ObservabilitySnapshot {
            live_snapshots_total: 12,
            forecast_snapshots_total: 3,
            device_snapshots_total: 7,
            frames_published_total: 99,
            rejected_selections_total: 5,
            geometry_load_failures_total: 2,
            sse_lagged_total: 1,
        };

        let metrics = render_prometheus_metrics(RenderPhase::Ready, 42, observability);

        assert!(metrics.contains("# HELP fusemap_grid_cells"));
        assert!(metrics.contains("# TYPE fusemap_live_snapshots_total counter"));
        assert!(metrics.contains("fusemap_grid_cells 42"));
        assert!(metrics.contains("fusemap_ready 1"));
        assert!(metrics.contains("fusemap_live_snapshots_total 12"));
        assert!(metrics.contains("fusemap_forecast_snapshots_total 3"));
        assert!(metrics.contains("fusemap_device_snapshots_total 7"));
        assert!(metrics.contains("fusemap_frames_published_total 99"));
        assert!(metrics.contains("fusemap_rejected_selections_total 5"));
        assert!(metrics.contains("fusemap_geometry_load_failures_total 2"));
        assert!(metrics.contains("fusemap_sse_lagged_total 1"));
    }

    #[test]
    fn if_none_match_supports_weak_and_multiple_etags() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::IF_NONE_MATCH,
            HeaderValue::from_static("W/\"other\", \"frame-0000002a\""),
        );
        assert!(if_none_match_matches(&headers, "\"frame-0000002a\""));
        assert!(!if_none_match_matches(&headers, "\"frame-00000001\""));
    }

    #[tokio::test]
    async fn render_is_unavailable_until_grid_is_ready() {
        let state = spawn_worker();
        let (addr, server_handle) = spawn_test_server(state).await;

        let response = reqwest::Client::new()
            .get(format!("http://{addr}/api/render"))
            .send()
            .await
            .expect("render request");
        assert_eq!(response.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
        let body: serde_json::Value = response.json().await.expect("json body");
        assert_eq!(body["phase"], "uninitialized");

        server_handle.abort();
        let _ = server_handle.await;
    }

    #[tokio::test]
    async fn render_endpoint_serves_frame_with_etag() {
        let state = spawn_worker();
        state
            .submit(SessionEvent::GeometryLoaded(geometry()))
            .await
            .expect("worker alive")
            .expect("load");
        let (addr, server_handle) = spawn_test_server(state).await;
        let client = reqwest::Client::new();

        let first = client
            .get(format!("http://{addr}/api/render"))
            .send()
            .await
            .expect("render request");
        assert_eq!(first.status(), reqwest::StatusCode::OK);
        let etag = first
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
            .expect("etag header should be present");
        let event: MapEvent = first.json().await.expect("render event");
        let MapEvent::Render { frame, .. } = event else {
            panic!("expected render event");
        };
        assert_eq!(frame.instructions.len(), 2);
        assert_eq!(frame.no_data_count(), 2);

        let second = client
            .get(format!("http://{addr}/api/render"))
            .header(reqwest::header::IF_NONE_MATCH, etag)
            .send()
            .await
            .expect("conditional render request");
        assert_eq!(second.status(), reqwest::StatusCode::NOT_MODIFIED);

        server_handle.abort();
        let _ = server_handle.await;
    }

    #[tokio::test]
    async fn selection_round_trip_and_rejection() {
        let state = spawn_worker();
        let (addr, server_handle) = spawn_test_server(state).await;
        let client = reqwest::Client::new();

        let updated: serde_json::Value = client
            .put(format!("http://{addr}/api/selection"))
            .json(&serde_json::json!({ "source": "forecast", "horizon": 3 }))
            .send()
            .await
            .expect("selection request")
            .error_for_status()
            .expect("selection status")
            .json()
            .await
            .expect("selection body");
        assert_eq!(updated["source"], "forecast");
        assert_eq!(updated["horizon"], 3);

        let rejected = client
            .put(format!("http://{addr}/api/selection"))
            .json(&serde_json::json!({ "metric": "wind" }))
            .send()
            .await
            .expect("selection request");
        assert_eq!(rejected.status(), reqwest::StatusCode::BAD_REQUEST);

        let current: fusemap_shared::Selection = client
            .get(format!("http://{addr}/api/selection"))
            .send()
            .await
            .expect("selection get")
            .json()
            .await
            .expect("selection json");
        assert_eq!(current.source, SourceKind::Forecast);
        assert_eq!(current.metric.as_str(), "temperature");

        server_handle.abort();
        let _ = server_handle.await;
    }

    #[tokio::test]
    async fn health_and_scales_expose_expected_contract() {
        let state = spawn_worker();
        let (addr, server_handle) = spawn_test_server(state).await;
        let client = reqwest::Client::new();

        let health: serde_json::Value = client
            .get(format!("http://{addr}/api/health"))
            .send()
            .await
            .expect("health request")
            .json()
            .await
            .expect("health json");
        assert_eq!(health["status"], "ok");
        assert_eq!(health["cells"], 0);
        assert!(health["observability"]["frames_published_total"].is_u64());

        let scales: Vec<serde_json::Value> = client
            .get(format!("http://{addr}/api/metrics/scales"))
            .send()
            .await
            .expect("scales request")
            .json()
            .await
            .expect("scales json");
        assert_eq!(scales.len(), 2);
        assert_eq!(scales[0]["metric"], "pressure");
        assert_eq!(scales[0]["scale"]["min"], 950.0);

        let devices: serde_json::Value = client
            .get(format!("http://{addr}/api/devices/summary"))
            .send()
            .await
            .expect("devices request")
            .json()
            .await
            .expect("devices json");
        assert!(devices["summary"].is_null());

        server_handle.abort();
        let _ = server_handle.await;
    }

    #[tokio::test]
    async fn health_reports_cached_horizons_and_slice_sizes() {
        let state = spawn_worker();
        state
            .submit(SessionEvent::GeometryLoaded(geometry()))
            .await
            .expect("worker alive")
            .expect("load");
        state
            .submit(SessionEvent::Channel(fusemap_shared::ChannelSnapshot::forecast_series(
                serde_json::json!({
                    "3": { "cell_A": { "avg_temp": 1 }, "cell_B": { "avg_temp": 2 } },
                    "h1": { "cell_A": { "avg_temp": 4 } }
                }),
            )))
            .await
            .expect("worker alive")
            .expect("forecast");
        state
            .submit(SessionEvent::Channel(fusemap_shared::ChannelSnapshot::live(
                serde_json::json!({ "cell_B": { "avg_temp": 9 } }),
            )))
            .await
            .expect("worker alive")
            .expect("live");
        let (addr, server_handle) = spawn_test_server(state).await;
        let client = reqwest::Client::new();

        client
            .put(format!("http://{addr}/api/selection"))
            .json(&serde_json::json!({ "source": "forecast", "horizon": 3 }))
            .send()
            .await
            .expect("selection request")
            .error_for_status()
            .expect("selection accepted");

        let health: serde_json::Value = client
            .get(format!("http://{addr}/api/health"))
            .send()
            .await
            .expect("health request")
            .json()
            .await
            .expect("health json");
        assert_eq!(health["cache"]["horizons"], serde_json::json!([1, 3]));
        assert_eq!(health["cache"]["live_cells"], 1);
        assert_eq!(health["cache"]["selected_cells"], 2);
        assert_eq!(health["cache"]["records"], 4);

        server_handle.abort();
        let _ = server_handle.await;
    }

    #[tokio::test]
    async fn wrongly_typed_selection_is_a_counted_bad_request() {
        let state = spawn_worker();
        let (addr, server_handle) = spawn_test_server(state.clone()).await;
        let client = reqwest::Client::new();

        for body in [
            serde_json::json!({ "horizon": 2.5 }),
            serde_json::json!({ "metric": 7 }),
        ] {
            let response = client
                .put(format!("http://{addr}/api/selection"))
                .json(&body)
                .send()
                .await
                .expect("selection request");
            assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
        }
        assert_eq!(state.observability.snapshot().rejected_selections_total, 2);

        server_handle.abort();
        let _ = server_handle.await;
    }
}
