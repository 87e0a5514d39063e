use axum::Router;
use axum::routing::{get, post};
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;

use crate::routes;
use crate::state::AppState;

pub(crate) fn build_app(state: AppState) -> Router {
    let ingest = Router::new()
        .route("/live", post(routes::ingest::ingest_live))
        .route("/forecast", post(routes::ingest::ingest_forecast))
        .route(
            "/forecast/{horizon}",
            post(routes::ingest::ingest_forecast_slice),
        )
        .route("/devices", post(routes::ingest::ingest_devices));

    Router::new()
        .route("/api/render", get(routes::api::get_render))
        .route("/api/grid", get(routes::api::get_grid))
        .route(
            "/api/selection",
            get(routes::api::get_selection).put(routes::api::put_selection),
        )
        .route("/api/metrics/scales", get(routes::api::get_scales))
        .route(
            "/api/devices/summary",
            get(routes::api::get_devices_summary),
        )
        .route("/api/events", get(routes::sse::map_events))
        .route("/api/health", get(routes::api::health))
        .route("/api/metrics", get(routes::api::metrics))
        .nest("/api/ingest", ingest)
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
