use std::time::Duration;

use fusemap_shared::{FuseError, GeometryDocument, SessionEvent};
use tracing::{error, info, warn};

use crate::config::{GEOMETRY_RETRY_BASE_MS, GEOMETRY_RETRY_MAX_MS};
use crate::state::AppState;

/// Fetch the grid once. Transport and parse failures are retried with
/// exponential backoff; a structurally invalid document is not.
pub async fn run(state: AppState, source: String) {
    let mut consecutive_failures = 0u32;

    loop {
        if state.send(SessionEvent::GeometryRequested).await.is_err() {
            return;
        }

        match fetch_geometry(&state.http_client, &source).await {
            Ok(document) => {
                let features = document.features.len();
                match state.submit(SessionEvent::GeometryLoaded(document)).await {
                    Ok(Ok(())) => info!(%source, features, "grid geometry installed"),
                    Ok(Err(e)) => error!(%source, error = %e, "grid geometry rejected"),
                    Err(_) => warn!("session closed before geometry was installed"),
                }
                return;
            }
            Err(e) => {
                state.observability.record_geometry_load_failure();
                consecutive_failures = consecutive_failures.saturating_add(1);
                let backoff = retry_backoff(consecutive_failures);
                warn!(
                    %source,
                    error = %e,
                    attempt = consecutive_failures,
                    backoff_ms = backoff.as_millis() as u64,
                    "failed to load grid, retrying"
                );
                if state
                    .send(SessionEvent::GeometryFailed(e.to_string()))
                    .await
                    .is_err()
                {
                    return;
                }
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

fn retry_backoff(consecutive_failures: u32) -> Duration {
    let exponent = consecutive_failures.saturating_sub(1).min(10);
    let factor = 1u64 << exponent;
    Duration::from_millis((GEOMETRY_RETRY_BASE_MS * factor).min(GEOMETRY_RETRY_MAX_MS))
}

pub async fn fetch_geometry(
    client: &reqwest::Client,
    source: &str,
) -> Result<GeometryDocument, FuseError> {
    let bytes = if source.starts_with("http://") || source.starts_with("https://") {
        let resp = client
            .get(source)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| FuseError::GeometryLoad(e.to_string()))?;
        resp.bytes()
            .await
            .map_err(|e| FuseError::GeometryLoad(e.to_string()))?
            .to_vec()
    } else {
        tokio::fs::read(source)
            .await
            .map_err(|e| FuseError::GeometryLoad(format!("{source}: {e}")))?
    };
    GeometryDocument::from_slice(&bytes)
}
