use std::str::FromStr;
use std::time::Duration;

use fusemap_shared::{Channel, MetricKind, MetricRegistry};
use tracing::warn;

pub const DEFAULT_SERVER_PORT: u16 = 3000;
pub const DEFAULT_GEOMETRY_SOURCE: &str = "grids.geojson";

pub const DEFAULT_FEED_POLL_INTERVAL_SECS: u64 = 5;
pub const GEOMETRY_RETRY_BASE_MS: u64 = 500;
pub const GEOMETRY_RETRY_MAX_MS: u64 = 30_000;

pub const SSE_KEEPALIVE_SECS: u64 = 15;
pub const DEFAULT_BROADCAST_BUFFER: usize = 256;
pub const DEFAULT_SESSION_EVENT_BUFFER: usize = 1024;
pub const DEFAULT_UPSTREAM_HTTP_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_UPSTREAM_CONNECT_TIMEOUT_SECS: u64 = 3;

fn positive_env<T>(key: &str) -> Option<T>
where
    T: FromStr + PartialOrd + Default,
{
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<T>().ok())
        .filter(|value| *value > T::default())
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn server_port() -> u16 {
    positive_env("SERVER_PORT").unwrap_or(DEFAULT_SERVER_PORT)
}

/// File path or `http(s)` URL of the grid feature collection.
pub fn geometry_source() -> String {
    non_empty_env("GEOMETRY_SOURCE").unwrap_or_else(|| DEFAULT_GEOMETRY_SOURCE.to_string())
}

/// Upstream URL for a channel subscription, if one is configured.
pub fn feed_url(channel: Channel) -> Option<String> {
    let key = match channel {
        Channel::Live => "LIVE_FEED_URL",
        Channel::Forecast => "FORECAST_FEED_URL",
        Channel::DeviceStatus => "DEVICE_STATUS_URL",
    };
    non_empty_env(key)
}

pub fn feed_poll_interval() -> Duration {
    Duration::from_secs(
        positive_env("FEED_POLL_INTERVAL_SECS").unwrap_or(DEFAULT_FEED_POLL_INTERVAL_SECS),
    )
}

pub fn sse_broadcast_buffer() -> usize {
    positive_env("SSE_BROADCAST_BUFFER").unwrap_or(DEFAULT_BROADCAST_BUFFER)
}

pub fn session_event_buffer() -> usize {
    positive_env("SESSION_EVENT_BUFFER").unwrap_or(DEFAULT_SESSION_EVENT_BUFFER)
}

pub fn upstream_http_timeout() -> Duration {
    Duration::from_secs(
        positive_env("UPSTREAM_HTTP_TIMEOUT_SECS").unwrap_or(DEFAULT_UPSTREAM_HTTP_TIMEOUT_SECS),
    )
}

pub fn upstream_connect_timeout() -> Duration {
    Duration::from_secs(
        positive_env("UPSTREAM_CONNECT_TIMEOUT_SECS")
            .unwrap_or(DEFAULT_UPSTREAM_CONNECT_TIMEOUT_SECS),
    )
}

/// Metric scales: built-ins, then `METRIC_SCALES_PATH`, then per-metric
/// `<METRIC>_SCALE_MIN` / `<METRIC>_SCALE_MAX` bound overrides.
pub fn metric_registry() -> MetricRegistry {
    let mut registry = match non_empty_env("METRIC_SCALES_PATH") {
        Some(path) => match std::fs::read_to_string(&path)
            .map_err(|e| e.to_string())
            .and_then(|json| MetricRegistry::with_overrides_json(&json).map_err(|e| e.to_string()))
        {
            Ok(registry) => registry,
            Err(e) => {
                warn!(%path, error = %e, "failed to read metric scales, using built-ins");
                MetricRegistry::default()
            }
        },
        None => MetricRegistry::default(),
    };

    let kinds: Vec<MetricKind> = registry.kinds().cloned().collect();
    for kind in kinds {
        let prefix = kind.as_str().to_ascii_uppercase();
        let min = env_f64(&format!("{prefix}_SCALE_MIN"));
        let max = env_f64(&format!("{prefix}_SCALE_MAX"));
        if min.is_none() && max.is_none() {
            continue;
        }
        let Some(scale) = registry.get(&kind) else {
            continue;
        };
        let (min, max) = (min.unwrap_or(scale.min), max.unwrap_or(scale.max));
        if min >= max {
            warn!(metric = %kind, min, max, "ignoring inverted scale bounds");
            continue;
        }
        registry.set_bounds(&kind, min, max);
    }
    registry
}

fn env_f64(key: &str) -> Option<f64> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<f64>().ok())
        .filter(|value| value.is_finite())
}
