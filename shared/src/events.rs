use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::health::DeviceHealthSummary;
use crate::render::RenderFrame;

/// Upstream subscription channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Live,
    Forecast,
    DeviceStatus,
}

impl Channel {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Forecast => "forecast",
            Self::DeviceStatus => "device_status",
        }
    }
}

/// One complete push on a channel. For forecast, `horizon: None` means the
/// payload is an hour-indexed series; `Some(h)` is a single slice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSnapshot {
    pub channel: Channel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub horizon: Option<u32>,
    pub payload: Value,
}

impl ChannelSnapshot {
    pub fn live(payload: Value) -> Self {
        Self {
            channel: Channel::Live,
            horizon: None,
            payload,
        }
    }

    pub fn forecast_series(payload: Value) -> Self {
        Self {
            channel: Channel::Forecast,
            horizon: None,
            payload,
        }
    }

    pub fn forecast_slice(horizon: u32, payload: Value) -> Self {
        Self {
            channel: Channel::Forecast,
            horizon: Some(horizon),
            payload,
        }
    }

    pub fn device_status(payload: Value) -> Self {
        Self {
            channel: Channel::DeviceStatus,
            horizon: None,
            payload,
        }
    }
}

/// Events pushed to map subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MapEvent {
    Render {
        seq: u64,
        timestamp: String,
        frame: RenderFrame,
    },
    Devices {
        seq: u64,
        timestamp: String,
        summary: DeviceHealthSummary,
    },
}
