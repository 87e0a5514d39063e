use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Device-status counts for one telemetry snapshot.
///
/// `slow` is kept as its own bucket; upstream has never settled whether it
/// means active or inactive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceHealthSummary {
    pub devices: u64,
    pub active: u64,
    pub slow: u64,
    pub inactive: u64,
    pub total_readings: u64,
}

/// Summarize `{device_id: {status, readings_last_window}}`. Statuses other
/// than `active` and `slow` (including missing ones) count as inactive.
pub fn summarize(snapshot: &Value) -> DeviceHealthSummary {
    let mut summary = DeviceHealthSummary::default();
    let Some(devices) = snapshot.as_object() else {
        return summary;
    };

    for device in devices.values() {
        summary.devices += 1;
        let status = device
            .get("status")
            .and_then(Value::as_str)
            .map(|s| s.trim().to_ascii_lowercase());
        match status.as_deref() {
            Some("active") => summary.active += 1,
            Some("slow") => summary.slow += 1,
            _ => summary.inactive += 1,
        }
        summary.total_readings += device
            .get("readings_last_window")
            .and_then(Value::as_u64)
            .unwrap_or(0);
    }

    summary
}
