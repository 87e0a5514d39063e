use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use fusemap_shared::{
    Channel, FuseResult, MetricRegistry, RenderPhase, Selection, SessionEvent,
};
use tokio::sync::{RwLock, broadcast, mpsc, oneshot};
use tracing::warn;

use crate::config::{
    session_event_buffer, sse_broadcast_buffer, upstream_connect_timeout, upstream_http_timeout,
};

/// Pre-serialized SSE event, serialized once by the session worker and shared
/// by all subscribers.
#[derive(Debug, Clone)]
pub enum PreSerializedEvent {
    Render { seq: u64, json: Arc<Bytes> },
    Devices { seq: u64, json: Arc<Bytes> },
}

/// Read model of the session, refreshed by the worker after every event.
#[derive(Debug, Clone)]
pub struct LiveView {
    pub phase: RenderPhase,
    pub selection: Selection,
    pub cell_count: usize,
    /// Forecast horizons currently cached, ascending.
    pub horizons: Vec<u32>,
    pub live_cells: usize,
    /// Cells with a record in the slice the selection points at.
    pub selected_cells: usize,
    pub cached_records: usize,
    pub render_seq: u64,
    /// Latest `MapEvent::Render` payload; `None` until the grid is ready.
    pub render_json: Option<Arc<Bytes>>,
    pub render_etag: Option<String>,
    pub devices_seq: u64,
    pub devices_json: Option<Arc<Bytes>>,
    pub grid_json: Option<Arc<Bytes>>,
}

impl Default for LiveView {
    fn default() -> Self {
        Self {
            phase: RenderPhase::Uninitialized,
            selection: Selection::default(),
            cell_count: 0,
            horizons: Vec::new(),
            live_cells: 0,
            selected_cells: 0,
            cached_records: 0,
            render_seq: 0,
            render_json: None,
            render_etag: None,
            devices_seq: 0,
            devices_json: None,
            grid_json: None,
        }
    }
}

/// A session event plus an optional reply slot for request/response callers.
#[derive(Debug)]
pub struct SessionCommand {
    pub event: SessionEvent,
    pub reply: Option<oneshot::Sender<FuseResult<()>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionClosed;

#[derive(Clone)]
pub struct AppState {
    pub session_tx: mpsc::Sender<SessionCommand>,
    pub live: Arc<RwLock<LiveView>>,
    pub next_seq: Arc<AtomicU64>,
    pub event_tx: broadcast::Sender<PreSerializedEvent>,
    /// Immutable after startup; the session owns its own copy.
    pub registry: Arc<MetricRegistry>,
    pub http_client: reqwest::Client,
    pub observability: Arc<ObservabilityCounters>,
}

#[derive(Debug, Default)]
pub struct ObservabilityCounters {
    live_snapshots_total: AtomicU64,
    forecast_snapshots_total: AtomicU64,
    device_snapshots_total: AtomicU64,
    frames_published_total: AtomicU64,
    rejected_selections_total: AtomicU64,
    geometry_load_failures_total: AtomicU64,
    sse_lagged_total: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub struct ObservabilitySnapshot {
    pub live_snapshots_total: u64,
    pub forecast_snapshots_total: u64,
    pub device_snapshots_total: u64,
    pub frames_published_total: u64,
    pub rejected_selections_total: u64,
    pub geometry_load_failures_total: u64,
    pub sse_lagged_total: u64,
}

impl ObservabilityCounters {
    pub fn snapshot(&self) -> ObservabilitySnapshot {
        ObservabilitySnapshot {
            live_snapshots_total: self.live_snapshots_total.load(Ordering::Relaxed),
            forecast_snapshots_total: self.forecast_snapshots_total.load(Ordering::Relaxed),
            device_snapshots_total: self.device_snapshots_total.load(Ordering::Relaxed),
            frames_published_total: self.frames_published_total.load(Ordering::Relaxed),
            rejected_selections_total: self.rejected_selections_total.load(Ordering::Relaxed),
            geometry_load_failures_total: self
                .geometry_load_failures_total
                .load(Ordering::Relaxed),
            sse_lagged_total: self.sse_lagged_total.load(Ordering::Relaxed),
        }
    }

    pub fn record_snapshot(&self, channel: Channel) {
        let counter = match channel {
            Channel::Live => &self.live_snapshots_total,
            Channel::Forecast => &self.forecast_snapshots_total,
            Channel::DeviceStatus => &self.device_snapshots_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frame_published(&self) {
        self.frames_published_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected_selection(&self) {
        self.rejected_selections_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_geometry_load_failure(&self) {
        self.geometry_load_failures_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sse_lagged(&self) {
        self.sse_lagged_total.fetch_add(1, Ordering::Relaxed);
    }
}

impl AppState {
    /// Build the shared state and the receiving end of the session channel,
    /// which belongs to the session worker.
    pub fn new(registry: MetricRegistry) -> (Self, mpsc::Receiver<SessionCommand>) {
        let (event_tx, _) = broadcast::channel(sse_broadcast_buffer());
        let (session_tx, session_rx) = mpsc::channel(session_event_buffer());
        let request_timeout = upstream_http_timeout();
        let connect_timeout = upstream_connect_timeout();
        let http_client = reqwest::Client::builder()
            .user_agent("fusemap/0.1")
            .timeout(request_timeout)
            .connect_timeout(connect_timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "failed to build configured HTTP client, using defaults");
                reqwest::Client::new()
            });

        let state = Self {
            session_tx,
            live: Arc::new(RwLock::new(LiveView::default())),
            next_seq: Arc::new(AtomicU64::new(0)),
            event_tx,
            registry: Arc::new(registry),
            http_client,
            observability: Arc::new(ObservabilityCounters::default()),
        };
        (state, session_rx)
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Queue an event without waiting for it to be handled.
    pub async fn send(&self, event: SessionEvent) -> Result<(), SessionClosed> {
        if let SessionEvent::Channel(snapshot) = &event {
            self.observability.record_snapshot(snapshot.channel);
        }
        self.session_tx
            .send(SessionCommand { event, reply: None })
            .await
            .map_err(|_| SessionClosed)
    }

    /// Queue an event and wait until the worker has handled and published it.
    pub async fn submit(&self, event: SessionEvent) -> Result<FuseResult<()>, SessionClosed> {
        if let SessionEvent::Channel(snapshot) = &event {
            self.observability.record_snapshot(snapshot.channel);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.session_tx
            .send(SessionCommand {
                event,
                reply: Some(reply_tx),
            })
            .await
            .map_err(|_| SessionClosed)?;
        reply_rx.await.map_err(|_| SessionClosed)
    }
}
