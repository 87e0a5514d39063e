use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::Sse;
use axum::response::sse::{Event, KeepAlive};
use bytes::Bytes;
use futures::stream::Stream;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::warn;

use crate::config::SSE_KEEPALIVE_SECS;
use crate::state::{AppState, PreSerializedEvent};

/// Frame and device-summary stream. A new subscriber first receives the latest
/// of each, then live updates. A subscriber that falls behind gets the latest
/// frame and summary again instead of the skipped ones.
pub async fn map_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = outgoing_events(state)
        .filter_map(|out| sse_event(out.kind, out.seq, &out.json).map(Ok::<_, Infallible>));

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(SSE_KEEPALIVE_SECS))
            .text("keep-alive"),
    )
}

#[derive(Debug, Clone)]
struct Outgoing {
    kind: &'static str,
    seq: u64,
    json: Arc<Bytes>,
}

/// Highest sequence number already sent per event kind. Sequence numbers
/// start at 1, so 0 means nothing was sent yet.
#[derive(Debug, Default)]
struct Cursor {
    render: u64,
    devices: u64,
}

impl Cursor {
    fn slot(&mut self, kind: &'static str) -> &mut u64 {
        if kind == "render" {
            &mut self.render
        } else {
            &mut self.devices
        }
    }

    fn advance(&mut self, kind: &'static str, seq: u64, json: Arc<Bytes>) -> Option<Outgoing> {
        let sent = self.slot(kind);
        if seq <= *sent {
            return None;
        }
        *sent = seq;
        Some(Outgoing { kind, seq, json })
    }

    fn accept(&mut self, event: PreSerializedEvent) -> Option<Outgoing> {
        match event {
            PreSerializedEvent::Render { seq, json } => self.advance("render", seq, json),
            PreSerializedEvent::Devices { seq, json } => self.advance("devices", seq, json),
        }
    }

    async fn catch_up(&mut self, state: &AppState) -> Vec<Outgoing> {
        let (render, devices) = {
            let live = state.live.read().await;
            (
                live.render_json
                    .as_ref()
                    .map(|json| (live.render_seq, Arc::clone(json))),
                live.devices_json
                    .as_ref()
                    .map(|json| (live.devices_seq, Arc::clone(json))),
            )
        };
        let render = render.and_then(|(seq, json)| self.advance("render", seq, json));
        let devices = devices.and_then(|(seq, json)| self.advance("devices", seq, json));
        render.into_iter().chain(devices).collect()
    }
}

fn outgoing_events(state: AppState) -> impl Stream<Item = Outgoing> {
    async_stream::stream! {
        // Subscribe before reading the live view; anything published in
        // between shows up in both and is dropped by the cursor.
        let mut updates = BroadcastStream::new(state.event_tx.subscribe());
        let mut cursor = Cursor::default();
        for out in cursor.catch_up(&state).await {
            yield out;
        }

        while let Some(result) = updates.next().await {
            match result {
                Ok(event) => {
                    if let Some(out) = cursor.accept(event) {
                        yield out;
                    }
                }
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    state.observability.record_sse_lagged();
                    warn!(
                        skipped_events = skipped,
                        "SSE client lagged behind broadcast buffer; replaying latest state"
                    );
                    for out in cursor.catch_up(&state).await {
                        yield out;
                    }
                }
            }
        }
    }
}

fn sse_event(event_type: &str, seq: u64, json: &Bytes) -> Option<Event> {
    let Ok(payload) = std::str::from_utf8(json.as_ref()) else {
        warn!(seq, event = event_type, "event payload is not valid utf-8; dropping SSE event");
        return None;
    };
    Some(
        Event::default()
            .id(seq.to_string())
            .event(event_type)
            .data(payload),
    )
}

#[cfg(test)]
mod tests {
    use fusemap_shared::{MetricRegistry, SessionEvent};
    use tokio::sync::broadcast;

    use super::*;
    use crate::services::session_worker::tests::{geometry, spawn_worker};

    fn payload(label: &str) -> Arc<Bytes> {
        Arc::new(Bytes::from(format!("{{\"label\":\"{label}\"}}")))
    }

    async fn store_latest(state: &AppState, render_seq: u64, devices_seq: Option<u64>) {
        let mut live = state.live.write().await;
        live.render_seq = render_seq;
        live.render_json = Some(payload("render"));
        if let Some(seq) = devices_seq {
            live.devices_seq = seq;
            live.devices_json = Some(payload("devices"));
        }
    }

    async fn next_within(
        stream: &mut (impl Stream<Item = Outgoing> + Unpin),
        millis: u64,
    ) -> Option<Outgoing> {
        tokio::time::timeout(Duration::from_millis(millis), stream.next())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn broadcast_already_covered_by_catch_up_is_not_sent_twice() {
        let (state, _rx) = AppState::new(MetricRegistry::default());
        store_latest(&state, 3, None).await;

        let mut stream = std::pin::pin!(outgoing_events(state.clone()));
        let first = next_within(&mut stream, 500).await.expect("latest frame");
        assert_eq!((first.kind, first.seq), ("render", 3));

        // A publish racing the catch-up read arrives on the broadcast as well.
        let _ = state.event_tx.send(PreSerializedEvent::Render {
            seq: 3,
            json: payload("render"),
        });
        let _ = state.event_tx.send(PreSerializedEvent::Render {
            seq: 4,
            json: payload("render"),
        });

        let next = next_within(&mut stream, 500).await.expect("newer frame");
        assert_eq!((next.kind, next.seq), ("render", 4));
        assert!(next_within(&mut stream, 50).await.is_none());
    }

    #[tokio::test]
    async fn lagged_subscriber_gets_latest_frame_and_devices() {
        let (mut state, _rx) = AppState::new(MetricRegistry::default());
        let (small_tx, _) = broadcast::channel(1);
        state.event_tx = small_tx;

        let mut stream = std::pin::pin!(outgoing_events(state.clone()));
        // First poll subscribes; nothing is published yet.
        assert!(next_within(&mut stream, 50).await.is_none());

        store_latest(&state, 10, Some(11)).await;
        for seq in 8..=10 {
            let _ = state.event_tx.send(PreSerializedEvent::Render {
                seq,
                json: payload("render"),
            });
        }
        let _ = state.event_tx.send(PreSerializedEvent::Devices {
            seq: 11,
            json: payload("devices"),
        });

        let render = next_within(&mut stream, 500).await.expect("replayed frame");
        assert_eq!((render.kind, render.seq), ("render", 10));
        let devices = next_within(&mut stream, 500).await.expect("replayed devices");
        assert_eq!((devices.kind, devices.seq), ("devices", 11));
        assert!(next_within(&mut stream, 50).await.is_none());
        assert_eq!(state.observability.snapshot().sse_lagged_total, 1);
    }

    #[tokio::test]
    async fn new_subscriber_receives_latest_frame_first() {
        let state = spawn_worker();
        state
            .submit(SessionEvent::GeometryLoaded(geometry()))
            .await
            .expect("worker alive")
            .expect("load");

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("listener address");
        let app = crate::app::build_app(state);
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve test app");
        });

        let response = reqwest::Client::new()
            .get(format!("http://{addr}/api/events"))
            .send()
            .await
            .expect("sse request");
        assert_eq!(response.status(), reqwest::StatusCode::OK);

        let mut body = std::pin::pin!(response.bytes_stream());
        let mut received = String::new();
        while !received.contains("\n\n") {
            let chunk = body
                .next()
                .await
                .expect("stream open")
                .expect("chunk");
            received.push_str(&String::from_utf8_lossy(&chunk));
        }
        assert!(received.contains("event: render"));
        assert!(received.contains("\"type\":\"render\""));

        server.abort();
        let _ = server.await;
    }
}
