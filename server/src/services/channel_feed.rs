use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use futures::stream::Stream;
use fusemap_shared::{Channel, ChannelSnapshot, SessionEvent};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::state::AppState;

/// Subscribe to one upstream channel. The upstream (e.g. a realtime database
/// REST endpoint) always returns the complete current value, so each poll
/// whose body differs from the previous one becomes a snapshot event.
pub fn subscribe(
    client: reqwest::Client,
    channel: Channel,
    url: String,
    interval: Duration,
) -> impl Stream<Item = ChannelSnapshot> {
    async_stream::stream! {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_body: Option<Bytes> = None;

        loop {
            ticker.tick().await;

            let body = match fetch_body(&client, &url).await {
                Ok(body) => body,
                Err(e) => {
                    warn!(channel = channel.as_str(), error = %e, "failed to poll upstream channel");
                    continue;
                }
            };
            if last_body.as_ref() == Some(&body) {
                continue;
            }

            match serde_json::from_slice::<Value>(&body) {
                Ok(payload) => {
                    last_body = Some(body);
                    debug!(channel = channel.as_str(), "upstream channel changed");
                    yield ChannelSnapshot { channel, horizon: None, payload };
                }
                Err(e) => {
                    warn!(channel = channel.as_str(), error = %e, "upstream channel sent invalid JSON");
                }
            }
        }
    }
}

async fn fetch_body(client: &reqwest::Client, url: &str) -> Result<Bytes, reqwest::Error> {
    client.get(url).send().await?.error_for_status()?.bytes().await
}

/// Forward a channel subscription into the session until either side closes.
pub async fn run(state: AppState, channel: Channel, url: String, interval: Duration) {
    info!(channel = channel.as_str(), %url, "subscribing to upstream channel");
    let mut snapshots = std::pin::pin!(subscribe(state.http_client.clone(), channel, url, interval));

    while let Some(snapshot) = snapshots.next().await {
        if state.send(SessionEvent::Channel(snapshot)).await.is_err() {
            break;
        }
    }
    info!(channel = channel.as_str(), "channel subscription ended");
}
