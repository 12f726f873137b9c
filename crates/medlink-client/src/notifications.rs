//! Client side of the notification stream.
//!
//! Reads `GET /api/notifications/stream` as Server-Sent Events and republishes
//! every envelope on a local [`NotificationBus`]. A dropped stream is not an
//! error for anyone listening: the listener waits and reconnects until its
//! owner stops it.

use std::time::Duration;

use futures_util::StreamExt;
use medlink_common::{NotificationBus, NotificationEvent, NotificationKind};
use reqwest::header::ACCEPT;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::RelayError;
use crate::negotiation::Liveness;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Splits an SSE byte stream into the `data` payload of each event.
#[derive(Default)]
struct SseParser {
    buffer: Vec<u8>,
}

impl SseParser {
    fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend(chunk.iter().copied().filter(|b| *b != b'\r'));
        let mut payloads = Vec::new();
        while let Some(end) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let block: Vec<u8> = self.buffer.drain(..end + 2).collect();
            let block = String::from_utf8_lossy(&block[..end]);
            let data: Vec<&str> = block
                .lines()
                .filter_map(|line| line.strip_prefix("data:"))
                .map(|value| value.strip_prefix(' ').unwrap_or(value))
                .collect();
            if !data.is_empty() {
                payloads.push(data.join("\n"));
            }
        }
        payloads
    }
}

pub struct NotificationListener {
    client: reqwest::Client,
    url: String,
    identity: String,
    bus: NotificationBus,
    retry: Duration,
}

impl NotificationListener {
    pub fn new(
        config: &ClientConfig,
        identity: &str,
        bus: NotificationBus,
    ) -> Result<Self, RelayError> {
        // No overall timeout: the stream stays open for as long as it can.
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        let url = reqwest::Url::parse_with_params(
            &format!("{}/api/notifications/stream", config.gateway_url),
            &[("identity", identity)],
        )
        .map_err(|e| RelayError::Decode(e.to_string()))?;
        Ok(Self {
            client,
            url: url.to_string(),
            identity: identity.to_string(),
            bus,
            retry: config.notification_retry,
        })
    }

    pub fn bus(&self) -> &NotificationBus {
        &self.bus
    }

    pub fn spawn(self, live: Liveness) -> JoinHandle<()> {
        tokio::spawn(self.run(live))
    }

    /// Keeps a stream open until `live` drops, reconnecting after every
    /// disconnect.
    pub async fn run(self, live: Liveness) {
        while live.is_live() {
            match self.stream_once(&live).await {
                Ok(()) => info!(identity = %self.identity, "notification stream closed"),
                Err(err) => warn!(identity = %self.identity, "notification stream failed: {}", err),
            }
            if live.sleep(self.retry).await.is_err() {
                break;
            }
            debug!(identity = %self.identity, "reconnecting notification stream");
        }
    }

    async fn stream_once(&self, live: &Liveness) -> Result<(), RelayError> {
        let response = self
            .client
            .get(&self.url)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::Status {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        let mut stream = response.bytes_stream();
        let mut parser = SseParser::default();
        loop {
            let chunk = tokio::select! {
                chunk = stream.next() => chunk,
                _ = live.cancelled() => return Ok(()),
            };
            match chunk {
                None => return Ok(()),
                Some(Err(err)) => return Err(err.into()),
                Some(Ok(bytes)) => {
                    for payload in parser.feed(&bytes) {
                        self.dispatch(&payload);
                    }
                }
            }
        }
    }

    fn dispatch(&self, payload: &str) {
        match serde_json::from_str::<NotificationEvent>(payload) {
            Ok(event) => {
                if event.kind == NotificationKind::Ping {
                    debug!("notification ping");
                } else {
                    info!(
                        kind = event.kind.as_str(),
                        session_id = ?event.session_id,
                        "notification received"
                    );
                }
                self.bus.publish(&event);
            }
            Err(err) => warn!("ignoring malformed notification: {}", err),
        }
    }
}
