//! Text chat over the `chat` data channel.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use medlink_common::ChatPayload;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::CallError;
use crate::negotiation::Liveness;
use crate::peer::{ChannelEvent, ChannelHandle, DataChannel};

pub const CHAT_LABEL: &str = "chat";
pub const LOCAL_SENDER: &str = "You";
pub const SYSTEM_SENDER: &str = "System";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub sender: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    fn new(sender: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender: sender.into(),
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct ChatInner {
    local_name: String,
    channel: Mutex<Option<Arc<dyn DataChannel>>>,
    open: watch::Sender<bool>,
    transcript: Mutex<Vec<ChatMessage>>,
    messages: broadcast::Sender<ChatMessage>,
}

impl ChatInner {
    fn push(&self, message: ChatMessage) {
        lock(&self.transcript).push(message.clone());
        let _ = self.messages.send(message);
    }
}

/// The in-call chat and its transcript. Clones share the same channel.
///
/// The channel is optional: until one is attached and reports open, sending
/// fails with [`CallError::ChannelUnavailable`] and the call itself is not
/// affected.
#[derive(Clone)]
pub struct ChatChannel {
    inner: Arc<ChatInner>,
}

impl ChatChannel {
    pub fn new(local_name: impl Into<String>) -> Self {
        let (open, _) = watch::channel(false);
        let (messages, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(ChatInner {
                local_name: local_name.into(),
                channel: Mutex::new(None),
                open,
                transcript: Mutex::new(Vec::new()),
                messages,
            }),
        }
    }

    /// Takes over a data channel, created locally or announced by the peer,
    /// and appends incoming messages to the transcript until it closes or
    /// `live` drops.
    pub fn attach(&self, handle: ChannelHandle, live: Liveness) {
        let ChannelHandle {
            channel,
            mut events,
        } = handle;
        if !live.is_live() {
            tokio::spawn(async move {
                let _ = channel.close().await;
            });
            return;
        }
        if channel.is_open() {
            self.inner.open.send_replace(true);
        }
        *lock(&self.inner.channel) = Some(channel);

        let weak: Weak<ChatInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    event = events.recv() => event,
                    _ = live.cancelled() => None,
                };
                let Some(event) = event else {
                    break;
                };
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                match event {
                    ChannelEvent::Open => {
                        info!("chat channel open");
                        inner.open.send_replace(true);
                    }
                    ChannelEvent::Message(raw) => match serde_json::from_str::<ChatPayload>(&raw) {
                        Ok(payload) => inner.push(ChatMessage::new(payload.sender, payload.text)),
                        Err(err) => warn!("dropping malformed chat message: {}", err),
                    },
                    ChannelEvent::Closed => {
                        inner.open.send_replace(false);
                        if live.is_live() {
                            inner.push(ChatMessage::new(SYSTEM_SENDER, "Chat disconnected"));
                        }
                        break;
                    }
                }
            }
            debug!("chat receive loop finished");
        });
    }

    /// Appends the message to the local transcript, then sends it.
    pub async fn send(&self, text: &str) -> Result<ChatMessage, CallError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(CallError::InvalidState("empty chat message".to_string()));
        }
        let channel = lock(&self.inner.channel)
            .clone()
            .filter(|channel| channel.is_open())
            .ok_or_else(|| CallError::ChannelUnavailable("chat channel is not open".to_string()))?;

        let payload = serde_json::to_string(&ChatPayload {
            sender: self.inner.local_name.clone(),
            text: text.to_string(),
        })
        .map_err(|e| CallError::InvalidState(e.to_string()))?;

        let message = ChatMessage::new(LOCAL_SENDER, text);
        self.inner.push(message.clone());
        channel
            .send_text(&payload)
            .await
            .map_err(|e| CallError::ChannelUnavailable(e.to_string()))?;
        Ok(message)
    }

    pub fn transcript(&self) -> Vec<ChatMessage> {
        lock(&self.inner.transcript).clone()
    }

    /// Every message appended from now on, local and remote.
    pub fn subscribe(&self) -> broadcast::Receiver<ChatMessage> {
        self.inner.messages.subscribe()
    }

    pub fn is_open(&self) -> bool {
        *self.inner.open.borrow()
    }

    /// Waits up to `timeout` for the channel to open.
    pub async fn wait_open(&self, timeout: Duration) -> bool {
        let mut rx = self.inner.open.subscribe();
        let opened = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|open| *open)).await,
            Ok(Ok(_))
        );
        opened
    }

    pub async fn close(&self) {
        let channel = lock(&self.inner.channel).take();
        self.inner.open.send_replace(false);
        if let Some(channel) = channel {
            if let Err(err) = channel.close().await {
                debug!("closing chat channel: {}", err);
            }
        }
    }
}
