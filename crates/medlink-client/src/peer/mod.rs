//! Peer connection management.
//!
//! [`PeerTransport`] is the seam to the media transport. [`rtc`] implements it
//! with webrtc-rs; [`loopback`] pairs two in-process transports without any
//! network, for tests and offline runs.

pub mod loopback;
pub mod rtc;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use medlink_common::{IceCandidate, SessionDescription};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::error::TransportError;
use crate::media::{LocalTrack, TrackKind};

/// Connection state reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// A track received from the remote participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
    pub stream_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Message(String),
    Closed,
}

/// Text data channel on an established transport.
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> String;
    fn is_open(&self) -> bool;
    async fn send_text(&self, text: &str) -> Result<(), TransportError>;
    async fn close(&self) -> Result<(), TransportError>;
}

/// A data channel together with the stream of its events.
pub struct ChannelHandle {
    pub channel: Arc<dyn DataChannel>,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

pub enum TransportEvent {
    /// A locally gathered candidate, to be trickled to the peer.
    LocalCandidate(IceCandidate),
    StateChanged(PeerState),
    RemoteTrack(RemoteTrack),
    /// A channel opened by the remote participant.
    DataChannel(ChannelHandle),
}

/// One peer-to-peer media transport.
///
/// Tracks added before [`create_offer`](Self::create_offer) are part of the
/// offer. `create_offer` and `create_answer` also apply the created
/// description locally.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<(), TransportError>;

    /// Swaps the track on the existing sender of `kind` without renegotiating.
    async fn replace_track(
        &self,
        kind: TrackKind,
        track: Arc<LocalTrack>,
    ) -> Result<(), TransportError>;

    async fn create_data_channel(&self, label: &str) -> Result<ChannelHandle, TransportError>;

    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_remote_description(&self, desc: SessionDescription)
        -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    fn connection_state(&self) -> PeerState;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Creates a fresh transport for every call attempt.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
    ) -> Result<(Arc<dyn PeerTransport>, mpsc::UnboundedReceiver<TransportEvent>), TransportError>;
}

/// Owns one transport for the lifetime of a call: the outgoing sender per
/// track kind, the remote tracks seen so far and the last reported state.
pub struct PeerConnectionManager {
    transport: Arc<dyn PeerTransport>,
    outgoing: Mutex<HashMap<TrackKind, Arc<LocalTrack>>>,
    remote: Mutex<Vec<RemoteTrack>>,
    state: watch::Sender<PeerState>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl PeerConnectionManager {
    pub fn new(transport: Arc<dyn PeerTransport>) -> Self {
        let (state, _) = watch::channel(PeerState::New);
        Self {
            transport,
            outgoing: Mutex::new(HashMap::new()),
            remote: Mutex::new(Vec::new()),
            state,
        }
    }

    pub fn transport(&self) -> &Arc<dyn PeerTransport> {
        &self.transport
    }

    /// Adds a local track; it gets its own sender keyed by kind.
    pub async fn publish(&self, track: Arc<LocalTrack>) -> Result<(), TransportError> {
        let kind = track.kind();
        self.transport.add_track(Arc::clone(&track)).await?;
        debug!(track = track.id(), kind = kind.as_str(), "published local track");
        lock(&self.outgoing).insert(kind, track);
        Ok(())
    }

    /// Replaces the outgoing track of `track.kind()` in place and returns the
    /// track it displaced.
    pub async fn replace_track(
        &self,
        track: Arc<LocalTrack>,
    ) -> Result<Option<Arc<LocalTrack>>, TransportError> {
        let kind = track.kind();
        if !lock(&self.outgoing).contains_key(&kind) {
            return Err(TransportError::NoSender(kind.as_str()));
        }
        self.transport
            .replace_track(kind, Arc::clone(&track))
            .await?;
        info!(track = track.id(), kind = kind.as_str(), "outgoing track replaced");
        Ok(lock(&self.outgoing).insert(kind, track))
    }

    pub fn outgoing(&self, kind: TrackKind) -> Option<Arc<LocalTrack>> {
        lock(&self.outgoing).get(&kind).cloned()
    }

    pub fn record_remote(&self, track: RemoteTrack) {
        info!(track = %track.id, kind = track.kind.as_str(), "remote track received");
        let mut remote = lock(&self.remote);
        if !remote.iter().any(|t| t.id == track.id) {
            remote.push(track);
        }
    }

    pub fn remote_tracks(&self) -> Vec<RemoteTrack> {
        lock(&self.remote).clone()
    }

    pub fn set_state(&self, state: PeerState) {
        self.state.send_replace(state);
    }

    pub fn state(&self) -> PeerState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<PeerState> {
        self.state.subscribe()
    }

    pub async fn close(&self) -> Result<(), TransportError> {
        self.transport.close().await?;
        self.set_state(PeerState::Closed);
        Ok(())
    }
}
