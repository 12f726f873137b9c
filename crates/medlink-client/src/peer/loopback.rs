//! In-process transport pairs.
//!
//! Two loopback transports created by the same [`LoopbackFactory`] find each
//! other through the descriptions they exchange. They report `Connected` once
//! both sides have applied a local and a remote description and received at
//! least one candidate from the other side, which mirrors the order a real
//! transport needs. Tracks, data channels and close notifications cross over
//! in memory.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use medlink_common::{IceCandidate, SdpType, SessionDescription};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use super::{
    ChannelEvent, ChannelHandle, DataChannel, PeerState, PeerTransport, RemoteTrack,
    TransportEvent, TransportFactory,
};
use crate::error::TransportError;
use crate::media::{LocalTrack, TrackKind};

const ID_ATTR: &str = "a=loopback-id:";
const TRACK_ATTR: &str = "a=loopback-track:";
const CHANNEL_ATTR: &str = "a=loopback-channel:";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct Network {
    transports: Mutex<HashMap<String, Weak<LoopbackTransport>>>,
    /// Serialises pairing so both sides flip to connected together.
    link: Mutex<()>,
    next_port: AtomicUsize,
}

/// Hands out transports that can reach each other.
#[derive(Clone, Default)]
pub struct LoopbackFactory {
    network: Arc<Network>,
    created: Arc<Mutex<Vec<Arc<LoopbackTransport>>>>,
}

impl LoopbackFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every transport created so far, oldest first.
    pub fn transports(&self) -> Vec<Arc<LoopbackTransport>> {
        lock(&self.created).clone()
    }
}

#[async_trait]
impl TransportFactory for LoopbackFactory {
    async fn create(
        &self,
    ) -> Result<(Arc<dyn PeerTransport>, mpsc::UnboundedReceiver<TransportEvent>), TransportError>
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(LoopbackTransport {
            id: Uuid::new_v4().to_string(),
            network: Arc::clone(&self.network),
            events: tx,
            inner: Mutex::new(Inner::default()),
            offers_created: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        });
        lock(&self.network.transports).insert(transport.id.clone(), Arc::downgrade(&transport));
        lock(&self.created).push(Arc::clone(&transport));
        let transport: Arc<dyn PeerTransport> = transport;
        Ok((transport, rx))
    }
}

struct Inner {
    state: PeerState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    tracks: Vec<Arc<LocalTrack>>,
    outgoing: HashMap<TrackKind, Arc<LocalTrack>>,
    channels: Vec<Arc<LoopbackChannel>>,
    remote_candidates: Vec<IceCandidate>,
    peer: Option<Weak<LoopbackTransport>>,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            state: PeerState::New,
            local: None,
            remote: None,
            tracks: Vec::new(),
            outgoing: HashMap::new(),
            channels: Vec::new(),
            remote_candidates: Vec::new(),
            peer: None,
        }
    }
}

impl Inner {
    fn ready(&self) -> bool {
        self.local.is_some()
            && self.remote.is_some()
            && !self.remote_candidates.is_empty()
            && matches!(self.state, PeerState::New | PeerState::Connecting)
    }
}

pub struct LoopbackTransport {
    id: String,
    network: Arc<Network>,
    events: mpsc::UnboundedSender<TransportEvent>,
    inner: Mutex<Inner>,
    offers_created: AtomicUsize,
    closes: AtomicUsize,
}

impl LoopbackTransport {
    /// How many offers this side created; a track swap must leave it unchanged.
    pub fn offers_created(&self) -> usize {
        self.offers_created.load(Ordering::SeqCst)
    }

    /// How many times `close` was called.
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Id of the track currently sent for `kind`.
    pub fn outgoing_track_id(&self, kind: TrackKind) -> Option<String> {
        lock(&self.inner)
            .outgoing
            .get(&kind)
            .map(|track| track.id().to_string())
    }

    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        lock(&self.inner).remote_candidates.clone()
    }

    /// Reports a state change as if the network had caused it.
    pub fn simulate_state(&self, state: PeerState) {
        lock(&self.inner).state = state;
        let _ = self.events.send(TransportEvent::StateChanged(state));
    }

    fn peer(&self) -> Option<Arc<LoopbackTransport>> {
        lock(&self.inner).peer.as_ref().and_then(Weak::upgrade)
    }

    fn describe(&self, sdp_type: SdpType) -> SessionDescription {
        let inner = lock(&self.inner);
        let mut sdp = format!(
            "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n{}{}\r\n",
            ID_ATTR, self.id
        );
        for track in &inner.tracks {
            sdp.push_str(&format!(
                "m={} 9 UDP/TLS/RTP/SAVPF 0\r\n{}{}\r\n",
                track.kind().as_str(),
                TRACK_ATTR,
                track.id()
            ));
        }
        for channel in &inner.channels {
            sdp.push_str(&format!("{}{}\r\n", CHANNEL_ATTR, channel.label));
        }
        SessionDescription { sdp_type, sdp }
    }

    fn apply_local(&self, desc: SessionDescription) {
        {
            let mut inner = lock(&self.inner);
            inner.local = Some(desc);
            if inner.state == PeerState::New {
                inner.state = PeerState::Connecting;
            }
        }
        let _ = self
            .events
            .send(TransportEvent::StateChanged(PeerState::Connecting));

        let port = 50_000 + self.network.next_port.fetch_add(1, Ordering::SeqCst);
        let candidate = IceCandidate {
            candidate: format!(
                "candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host",
                port, port
            ),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        let _ = self.events.send(TransportEvent::LocalCandidate(candidate));
        self.try_connect();
    }

    /// Connects both sides once each is ready. Runs under the network link
    /// lock so the pair transitions exactly once.
    fn try_connect(&self) {
        let _link = lock(&self.network.link);
        let Some(peer) = self.peer() else {
            return;
        };
        if !lock(&self.inner).ready() || !lock(&peer.inner).ready() {
            return;
        }

        let (my_tracks, my_channels) = self.connect_locked();
        let (peer_tracks, peer_channels) = peer.connect_locked();

        for track in &my_tracks {
            let _ = peer.events.send(TransportEvent::RemoteTrack(remote_of(track)));
        }
        for track in &peer_tracks {
            let _ = self.events.send(TransportEvent::RemoteTrack(remote_of(track)));
        }
        for channel in my_channels {
            peer.accept_channel(&channel);
        }
        for channel in peer_channels {
            self.accept_channel(&channel);
        }
        debug!(a = %self.id, b = %peer.id, "loopback pair connected");
    }

    fn connect_locked(&self) -> (Vec<Arc<LocalTrack>>, Vec<Arc<LoopbackChannel>>) {
        let snapshot = {
            let mut inner = lock(&self.inner);
            inner.state = PeerState::Connected;
            (inner.tracks.clone(), inner.channels.clone())
        };
        let _ = self
            .events
            .send(TransportEvent::StateChanged(PeerState::Connected));
        snapshot
    }

    fn accept_channel(&self, remote: &Arc<LoopbackChannel>) {
        let (local, events) = LoopbackChannel::new(&remote.label);
        local.link(remote);
        lock(&self.inner).channels.push(Arc::clone(&local));
        local.open();
        remote.open();
        let _ = self.events.send(TransportEvent::DataChannel(ChannelHandle {
            channel: local,
            events,
        }));
    }
}

fn remote_of(track: &LocalTrack) -> RemoteTrack {
    RemoteTrack {
        id: track.id().to_string(),
        kind: track.kind(),
        stream_id: "loopback".to_string(),
    }
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<(), TransportError> {
        let mut inner = lock(&self.inner);
        if inner.state == PeerState::Closed {
            return Err(TransportError::Closed);
        }
        inner.outgoing.insert(track.kind(), Arc::clone(&track));
        inner.tracks.push(track);
        Ok(())
    }

    async fn replace_track(
        &self,
        kind: TrackKind,
        track: Arc<LocalTrack>,
    ) -> Result<(), TransportError> {
        let mut inner = lock(&self.inner);
        if inner.state == PeerState::Closed {
            return Err(TransportError::Closed);
        }
        match inner.outgoing.get_mut(&kind) {
            Some(slot) => {
                *slot = track;
                Ok(())
            }
            None => Err(TransportError::NoSender(kind.as_str())),
        }
    }

    async fn create_data_channel(&self, label: &str) -> Result<ChannelHandle, TransportError> {
        let (channel, events) = LoopbackChannel::new(label);
        lock(&self.inner).channels.push(Arc::clone(&channel));
        Ok(ChannelHandle { channel, events })
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        if self.connection_state() == PeerState::Closed {
            return Err(TransportError::Closed);
        }
        self.offers_created.fetch_add(1, Ordering::SeqCst);
        let offer = self.describe(SdpType::Offer);
        self.apply_local(offer.clone());
        Ok(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        if lock(&self.inner).remote.is_none() {
            return Err(TransportError::InvalidDescription(
                "cannot answer before a remote offer is applied".to_string(),
            ));
        }
        let answer = self.describe(SdpType::Answer);
        self.apply_local(answer.clone());
        Ok(answer)
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        let peer_id = desc
            .sdp
            .lines()
            .find_map(|line| line.strip_prefix(ID_ATTR))
            .map(str::to_string)
            .ok_or_else(|| {
                TransportError::InvalidDescription("missing loopback id".to_string())
            })?;
        let peer = lock(&self.network.transports)
            .get(&peer_id)
            .cloned()
            .ok_or_else(|| TransportError::InvalidDescription(format!("unknown peer {peer_id}")))?;
        {
            let mut inner = lock(&self.inner);
            if inner.state == PeerState::Closed {
                return Err(TransportError::Closed);
            }
            inner.remote = Some(desc);
            inner.peer = Some(peer);
        }
        self.try_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        {
            let mut inner = lock(&self.inner);
            if inner.remote.is_none() {
                return Err(TransportError::InvalidDescription(
                    "remote description not set".to_string(),
                ));
            }
            inner.remote_candidates.push(candidate);
        }
        self.try_connect();
        Ok(())
    }

    fn connection_state(&self) -> PeerState {
        lock(&self.inner).state
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        let (was_connected, channels) = {
            let mut inner = lock(&self.inner);
            if inner.state == PeerState::Closed {
                return Ok(());
            }
            let was_connected = inner.state == PeerState::Connected;
            inner.state = PeerState::Closed;
            (was_connected, std::mem::take(&mut inner.channels))
        };
        for channel in channels {
            channel.shut();
        }
        let _ = self
            .events
            .send(TransportEvent::StateChanged(PeerState::Closed));

        if was_connected {
            if let Some(peer) = self.peer() {
                if peer.connection_state() == PeerState::Connected {
                    peer.simulate_state(PeerState::Disconnected);
                }
            }
        }
        Ok(())
    }
}

pub struct LoopbackChannel {
    label: String,
    open: std::sync::atomic::AtomicBool,
    events: mpsc::UnboundedSender<ChannelEvent>,
    peer: Mutex<Option<Weak<LoopbackChannel>>>,
}

impl LoopbackChannel {
    fn new(label: &str) -> (Arc<Self>, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                label: label.to_string(),
                open: std::sync::atomic::AtomicBool::new(false),
                events: tx,
                peer: Mutex::new(None),
            }),
            rx,
        )
    }

    fn link(self: &Arc<Self>, other: &Arc<Self>) {
        *lock(&self.peer) = Some(Arc::downgrade(other));
        *lock(&other.peer) = Some(Arc::downgrade(self));
    }

    fn open(&self) {
        if !self.open.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(ChannelEvent::Open);
        }
    }

    fn shut(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(ChannelEvent::Closed);
        }
        let peer = lock(&self.peer).take().and_then(|weak| weak.upgrade());
        if let Some(peer) = peer {
            peer.shut();
        }
    }
}

#[async_trait]
impl DataChannel for LoopbackChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send_text(&self, text: &str) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Channel(format!("{} is not open", self.label)));
        }
        let peer = lock(&self.peer).as_ref().and_then(Weak::upgrade);
        match peer {
            Some(peer) => {
                let _ = peer.events.send(ChannelEvent::Message(text.to_string()));
                Ok(())
            }
            None => Err(TransportError::Channel(format!("{} has no peer", self.label))),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.shut();
        Ok(())
    }
}
