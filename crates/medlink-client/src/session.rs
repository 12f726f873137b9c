//! Call session lifecycle: `idle -> connecting -> connected -> ended`.
//!
//! A [`CallSession`] owns everything one call attempt uses (local media, the
//! peer connection, chat, screen share and the background tasks) and tears
//! all of it down exactly once. Ending can be triggered from several places
//! at the same time: the local hangup, a transport failure, an expired grace
//! timer, a negotiation error or a remote `session-ended` notice. The first
//! trigger wins; the rest return immediately.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use medlink_common::{
    CaseContext, IncomingSession, IceCandidate, NotificationBus, NotificationKind, Participant,
    Role, Subscription,
};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::chat::{ChatChannel, CHAT_LABEL};
use crate::config::ClientConfig;
use crate::error::CallError;
use crate::media::{LocalMedia, MediaConstraints, MediaDevices};
use crate::negotiation::{Liveness, NegotiationConfig, Negotiator};
use crate::peer::{
    PeerConnectionManager, PeerState, RemoteTrack, TransportEvent, TransportFactory,
};
use crate::screen_share::ScreenShare;
use crate::signaling::SignalingRelay;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Connecting,
    Connected,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    LocalHangup,
    RemoteHangup,
    ConnectionLost,
    Failed,
}

/// Lifecycle events for the embedding application. A failed call emits
/// `Failed` followed by `Ended`.
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    Started {
        session_id: String,
    },
    Connected {
        session_id: String,
    },
    Ended {
        session_id: String,
        duration_seconds: u64,
        reason: EndReason,
    },
    Failed {
        session_id: String,
        error: CallError,
    },
}

/// Everything the surrounding application decides before a call starts.
#[derive(Debug, Clone)]
pub struct CallParams {
    pub session_id: String,
    pub role: Role,
    pub local: Participant,
    pub remote: Participant,
    pub case_context: Option<CaseContext>,
    pub constraints: MediaConstraints,
}

impl CallParams {
    /// Parameters for answering an `incoming-session` notification.
    pub fn from_incoming(local: Participant, incoming: &IncomingSession) -> Self {
        Self {
            session_id: incoming.session_id.clone(),
            role: Role::Responder,
            local,
            remote: incoming.initiator.clone(),
            case_context: incoming.case_context.clone(),
            constraints: MediaConstraints::default(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct SessionInner {
    params: CallParams,
    config: ClientConfig,
    relay: Arc<dyn SignalingRelay>,
    factory: Arc<dyn TransportFactory>,
    devices: Arc<dyn MediaDevices>,

    state: watch::Sender<CallState>,
    events: broadcast::Sender<CallEvent>,
    ended: AtomicBool,
    /// Live while descriptions and candidates are still being exchanged.
    negotiating: watch::Sender<bool>,
    /// Live until the session ends.
    alive: watch::Sender<bool>,
    grace_generation: AtomicU64,

    peer: Mutex<Option<Arc<PeerConnectionManager>>>,
    media: Mutex<Option<LocalMedia>>,
    screen: Mutex<Option<ScreenShare>>,
    chat: ChatChannel,
    connected_at: Mutex<Option<Instant>>,
    ended_at: Mutex<Option<Instant>>,
}

impl SessionInner {
    fn session_id(&self) -> &str {
        &self.params.session_id
    }

    fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.events.send(event);
    }

    fn alive(&self) -> Liveness {
        Liveness::from(self.alive.subscribe())
    }

    fn negotiation_live(&self) -> Liveness {
        Liveness::from(self.negotiating.subscribe())
    }

    fn duration(&self) -> Duration {
        let Some(start) = *lock(&self.connected_at) else {
            return Duration::ZERO;
        };
        let end = (*lock(&self.ended_at)).unwrap_or_else(Instant::now);
        end.saturating_duration_since(start)
    }

    async fn setup(self: &Arc<Self>) -> Result<(), CallError> {
        let media = self.devices.user_media(&self.params.constraints).await?;
        *lock(&self.media) = Some(media.clone());
        if self.is_ended() {
            self.release().await;
            return Err(CallError::Cancelled);
        }

        let (transport, events) = self
            .factory
            .create()
            .await
            .map_err(CallError::negotiation)?;
        let manager = Arc::new(PeerConnectionManager::new(Arc::clone(&transport)));
        *lock(&self.peer) = Some(Arc::clone(&manager));
        if let Some(camera) = media.video.clone() {
            *lock(&self.screen) = Some(ScreenShare::new(
                Arc::clone(&manager),
                Arc::clone(&self.devices),
                camera,
            ));
        }
        if self.is_ended() {
            self.release().await;
            return Err(CallError::Cancelled);
        }

        for track in media.tracks() {
            manager
                .publish(track)
                .await
                .map_err(CallError::negotiation)?;
        }
        // The initiator opens chat before the offer so the channel is part of it.
        if self.params.role == Role::Initiator {
            match transport.create_data_channel(CHAT_LABEL).await {
                Ok(handle) => self.chat.attach(handle, self.alive()),
                Err(err) => warn!("chat unavailable: {}", err),
            }
        }

        let (candidate_tx, candidate_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_transport_events(
            Arc::downgrade(self),
            Arc::clone(&manager),
            events,
            candidate_tx,
            self.alive(),
        ));

        let negotiator = Arc::new(Negotiator::new(
            self.session_id(),
            self.params.role,
            Arc::clone(&self.relay),
            transport,
            NegotiationConfig {
                poll_interval: self.config.poll_interval,
                max_failures: self.config.max_signaling_failures,
            },
            self.negotiation_live(),
        ));

        let publisher = Arc::clone(&negotiator);
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            if let Err(err) = publisher.publish_candidates(candidate_rx).await {
                fail(&weak, err).await;
            }
        });

        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let result = match negotiator.exchange_descriptions().await {
                Ok(()) => negotiator.apply_remote_candidates().await,
                Err(err) => Err(err),
            };
            if let Err(err) = result {
                fail(&weak, err).await;
            }
        });

        info!(
            session_id = %self.session_id(),
            role = %self.params.role,
            remote = %self.params.remote.id,
            "call negotiation started"
        );
        Ok(())
    }

    async fn on_peer_state(self: &Arc<Self>, state: PeerState) {
        if self.is_ended() {
            return;
        }
        match state {
            PeerState::Connected => {
                self.grace_generation.fetch_add(1, Ordering::SeqCst);
                let transitioned = self.state.send_if_modified(|current| {
                    if *current == CallState::Connecting {
                        *current = CallState::Connected;
                        true
                    } else {
                        false
                    }
                });
                if transitioned {
                    *lock(&self.connected_at) = Some(Instant::now());
                    self.negotiating.send_replace(false);
                    info!(session_id = %self.session_id(), "call connected");
                    self.emit(CallEvent::Connected {
                        session_id: self.session_id().to_string(),
                    });
                } else {
                    info!(session_id = %self.session_id(), "transport recovered");
                }
            }
            PeerState::Disconnected => {
                let generation = self.grace_generation.fetch_add(1, Ordering::SeqCst) + 1;
                let grace = self.config.reconnect_grace;
                warn!(
                    session_id = %self.session_id(),
                    grace_secs = grace.as_secs(),
                    "transport disconnected, waiting for recovery"
                );
                let weak = Arc::downgrade(self);
                let live = self.alive();
                tokio::spawn(async move {
                    if live.sleep(grace).await.is_err() {
                        return;
                    }
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    if inner.grace_generation.load(Ordering::SeqCst) != generation {
                        return;
                    }
                    inner
                        .finish(
                            EndReason::ConnectionLost,
                            Some(CallError::ConnectionLost(format!(
                                "no recovery within {}s",
                                grace.as_secs()
                            ))),
                        )
                        .await;
                });
            }
            PeerState::Failed => {
                self.finish(
                    EndReason::ConnectionLost,
                    Some(CallError::ConnectionLost("transport failed".to_string())),
                )
                .await;
            }
            PeerState::Closed => self.finish(EndReason::RemoteHangup, None).await,
            PeerState::New | PeerState::Connecting => {}
        }
    }

    /// Stops and drops the call's resources. Each one is taken out of its
    /// slot first, so whoever takes it is the only one releasing it.
    async fn release(&self) {
        let screen = lock(&self.screen).take();
        if let Some(screen) = screen {
            screen.shutdown().await;
        }
        let media = lock(&self.media).take();
        if let Some(media) = media {
            media.stop_all();
        }
        self.chat.close().await;
        let peer = lock(&self.peer).take();
        if let Some(peer) = peer {
            if let Err(err) = peer.close().await {
                warn!(session_id = %self.session_id(), "closing transport: {}", err);
            }
        }
    }

    async fn finish(&self, reason: EndReason, error: Option<CallError>) {
        if self.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        self.negotiating.send_replace(false);
        self.alive.send_replace(false);
        self.state.send_replace(CallState::Ended);
        if lock(&self.connected_at).is_some() {
            *lock(&self.ended_at) = Some(Instant::now());
        }

        self.release().await;
        if let Err(err) = self.relay.clear(self.session_id()).await {
            warn!(session_id = %self.session_id(), "clearing signaling state: {}", err);
        }

        let duration_seconds = self.duration().as_secs();
        match &error {
            Some(err) => error!(session_id = %self.session_id(), ?reason, "call failed: {}", err),
            None => info!(session_id = %self.session_id(), ?reason, duration_seconds, "call ended"),
        }
        if let Some(error) = error {
            self.emit(CallEvent::Failed {
                session_id: self.session_id().to_string(),
                error,
            });
        }
        self.emit(CallEvent::Ended {
            session_id: self.session_id().to_string(),
            duration_seconds,
            reason,
        });
    }
}

async fn fail(weak: &Weak<SessionInner>, err: CallError) {
    if err == CallError::Cancelled {
        return;
    }
    if let Some(inner) = weak.upgrade() {
        inner.finish(EndReason::Failed, Some(err)).await;
    }
}

async fn run_transport_events(
    weak: Weak<SessionInner>,
    manager: Arc<PeerConnectionManager>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    candidates: mpsc::UnboundedSender<IceCandidate>,
    live: Liveness,
) {
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = live.cancelled() => None,
        };
        let Some(event) = event else {
            break;
        };
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                let _ = candidates.send(candidate);
            }
            TransportEvent::RemoteTrack(track) => manager.record_remote(track),
            TransportEvent::StateChanged(state) => {
                manager.set_state(state);
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.on_peer_state(state).await;
            }
            TransportEvent::DataChannel(handle) => {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if handle.channel.label() == CHAT_LABEL {
                    inner.chat.attach(handle, live.clone());
                } else {
                    debug!(label = %handle.channel.label(), "ignoring unknown data channel");
                }
            }
        }
    }
    debug!("transport event loop finished");
}

/// One call attempt. Cheap to clone; clones control the same call.
#[derive(Clone)]
pub struct CallSession {
    inner: Arc<SessionInner>,
}

impl CallSession {
    pub fn new(
        params: CallParams,
        config: ClientConfig,
        relay: Arc<dyn SignalingRelay>,
        factory: Arc<dyn TransportFactory>,
        devices: Arc<dyn MediaDevices>,
    ) -> Self {
        let (state, _) = watch::channel(CallState::Idle);
        let (events, _) = broadcast::channel(32);
        let (negotiating, _) = watch::channel(true);
        let (alive, _) = watch::channel(true);
        let chat = ChatChannel::new(params.local.name.clone());
        Self {
            inner: Arc::new(SessionInner {
                params,
                config,
                relay,
                factory,
                devices,
                state,
                events,
                ended: AtomicBool::new(false),
                negotiating,
                alive,
                grace_generation: AtomicU64::new(0),
                peer: Mutex::new(None),
                media: Mutex::new(None),
                screen: Mutex::new(None),
                chat,
                connected_at: Mutex::new(None),
                ended_at: Mutex::new(None),
            }),
        }
    }

    pub fn session_id(&self) -> &str {
        self.inner.session_id()
    }

    pub fn role(&self) -> Role {
        self.inner.params.role
    }

    pub fn params(&self) -> &CallParams {
        &self.inner.params
    }

    pub fn state(&self) -> CallState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<CallState> {
        self.inner.state.subscribe()
    }

    /// Lifecycle events from now on. Subscribe before [`start`](Self::start)
    /// to see `Started`.
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.inner.events.subscribe()
    }

    /// Moves the session from idle to connecting: acquires camera and
    /// microphone, creates the transport and starts negotiating in the
    /// background.
    ///
    /// A failure here ends the session and is reported through the event
    /// stream as well as returned.
    pub async fn start(&self) -> Result<(), CallError> {
        let started = self.inner.state.send_if_modified(|state| {
            if *state == CallState::Idle {
                *state = CallState::Connecting;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(CallError::InvalidState(format!(
                "cannot start a call in state {:?}",
                self.state()
            )));
        }
        self.inner.emit(CallEvent::Started {
            session_id: self.session_id().to_string(),
        });

        match self.inner.setup().await {
            Ok(()) | Err(CallError::Cancelled) => Ok(()),
            Err(err) => {
                self.inner
                    .finish(EndReason::Failed, Some(err.clone()))
                    .await;
                Err(err)
            }
        }
    }

    /// Hangs up. Safe to call any number of times, from any task.
    pub async fn end(&self) {
        self.inner.finish(EndReason::LocalHangup, None).await;
    }

    /// Waits until the session has ended.
    pub async fn ended(&self) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|state| *state == CallState::Ended).await;
    }

    pub fn is_ended(&self) -> bool {
        self.inner.is_ended()
    }

    /// Time since the call connected, frozen once it ends.
    pub fn duration(&self) -> Duration {
        self.inner.duration()
    }

    pub fn chat(&self) -> ChatChannel {
        self.inner.chat.clone()
    }

    pub fn screen_share(&self) -> Option<ScreenShare> {
        lock(&self.inner.screen).clone()
    }

    pub async fn toggle_screen_share(&self) -> Result<bool, CallError> {
        if !matches!(self.state(), CallState::Connecting | CallState::Connected) {
            return Err(CallError::InvalidState(
                "screen sharing needs an active call".to_string(),
            ));
        }
        let share = self.screen_share().ok_or_else(|| {
            CallError::InvalidState("no camera track to swap out".to_string())
        })?;
        share.toggle().await
    }

    pub fn set_camera_enabled(&self, enabled: bool) -> Result<(), CallError> {
        let track = lock(&self.inner.media)
            .as_ref()
            .and_then(|media| media.video.clone())
            .ok_or_else(|| CallError::InvalidState("no camera track".to_string()))?;
        track.set_enabled(enabled);
        Ok(())
    }

    pub fn set_microphone_enabled(&self, enabled: bool) -> Result<(), CallError> {
        let track = lock(&self.inner.media)
            .as_ref()
            .and_then(|media| media.audio.clone())
            .ok_or_else(|| CallError::InvalidState("no microphone track".to_string()))?;
        track.set_enabled(enabled);
        Ok(())
    }

    pub fn peer(&self) -> Option<Arc<PeerConnectionManager>> {
        lock(&self.inner.peer).clone()
    }

    pub fn remote_tracks(&self) -> Vec<RemoteTrack> {
        self.peer()
            .map(|peer| peer.remote_tracks())
            .unwrap_or_default()
    }

    /// Ends this call when the gateway reports `session-ended` for it.
    /// The returned guard must be kept for as long as that should apply.
    pub fn end_on_remote_notice(&self, bus: &NotificationBus) -> Subscription {
        let weak = Arc::downgrade(&self.inner);
        let session_id = self.session_id().to_string();
        bus.subscribe(NotificationKind::SessionEnded, move |event| {
            if event.session_id.as_deref() != Some(session_id.as_str()) {
                return;
            }
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                warn!("session-ended notice outside a runtime, ignoring");
                return;
            };
            runtime.spawn(async move {
                inner.finish(EndReason::RemoteHangup, None).await;
            });
        })
    }
}
