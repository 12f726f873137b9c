//! Shared harness for the call client tests.
//!
//! `StoreRelay` talks to the gateway's real relay store in-process and counts
//! what it is asked to do, so tests can check how often a session wrote,
//! polled or cleared.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use medlink_client::media::SyntheticDevices;
use medlink_client::peer::loopback::{LoopbackFactory, LoopbackTransport};
use medlink_client::{
    CallEvent, CallParams, CallSession, CallState, ClientConfig, MediaConstraints,
    RelayError, SignalingRelay,
};
use medlink_common::{IceCandidate, Participant, Role, SessionDescription};
use medlink_gateway::{SignalingStore, StoreError};
use tokio::sync::broadcast;

pub const WAIT: Duration = Duration::from_secs(5);

pub struct StoreRelay {
    store: SignalingStore,
    requests: AtomicUsize,
    clears: AtomicUsize,
    failing: AtomicBool,
}

impl StoreRelay {
    pub fn new(store: SignalingStore) -> Arc<Self> {
        Arc::new(Self {
            store,
            requests: AtomicUsize::new(0),
            clears: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        })
    }

    /// Makes every request fail as if the gateway were down.
    pub fn fail_all(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn clears(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }

    fn enter(&self) -> Result<(), RelayError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(RelayError::Status {
                status: 503,
                message: "gateway unavailable".to_string(),
            });
        }
        Ok(())
    }
}

fn rejected(err: StoreError) -> RelayError {
    RelayError::Status {
        status: 400,
        message: err.to_string(),
    }
}

#[async_trait]
impl SignalingRelay for StoreRelay {
    async fn put_offer(
        &self,
        session_id: &str,
        offer: &SessionDescription,
    ) -> Result<(), RelayError> {
        self.enter()?;
        self.store
            .put_offer(session_id, offer.clone())
            .await
            .map_err(rejected)
    }

    async fn put_answer(
        &self,
        session_id: &str,
        answer: &SessionDescription,
    ) -> Result<(), RelayError> {
        self.enter()?;
        self.store
            .put_answer(session_id, answer.clone())
            .await
            .map_err(rejected)
    }

    async fn put_candidate(
        &self,
        session_id: &str,
        from: Role,
        candidate: &IceCandidate,
    ) -> Result<(), RelayError> {
        self.enter()?;
        self.store
            .append_candidate(session_id, Some(from), candidate.clone())
            .await
            .map_err(rejected)
    }

    async fn get_offer(&self, session_id: &str) -> Result<Option<SessionDescription>, RelayError> {
        self.enter()?;
        Ok(self.store.offer(session_id).await)
    }

    async fn get_answer(
        &self,
        session_id: &str,
    ) -> Result<Option<SessionDescription>, RelayError> {
        self.enter()?;
        Ok(self.store.answer(session_id).await)
    }

    async fn get_candidates(
        &self,
        session_id: &str,
        from: Option<Role>,
    ) -> Result<Vec<IceCandidate>, RelayError> {
        self.enter()?;
        Ok(self.store.candidates(session_id, from).await)
    }

    async fn clear(&self, session_id: &str) -> Result<(), RelayError> {
        self.enter()?;
        self.clears.fetch_add(1, Ordering::SeqCst);
        self.store.clear(session_id).await;
        Ok(())
    }
}

pub fn fast_config() -> ClientConfig {
    let mut config = ClientConfig::new("http://127.0.0.1:3000");
    config.poll_interval = Duration::from_millis(20);
    config.max_signaling_failures = 3;
    config.reconnect_grace = Duration::from_millis(200);
    config
}

pub fn params(session_id: &str, role: Role) -> CallParams {
    let doctor = Participant::new("dr-1", "Dr. Rao");
    let field = Participant::new("mi-7", "Field Unit 7");
    let (local, remote) = match role {
        Role::Initiator => (doctor, field),
        Role::Responder => (field, doctor),
    };
    CallParams {
        session_id: session_id.to_string(),
        role,
        local,
        remote,
        case_context: None,
        constraints: MediaConstraints::default(),
    }
}

pub struct Side {
    pub session: CallSession,
    pub relay: Arc<StoreRelay>,
    pub devices: Arc<SyntheticDevices>,
    pub events: broadcast::Receiver<CallEvent>,
}

impl Side {
    pub fn new(
        store: &SignalingStore,
        factory: &LoopbackFactory,
        session_id: &str,
        role: Role,
    ) -> Self {
        let relay = StoreRelay::new(store.clone());
        let devices = Arc::new(SyntheticDevices::new());
        let session = CallSession::new(
            params(session_id, role),
            fast_config(),
            relay.clone(),
            Arc::new(factory.clone()),
            devices.clone(),
        );
        let events = session.subscribe();
        Self {
            session,
            relay,
            devices,
            events,
        }
    }

    /// Events received so far, without waiting.
    pub fn drain_events(&mut self) -> Vec<CallEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}

pub struct Pair {
    pub store: SignalingStore,
    pub factory: LoopbackFactory,
    pub initiator: Side,
    pub responder: Side,
}

impl Pair {
    pub fn new(session_id: &str) -> Self {
        let store = SignalingStore::default();
        let factory = LoopbackFactory::new();
        let initiator = Side::new(&store, &factory, session_id, Role::Initiator);
        let responder = Side::new(&store, &factory, session_id, Role::Responder);
        Self {
            store,
            factory,
            initiator,
            responder,
        }
    }

    /// Starts both sides and waits until both report connected.
    pub async fn connect(session_id: &str) -> Self {
        let pair = Self::new(session_id);
        pair.initiator.session.start().await.unwrap();
        pair.responder.session.start().await.unwrap();
        wait_state(&pair.initiator.session, CallState::Connected).await;
        wait_state(&pair.responder.session, CallState::Connected).await;
        pair
    }

    /// The transport created for the initiator (created first).
    pub fn initiator_transport(&self) -> Arc<LoopbackTransport> {
        self.factory.transports()[0].clone()
    }

    pub fn responder_transport(&self) -> Arc<LoopbackTransport> {
        self.factory.transports()[1].clone()
    }
}

pub async fn wait_state(session: &CallSession, state: CallState) {
    let mut rx = session.watch_state();
    let reached = tokio::time::timeout(WAIT, async {
        rx.wait_for(|current| *current == state).await.is_ok()
    })
    .await;
    assert!(
        matches!(reached, Ok(true)),
        "session {} never reached {:?} (now {:?})",
        session.session_id(),
        state,
        session.state()
    );
}
