//! One participant's side of the offer/answer/candidate exchange.
//!
//! The initiator publishes an offer and polls for the answer; the responder
//! polls for the offer and publishes the answer. Both trickle their own
//! candidates and poll for the other side's until negotiation stops. Every
//! loop checks the [`Liveness`] flag before each relay request and wakes up
//! from its sleep as soon as the flag drops, so nothing touches the relay
//! after the owning session has moved on.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use medlink_common::{IceCandidate, Role, SdpType, SessionDescription};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::{CallError, RelayError};
use crate::peer::PeerTransport;
use crate::signaling::SignalingRelay;

/// Read side of a cancellation flag. `true` while the owner still wants work
/// to continue; dropping the sender counts as cancellation.
#[derive(Clone)]
pub struct Liveness(watch::Receiver<bool>);

impl Liveness {
    pub fn channel() -> (watch::Sender<bool>, Liveness) {
        let (tx, rx) = watch::channel(true);
        (tx, Liveness(rx))
    }

    pub fn is_live(&self) -> bool {
        *self.0.borrow() && self.0.has_changed().is_ok()
    }

    /// Resolves once the flag has dropped.
    pub async fn cancelled(&self) {
        let mut rx = self.0.clone();
        let _ = rx.wait_for(|live| !*live).await;
    }

    /// Sleeps for `period` unless cancelled first.
    pub async fn sleep(&self, period: Duration) -> Result<(), CallError> {
        tokio::select! {
            _ = tokio::time::sleep(period) => self.check(),
            _ = self.cancelled() => Err(CallError::Cancelled),
        }
    }

    pub fn check(&self) -> Result<(), CallError> {
        if self.is_live() {
            Ok(())
        } else {
            Err(CallError::Cancelled)
        }
    }
}

impl From<watch::Receiver<bool>> for Liveness {
    fn from(rx: watch::Receiver<bool>) -> Self {
        Liveness(rx)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct NegotiationConfig {
    pub poll_interval: Duration,
    pub max_failures: u32,
}

/// Counts consecutive relay failures; any success resets the count.
/// A request the gateway rejects outright fails at once.
struct FailureBudget {
    consecutive: u32,
    limit: u32,
}

impl FailureBudget {
    fn new(limit: u32) -> Self {
        Self {
            consecutive: 0,
            limit: limit.max(1),
        }
    }

    fn success(&mut self) {
        self.consecutive = 0;
    }

    fn failure(&mut self, what: &str, err: &RelayError) -> Result<(), CallError> {
        if err.is_rejection() {
            return Err(CallError::NegotiationFailed(format!(
                "{} rejected: {}",
                what, err
            )));
        }
        self.consecutive += 1;
        warn!(
            attempt = self.consecutive,
            limit = self.limit,
            "{} failed: {}",
            what,
            err
        );
        if self.consecutive >= self.limit {
            return Err(CallError::SignalingUnavailable(format!(
                "{} failed {} times in a row: {}",
                what, self.consecutive, err
            )));
        }
        Ok(())
    }
}

pub struct Negotiator {
    session_id: String,
    role: Role,
    relay: Arc<dyn SignalingRelay>,
    transport: Arc<dyn PeerTransport>,
    config: NegotiationConfig,
    live: Liveness,
}

impl Negotiator {
    pub fn new(
        session_id: impl Into<String>,
        role: Role,
        relay: Arc<dyn SignalingRelay>,
        transport: Arc<dyn PeerTransport>,
        config: NegotiationConfig,
        live: Liveness,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            role,
            relay,
            transport,
            config,
            live,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Runs the description exchange for this side's role. Returns once the
    /// remote description is applied (and, for the responder, the answer is
    /// published).
    pub async fn exchange_descriptions(&self) -> Result<(), CallError> {
        match self.role {
            Role::Initiator => self.run_initiator().await,
            Role::Responder => self.run_responder().await,
        }
    }

    async fn run_initiator(&self) -> Result<(), CallError> {
        self.live.check()?;
        let offer = self
            .transport
            .create_offer()
            .await
            .map_err(CallError::negotiation)?;
        self.publish_description(&offer).await?;
        info!(session_id = %self.session_id, "offer published, waiting for answer");

        let answer = self.await_description(SdpType::Answer).await?;
        self.live.check()?;
        self.transport
            .set_remote_description(answer)
            .await
            .map_err(CallError::negotiation)?;
        info!(session_id = %self.session_id, "remote answer applied");
        Ok(())
    }

    async fn run_responder(&self) -> Result<(), CallError> {
        let offer = self.await_description(SdpType::Offer).await?;
        self.live.check()?;
        self.transport
            .set_remote_description(offer)
            .await
            .map_err(CallError::negotiation)?;
        info!(session_id = %self.session_id, "remote offer applied");

        self.live.check()?;
        let answer = self
            .transport
            .create_answer()
            .await
            .map_err(CallError::negotiation)?;
        self.publish_description(&answer).await?;
        info!(session_id = %self.session_id, "answer published");
        Ok(())
    }

    async fn publish_description(&self, desc: &SessionDescription) -> Result<(), CallError> {
        let mut budget = FailureBudget::new(self.config.max_failures);
        loop {
            self.live.check()?;
            let result = match desc.sdp_type {
                SdpType::Offer => self.relay.put_offer(&self.session_id, desc).await,
                SdpType::Answer => self.relay.put_answer(&self.session_id, desc).await,
            };
            match result {
                Ok(()) => return Ok(()),
                Err(err) => budget.failure("publishing description", &err)?,
            }
            self.live.sleep(self.config.poll_interval).await?;
        }
    }

    /// Polls the peer's slot until a description appears. An empty slot is the
    /// normal "not yet" answer and does not count as a failure.
    async fn await_description(&self, kind: SdpType) -> Result<SessionDescription, CallError> {
        let mut budget = FailureBudget::new(self.config.max_failures);
        loop {
            self.live.check()?;
            let result = match kind {
                SdpType::Offer => self.relay.get_offer(&self.session_id).await,
                SdpType::Answer => self.relay.get_answer(&self.session_id).await,
            };
            match result {
                Ok(Some(desc)) if desc.sdp_type == kind => return Ok(desc),
                Ok(Some(desc)) => {
                    return Err(CallError::NegotiationFailed(format!(
                        "expected {:?} in slot, found {:?}",
                        kind, desc.sdp_type
                    )))
                }
                Ok(None) => budget.success(),
                Err(err) => budget.failure("polling for description", &err)?,
            }
            self.live.sleep(self.config.poll_interval).await?;
        }
    }

    /// Trickles local candidates in the order they arrive until the channel
    /// closes or negotiation stops. A failed write is retried on the poll
    /// interval so no candidate is skipped.
    pub async fn publish_candidates(
        &self,
        mut candidates: mpsc::UnboundedReceiver<IceCandidate>,
    ) -> Result<(), CallError> {
        let mut budget = FailureBudget::new(self.config.max_failures);
        loop {
            let candidate = tokio::select! {
                next = candidates.recv() => match next {
                    Some(candidate) => candidate,
                    None => return Ok(()),
                },
                _ = self.live.cancelled() => return Ok(()),
            };
            loop {
                if self.live.check().is_err() {
                    return Ok(());
                }
                match self
                    .relay
                    .put_candidate(&self.session_id, self.role, &candidate)
                    .await
                {
                    Ok(()) => {
                        budget.success();
                        debug!(session_id = %self.session_id, "local candidate published");
                        break;
                    }
                    Err(err) => budget.failure("publishing candidate", &err)?,
                }
                if self.live.sleep(self.config.poll_interval).await.is_err() {
                    return Ok(());
                }
            }
        }
    }

    /// Polls the peer's candidates and applies each new one exactly once, until
    /// negotiation stops.
    pub async fn apply_remote_candidates(&self) -> Result<(), CallError> {
        let mut applied: HashSet<IceCandidate> = HashSet::new();
        let mut budget = FailureBudget::new(self.config.max_failures);
        let from = self.role.peer();
        loop {
            if self.live.check().is_err() {
                return Ok(());
            }
            match self.relay.get_candidates(&self.session_id, Some(from)).await {
                Ok(candidates) => {
                    budget.success();
                    for candidate in candidates {
                        if applied.contains(&candidate) {
                            continue;
                        }
                        if self.live.check().is_err() {
                            return Ok(());
                        }
                        match self.transport.add_ice_candidate(candidate.clone()).await {
                            Ok(()) => debug!(session_id = %self.session_id, "remote candidate applied"),
                            Err(err) => warn!("failed to apply remote candidate: {}", err),
                        }
                        applied.insert(candidate);
                    }
                }
                Err(err) => budget.failure("polling for candidates", &err)?,
            }
            if self.live.sleep(self.config.poll_interval).await.is_err() {
                return Ok(());
            }
        }
    }
}
