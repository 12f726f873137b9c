//! Access to the signaling relay.

use async_trait::async_trait;
use medlink_common::{
    ErrorResponse, IceCandidate, Role, SessionDescription, SignalingReply, SignalingRequest,
};
use std::time::Duration;
use tracing::debug;

use crate::error::RelayError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// The relay contract as seen by one participant. Reads never block: an
/// absent slot is `None` (or an empty list), not an error.
#[async_trait]
pub trait SignalingRelay: Send + Sync {
    async fn put_offer(&self, session_id: &str, offer: &SessionDescription)
        -> Result<(), RelayError>;

    async fn put_answer(
        &self,
        session_id: &str,
        answer: &SessionDescription,
    ) -> Result<(), RelayError>;

    async fn put_candidate(
        &self,
        session_id: &str,
        from: Role,
        candidate: &IceCandidate,
    ) -> Result<(), RelayError>;

    async fn get_offer(&self, session_id: &str) -> Result<Option<SessionDescription>, RelayError>;

    async fn get_answer(&self, session_id: &str)
        -> Result<Option<SessionDescription>, RelayError>;

    /// Candidates in submission order, restricted to those submitted by
    /// `from` when given.
    async fn get_candidates(
        &self,
        session_id: &str,
        from: Option<Role>,
    ) -> Result<Vec<IceCandidate>, RelayError>;

    async fn clear(&self, session_id: &str) -> Result<(), RelayError>;
}

/// Relay client for `POST /api/webrtc/signaling`.
#[derive(Clone)]
pub struct HttpRelay {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpRelay {
    pub fn new(gateway_url: &str) -> Result<Self, RelayError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self::with_client(client, gateway_url))
    }

    pub fn with_client(client: reqwest::Client, gateway_url: &str) -> Self {
        Self {
            client,
            endpoint: format!(
                "{}/api/webrtc/signaling",
                gateway_url.trim_end_matches('/')
            ),
        }
    }

    async fn call(&self, request: &SignalingRequest) -> Result<SignalingReply, RelayError> {
        debug!(
            session_id = request.session_id(),
            op = request.op_name(),
            "relay request"
        );
        let response = self.client.post(&self.endpoint).json(request).send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = match response.json::<ErrorResponse>().await {
                Ok(body) => body.error,
                Err(_) => status.canonical_reason().unwrap_or("unknown").to_string(),
            };
            return Err(RelayError::Status {
                status: status.as_u16(),
                message,
            });
        }
        response
            .json::<SignalingReply>()
            .await
            .map_err(|e| RelayError::Decode(e.to_string()))
    }

    async fn ack(&self, request: SignalingRequest) -> Result<(), RelayError> {
        let reply = self.call(&request).await?;
        if reply.success != Some(true) {
            return Err(RelayError::Decode(format!(
                "{} was not acknowledged",
                request.op_name()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl SignalingRelay for HttpRelay {
    async fn put_offer(
        &self,
        session_id: &str,
        offer: &SessionDescription,
    ) -> Result<(), RelayError> {
        self.ack(SignalingRequest::Offer {
            session_id: session_id.to_string(),
            data: offer.clone(),
        })
        .await
    }

    async fn put_answer(
        &self,
        session_id: &str,
        answer: &SessionDescription,
    ) -> Result<(), RelayError> {
        self.ack(SignalingRequest::Answer {
            session_id: session_id.to_string(),
            data: answer.clone(),
        })
        .await
    }

    async fn put_candidate(
        &self,
        session_id: &str,
        from: Role,
        candidate: &IceCandidate,
    ) -> Result<(), RelayError> {
        self.ack(SignalingRequest::IceCandidate {
            session_id: session_id.to_string(),
            data: candidate.clone(),
            from: Some(from),
        })
        .await
    }

    async fn get_offer(&self, session_id: &str) -> Result<Option<SessionDescription>, RelayError> {
        let reply = self
            .call(&SignalingRequest::GetOffer {
                session_id: session_id.to_string(),
            })
            .await?;
        Ok(reply.offer)
    }

    async fn get_answer(
        &self,
        session_id: &str,
    ) -> Result<Option<SessionDescription>, RelayError> {
        let reply = self
            .call(&SignalingRequest::GetAnswer {
                session_id: session_id.to_string(),
            })
            .await?;
        Ok(reply.answer)
    }

    async fn get_candidates(
        &self,
        session_id: &str,
        from: Option<Role>,
    ) -> Result<Vec<IceCandidate>, RelayError> {
        let reply = self
            .call(&SignalingRequest::GetCandidates {
                session_id: session_id.to_string(),
                from,
            })
            .await?;
        Ok(reply.candidates.unwrap_or_default())
    }

    async fn clear(&self, session_id: &str) -> Result<(), RelayError> {
        self.ack(SignalingRequest::Clear {
            session_id: session_id.to_string(),
        })
        .await
    }
}
