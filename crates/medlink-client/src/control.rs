//! Call control against `POST /api/video-call`.

use std::time::Duration;

use medlink_common::{
    CallAction, CallControlReply, CallControlRequest, CaseContext, ErrorResponse, Participant,
};
use tracing::info;
use uuid::Uuid;

use crate::error::RelayError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A fresh session id. Whoever creates it places the call and is the
/// initiator.
pub fn new_session_id() -> String {
    format!("consult-{}", Uuid::new_v4())
}

#[derive(Clone)]
pub struct GatewayClient {
    client: reqwest::Client,
    endpoint: String,
}

impl GatewayClient {
    pub fn new(gateway_url: &str) -> Result<Self, RelayError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/api/video-call", gateway_url.trim_end_matches('/')),
        })
    }

    /// Rings `responder`: the gateway resets signaling for the session and
    /// pushes `incoming-session` to the responder's stream.
    pub async fn initiate_call(
        &self,
        session_id: &str,
        initiator: &Participant,
        responder: &Participant,
        case_context: Option<CaseContext>,
    ) -> Result<CallControlReply, RelayError> {
        let reply = self
            .send(&CallControlRequest {
                session_id: session_id.to_string(),
                action: CallAction::Initiate,
                initiator: Some(initiator.clone()),
                responder: Some(responder.clone()),
                case_context,
            })
            .await?;
        info!(session_id, responder = %responder.id, "call announced");
        Ok(reply)
    }

    pub async fn end_call(&self, session_id: &str) -> Result<CallControlReply, RelayError> {
        self.send(&CallControlRequest {
            session_id: session_id.to_string(),
            action: CallAction::End,
            initiator: None,
            responder: None,
            case_context: None,
        })
        .await
    }

    async fn send(&self, request: &CallControlRequest) -> Result<CallControlReply, RelayError> {
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
            .json::<CallControlReply>()
            .await
            .map_err(|e| RelayError::Decode(e.to_string()))
    }
}
