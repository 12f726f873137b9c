//! `POST /api/video-call`: rings the responder and tears signaling down again.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use medlink_common::helpers::{is_valid_identity, is_valid_session_id};
use medlink_common::{
    CallAction, CallControlReply, CallControlRequest, IncomingSession, NotificationEvent,
    Participant, SessionEnded,
};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::signal::error_response;
use crate::AppState;

pub const DEFAULT_CALL_TTL: Duration = Duration::from_secs(4 * 60 * 60);
pub const DEFAULT_CALL_LIMIT: usize = 4096;

#[derive(Debug, Clone)]
pub struct ActiveCall {
    pub initiator: Participant,
    pub responder: Participant,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug)]
struct CallEntry {
    call: ActiveCall,
    registered_at: Instant,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CallError {
    #[error("session already active")]
    AlreadyActive,
    #[error("active call limit reached ({limit})")]
    CallLimit { limit: usize },
}

/// Calls announced through the gateway and not yet ended. A call nobody
/// ends is forgotten once it has been registered for longer than `ttl`.
#[derive(Clone)]
pub struct CallRegistry {
    calls: Arc<Mutex<HashMap<String, CallEntry>>>,
    ttl: Duration,
    max_calls: usize,
}

impl Default for CallRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_CALL_TTL, DEFAULT_CALL_LIMIT)
    }
}

impl CallRegistry {
    pub fn new(ttl: Duration, max_calls: usize) -> Self {
        Self {
            calls: Arc::new(Mutex::new(HashMap::new())),
            ttl,
            max_calls: max_calls.max(1),
        }
    }

    pub async fn begin(&self, session_id: &str, call: ActiveCall) -> Result<(), CallError> {
        let now = Instant::now();
        let mut guard = self.calls.lock().await;
        guard.retain(|_, entry| now.duration_since(entry.registered_at) < self.ttl);
        if guard.contains_key(session_id) {
            return Err(CallError::AlreadyActive);
        }
        if guard.len() >= self.max_calls {
            return Err(CallError::CallLimit {
                limit: self.max_calls,
            });
        }
        guard.insert(
            session_id.to_string(),
            CallEntry {
                call,
                registered_at: now,
            },
        );
        Ok(())
    }

    pub async fn finish(&self, session_id: &str) -> Option<ActiveCall> {
        self.calls
            .lock()
            .await
            .remove(session_id)
            .map(|entry| entry.call)
    }

    pub async fn len(&self) -> usize {
        self.calls.lock().await.len()
    }

    /// Forgets calls older than the TTL. Returns how many were dropped.
    pub async fn cleanup(&self) -> usize {
        let now = Instant::now();
        let mut guard = self.calls.lock().await;
        let before = guard.len();
        guard.retain(|session_id, entry| {
            let keep = now.duration_since(entry.registered_at) < self.ttl;
            if !keep {
                debug!(session_id = %session_id, "abandoned call expired");
            }
            keep
        });
        before - guard.len()
    }
}

fn reply(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(CallControlReply {
            success: status.is_success(),
            message: message.into(),
        }),
    )
        .into_response()
}

pub async fn video_call(State(state): State<AppState>, body: Bytes) -> Response {
    let request: CallControlRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                format!("invalid call request: {}", err),
            )
        }
    };
    if !is_valid_session_id(&request.session_id) {
        return error_response(StatusCode::BAD_REQUEST, "invalid session id");
    }

    match request.action {
        CallAction::Initiate => initiate(state, request).await,
        CallAction::End => end(state, request).await,
    }
}

async fn initiate(state: AppState, request: CallControlRequest) -> Response {
    let (Some(initiator), Some(responder)) = (request.initiator, request.responder) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "initiate requires initiator and responder",
        );
    };
    if !is_valid_identity(&initiator.id) || !is_valid_identity(&responder.id) {
        return error_response(StatusCode::BAD_REQUEST, "invalid participant id");
    }

    let started_at = Utc::now();
    let call = ActiveCall {
        initiator: initiator.clone(),
        responder: responder.clone(),
        started_at,
    };
    if let Err(err) = state.calls.begin(&request.session_id, call).await {
        let status = match err {
            CallError::AlreadyActive => StatusCode::CONFLICT,
            CallError::CallLimit { .. } => StatusCode::TOO_MANY_REQUESTS,
        };
        return error_response(status, err.to_string());
    }

    // Leftovers from an earlier call on the same id must not leak into this one.
    state.store.clear(&request.session_id).await;

    let payload = IncomingSession {
        session_id: request.session_id.clone(),
        initiator,
        case_context: request.case_context,
        timestamp: started_at,
    };
    let event = match NotificationEvent::incoming_session(Some(responder.id.clone()), &payload) {
        Ok(event) => event,
        Err(err) => {
            state.calls.finish(&request.session_id).await;
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string());
        }
    };
    let delivered = state.bus.publish(&event);
    info!(
        session_id = %request.session_id,
        responder = %responder.id,
        delivered,
        "call initiated"
    );

    reply(StatusCode::OK, "call initiated")
}

async fn end(state: AppState, request: CallControlRequest) -> Response {
    let session_id = request.session_id;
    state.store.clear(&session_id).await;

    // The second hangup of a call, or one the registry already forgot, only
    // clears signaling. Participants are known solely from `initiate`.
    let Some(call) = state.calls.finish(&session_id).await else {
        debug!(session_id = %session_id, "end for unknown call");
        return reply(StatusCode::OK, "call ended");
    };

    let duration_seconds = Utc::now()
        .signed_duration_since(call.started_at)
        .num_seconds()
        .max(0) as u64;
    let payload = SessionEnded {
        session_id: session_id.clone(),
        duration_seconds: Some(duration_seconds),
        timestamp: Utc::now(),
    };

    for recipient in [call.initiator.id, call.responder.id] {
        match NotificationEvent::session_ended(Some(recipient), &payload) {
            Ok(event) => {
                state.bus.publish(&event);
            }
            Err(err) => warn!("failed to build session-ended notification: {}", err),
        }
    }

    info!(session_id = %session_id, duration_seconds, "call ended");
    reply(StatusCode::OK, "call ended")
}
