//! HTTP surface of the signaling relay: `POST /api/webrtc/signaling` for every
//! relay operation and `GET /api/webrtc/signaling` for slot reads.

use axum::{
    body::Bytes,
    extract::{rejection::QueryRejection, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use medlink_common::helpers::is_valid_session_id;
use medlink_common::{ErrorResponse, ReadKind, SignalingQuery, SignalingReply, SignalingRequest};
use tracing::{debug, warn};

use crate::store::{SignalingStore, StoreError};

pub(crate) fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

impl IntoResponse for StoreError {
    fn into_response(self) -> Response {
        let status = match self {
            StoreError::InvalidSessionId | StoreError::EmptyPayload => StatusCode::BAD_REQUEST,
            StoreError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            StoreError::SessionLimit { .. } => StatusCode::TOO_MANY_REQUESTS,
        };
        error_response(status, self.to_string())
    }
}

pub async fn signaling_post(State(store): State<SignalingStore>, body: Bytes) -> Response {
    let request: SignalingRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            debug!("rejected signaling request: {}", err);
            return error_response(
                StatusCode::BAD_REQUEST,
                format!("invalid signaling request: {}", err),
            );
        }
    };

    if !is_valid_session_id(request.session_id()) {
        return StoreError::InvalidSessionId.into_response();
    }

    debug!(
        session_id = request.session_id(),
        op = request.op_name(),
        "signaling request"
    );

    match dispatch(&store, request).await {
        Ok(reply) => (StatusCode::OK, Json(reply)).into_response(),
        Err(err) => {
            warn!("signaling write rejected: {}", err);
            err.into_response()
        }
    }
}

pub async fn signaling_get(
    State(store): State<SignalingStore>,
    query: Result<Query<SignalingQuery>, QueryRejection>,
) -> Response {
    let Query(query) = match query {
        Ok(query) => query,
        Err(rejection) => {
            return error_response(StatusCode::BAD_REQUEST, rejection.body_text());
        }
    };
    if !is_valid_session_id(&query.session_id) {
        return StoreError::InvalidSessionId.into_response();
    }

    let reply = match query.kind {
        ReadKind::Offer => SignalingReply::with_offer(store.offer(&query.session_id).await),
        ReadKind::Answer => SignalingReply::with_answer(store.answer(&query.session_id).await),
        ReadKind::Candidates => {
            SignalingReply::with_candidates(store.candidates(&query.session_id, query.from).await)
        }
    };
    (StatusCode::OK, Json(reply)).into_response()
}

async fn dispatch(
    store: &SignalingStore,
    request: SignalingRequest,
) -> Result<SignalingReply, StoreError> {
    let reply = match request {
        SignalingRequest::Offer { session_id, data } => {
            store.put_offer(&session_id, data).await?;
            SignalingReply::ack()
        }
        SignalingRequest::Answer { session_id, data } => {
            store.put_answer(&session_id, data).await?;
            SignalingReply::ack()
        }
        SignalingRequest::IceCandidate {
            session_id,
            data,
            from,
        } => {
            store.append_candidate(&session_id, from, data).await?;
            SignalingReply::ack()
        }
        SignalingRequest::GetOffer { session_id } => {
            SignalingReply::with_offer(store.offer(&session_id).await)
        }
        SignalingRequest::GetAnswer { session_id } => {
            SignalingReply::with_answer(store.answer(&session_id).await)
        }
        SignalingRequest::GetCandidates { session_id, from } => {
            SignalingReply::with_candidates(store.candidates(&session_id, from).await)
        }
        SignalingRequest::Clear { session_id } => {
            store.clear(&session_id).await;
            SignalingReply::ack()
        }
    };
    Ok(reply)
}
