use std::fmt;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{Error, Result};

/// Which side of the offer/answer exchange a participant plays.
///
/// The role is fixed when the session is created: the party that creates the
/// session id (and asks the gateway to ring the other side) is the initiator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    /// The role of the other participant.
    pub fn peer(self) -> Role {
        match self {
            Role::Initiator => Role::Responder,
            Role::Responder => Role::Initiator,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Initiator => "initiator",
            Role::Responder => "responder",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// A session description as browsers serialize `RTCSessionDescriptionInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A trickled network-path candidate (`RTCIceCandidateInit`).
///
/// Equality is content equality; receivers use it to apply each candidate once.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// Request body of `POST /api/webrtc/signaling`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingRequest {
    Offer {
        #[serde(rename = "sessionId")]
        session_id: String,
        data: SessionDescription,
    },
    Answer {
        #[serde(rename = "sessionId")]
        session_id: String,
        data: SessionDescription,
    },
    IceCandidate {
        #[serde(rename = "sessionId")]
        session_id: String,
        data: IceCandidate,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<Role>,
    },
    GetOffer {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    GetAnswer {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    GetCandidates {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<Role>,
    },
    Clear {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
}

impl SignalingRequest {
    pub fn session_id(&self) -> &str {
        match self {
            SignalingRequest::Offer { session_id, .. }
            | SignalingRequest::Answer { session_id, .. }
            | SignalingRequest::IceCandidate { session_id, .. }
            | SignalingRequest::GetOffer { session_id }
            | SignalingRequest::GetAnswer { session_id }
            | SignalingRequest::GetCandidates { session_id, .. }
            | SignalingRequest::Clear { session_id } => session_id,
        }
    }

    /// Wire name of the operation, used in logs.
    pub fn op_name(&self) -> &'static str {
        match self {
            SignalingRequest::Offer { .. } => "offer",
            SignalingRequest::Answer { .. } => "answer",
            SignalingRequest::IceCandidate { .. } => "ice-candidate",
            SignalingRequest::GetOffer { .. } => "get-offer",
            SignalingRequest::GetAnswer { .. } => "get-answer",
            SignalingRequest::GetCandidates { .. } => "get-candidates",
            SignalingRequest::Clear { .. } => "clear",
        }
    }
}

/// Which slot a `GET /api/webrtc/signaling` reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadKind {
    Offer,
    Answer,
    Candidates,
}

/// Query string of `GET /api/webrtc/signaling`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingQuery {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(rename = "type")]
    pub kind: ReadKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<Role>,
}

/// Reply of every relay operation. Only the field matching the operation is set;
/// an absent offer or answer is simply a missing field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalingReply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidates: Option<Vec<IceCandidate>>,
}

impl SignalingReply {
    pub fn ack() -> Self {
        Self {
            success: Some(true),
            ..Default::default()
        }
    }

    pub fn with_offer(offer: Option<SessionDescription>) -> Self {
        Self {
            offer,
            ..Default::default()
        }
    }

    pub fn with_answer(answer: Option<SessionDescription>) -> Self {
        Self {
            answer,
            ..Default::default()
        }
    }

    pub fn with_candidates(candidates: Vec<IceCandidate>) -> Self {
        Self {
            candidates: Some(candidates),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// One side of a consultation as the surrounding application knows it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub name: String,
}

impl Participant {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Urgency {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

/// Minimal case context carried with an incoming-session alert.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaseContext {
    pub patient_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symptoms: Option<String>,
    #[serde(default)]
    pub urgency: Urgency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallAction {
    Initiate,
    End,
}

/// Request body of `POST /api/video-call`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallControlRequest {
    pub session_id: String,
    pub action: CallAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initiator: Option<Participant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responder: Option<Participant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case_context: Option<CaseContext>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallControlReply {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotificationKind {
    Connected,
    Ping,
    IncomingSession,
    SessionEnded,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationKind::Connected => "connected",
            NotificationKind::Ping => "ping",
            NotificationKind::IncomingSession => "incoming-session",
            NotificationKind::SessionEnded => "session-ended",
        }
    }
}

/// Envelope pushed on the notification stream: `{type, sessionId?, data}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEvent {
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Identity the event is addressed to; `None` reaches every stream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl NotificationEvent {
    pub fn connected() -> Self {
        Self {
            kind: NotificationKind::Connected,
            session_id: None,
            recipient: None,
            data: serde_json::json!({ "message": "connected to notifications" }),
        }
    }

    pub fn ping() -> Self {
        Self {
            kind: NotificationKind::Ping,
            session_id: None,
            recipient: None,
            data: serde_json::Value::Null,
        }
    }

    pub fn incoming_session(recipient: Option<String>, payload: &IncomingSession) -> Result<Self> {
        Ok(Self {
            kind: NotificationKind::IncomingSession,
            session_id: Some(payload.session_id.clone()),
            recipient,
            data: serde_json::to_value(payload)?,
        })
    }

    pub fn session_ended(recipient: Option<String>, payload: &SessionEnded) -> Result<Self> {
        Ok(Self {
            kind: NotificationKind::SessionEnded,
            session_id: Some(payload.session_id.clone()),
            recipient,
            data: serde_json::to_value(payload)?,
        })
    }

    /// Whether a stream opened for `identity` should see this event.
    pub fn is_addressed_to(&self, identity: &str) -> bool {
        match self.recipient.as_deref() {
            Some(recipient) => recipient == identity,
            None => true,
        }
    }

    /// Decodes the typed payload carried in `data`.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.data.clone()).map_err(|e| {
            Error::protocol(format!(
                "malformed {} payload: {}",
                self.kind.as_str(),
                e
            ))
        })
    }
}

/// Payload of an `incoming-session` notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingSession {
    pub session_id: String,
    pub initiator: Participant,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case_context: Option<CaseContext>,
    pub timestamp: DateTime<Utc>,
}

/// Payload of a `session-ended` notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEnded {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

/// Chat payload exchanged over the data channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatPayload {
    pub sender: String,
    pub text: String,
}
