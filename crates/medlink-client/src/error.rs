//! Error types for the call client.

use thiserror::Error;

/// Failure of one request against the signaling gateway.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("gateway returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("malformed gateway reply: {0}")]
    Decode(String),
}

impl RelayError {
    /// The gateway refused the request itself; sending it again cannot help.
    /// Timeouts and rate limiting are left to the retry budget.
    pub fn is_rejection(&self) -> bool {
        match self {
            RelayError::Status { status, .. } => {
                (400..500).contains(status) && !matches!(status, 408 | 429)
            }
            _ => false,
        }
    }
}

/// Failure inside the peer transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("webrtc error: {0}")]
    Webrtc(#[from] webrtc::Error),

    #[error("invalid session description: {0}")]
    InvalidDescription(String),

    #[error("no outgoing {0} sender")]
    NoSender(&'static str),

    #[error("data channel unavailable: {0}")]
    Channel(String),

    #[error("transport closed")]
    Closed,
}

/// Everything that can end or degrade a call.
///
/// Every failure inside a session is converted to one of these and reported
/// through the session's event stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("media access denied: {0}")]
    MediaAccessDenied(String),

    #[error("signaling unavailable: {0}")]
    SignalingUnavailable(String),

    #[error("negotiation failed: {0}")]
    NegotiationFailed(String),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("chat channel unavailable: {0}")]
    ChannelUnavailable(String),

    #[error("invalid call state: {0}")]
    InvalidState(String),

    #[error("call ended")]
    Cancelled,
}

impl CallError {
    pub fn negotiation(err: impl std::fmt::Display) -> Self {
        Self::NegotiationFailed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(status: u16) -> RelayError {
        RelayError::Status {
            status,
            message: String::new(),
        }
    }

    #[test]
    fn test_client_errors_are_rejections() {
        assert!(status(400).is_rejection());
        assert!(status(413).is_rejection());
        assert!(!status(429).is_rejection());
        assert!(!status(408).is_rejection());
        assert!(!status(503).is_rejection());
        assert!(!RelayError::Decode("x".into()).is_rejection());
    }
}
