//! medlink call client.
//!
//! Drives one participant's side of a consultation call: signaling through
//! the gateway relay, the peer connection, the call lifecycle, chat and
//! screen sharing.

#![forbid(unsafe_code)]

pub mod chat;
pub mod config;
pub mod control;
pub mod error;
pub mod media;
pub mod negotiation;
pub mod notifications;
pub mod peer;
pub mod screen_share;
pub mod session;
pub mod signaling;

pub use chat::{ChatChannel, ChatMessage};
pub use config::{ClientConfig, IceServerConfig, IceServerKind};
pub use control::{new_session_id, GatewayClient};
pub use error::{CallError, RelayError, TransportError};
pub use media::{LocalTrack, MediaConstraints, MediaDevices, SyntheticDevices, TrackKind};
pub use negotiation::Liveness;
pub use notifications::NotificationListener;
pub use peer::{PeerConnectionManager, PeerState, PeerTransport, TransportFactory};
pub use screen_share::{PreviewSource, ScreenShare};
pub use session::{CallEvent, CallParams, CallSession, CallState, EndReason};
pub use signaling::{HttpRelay, SignalingRelay};
