//! Common helper functions for medlink.

/// Longest session id accepted by the relay and the call client.
pub const MAX_SESSION_ID_LEN: usize = 128;

/// Reads a boolean flag from the environment (`1`, `true`, `yes`, `on`).
pub fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

/// Session ids are opaque to the relay but must be short printable keys.
pub fn is_valid_session_id(session_id: &str) -> bool {
    let len = session_id.len();
    (1..=MAX_SESSION_ID_LEN).contains(&len)
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':'))
}

/// Participant identities address notification streams.
pub fn is_valid_identity(identity: &str) -> bool {
    let len = identity.len();
    (1..=64).contains(&len)
        && identity
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '@'))
}
