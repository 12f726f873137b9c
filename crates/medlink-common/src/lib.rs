//! Shared utilities for medlink: wire protocol, notification bus, logging, error types.
//!
//! Both the signaling gateway and the call client depend on this crate so the
//! two sides of every request agree on one set of serde definitions.

#![forbid(unsafe_code)]

pub mod bus;
pub mod error;
pub mod helpers;
pub mod protocol;

pub use bus::{NotificationBus, Subscription};
pub use error::{Error, Result};
pub use protocol::*;

/// Initialize tracing. `RUST_LOG` wins over `default_level` when set.
pub fn init_tracing_with_default(default_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
