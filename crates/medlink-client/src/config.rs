//! Client configuration.

use std::time::Duration;

use medlink_common::{Error, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_SIGNALING_FAILURES: u32 = 10;
pub const DEFAULT_RECONNECT_GRACE: Duration = Duration::from_secs(10);
pub const DEFAULT_NOTIFICATION_RETRY: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceServerKind {
    Stun,
    Turn,
}

/// One STUN/TURN server as configured by the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    #[serde(rename = "type")]
    pub kind: IceServerKind,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServerConfig {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            kind: IceServerKind::Stun,
            url: url.into(),
            username: None,
            credential: None,
        }
    }

    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            kind: IceServerKind::Turn,
            url: url.into(),
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }

    /// The URL with a `stun:`/`turn:` scheme, added from `kind` when missing.
    pub fn url_with_scheme(&self) -> String {
        let url = self.url.trim();
        if ["stun:", "stuns:", "turn:", "turns:"]
            .iter()
            .any(|scheme| url.starts_with(scheme))
        {
            return url.to_string();
        }
        match self.kind {
            IceServerKind::Turn => format!("turn:{}", url),
            IceServerKind::Stun => format!("stun:{}", url),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(Error::config("ICE server URL cannot be empty"));
        }
        if self.kind == IceServerKind::Turn {
            let has = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.is_empty());
            if !has(&self.username) || !has(&self.credential) {
                return Err(Error::config(format!(
                    "TURN server {} requires username and credential",
                    self.url
                )));
            }
        }
        Ok(())
    }
}

pub fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![
        IceServerConfig::stun("stun:stun.l.google.com:19302"),
        IceServerConfig::stun("stun:stun1.l.google.com:19302"),
        IceServerConfig::stun("stun:stun2.l.google.com:19302"),
    ]
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the gateway, e.g. `http://127.0.0.1:3000`.
    pub gateway_url: String,
    pub poll_interval: Duration,
    /// Consecutive failed relay requests tolerated before the call fails.
    pub max_signaling_failures: u32,
    /// How long a disconnected transport may take to recover.
    pub reconnect_grace: Duration,
    pub notification_retry: Duration,
    pub ice_servers: Vec<IceServerConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            gateway_url: "http://127.0.0.1:3000".to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_signaling_failures: DEFAULT_MAX_SIGNALING_FAILURES,
            reconnect_grace: DEFAULT_RECONNECT_GRACE,
            notification_retry: DEFAULT_NOTIFICATION_RETRY,
            ice_servers: default_ice_servers(),
        }
    }
}

impl ClientConfig {
    pub fn new(gateway_url: impl Into<String>) -> Self {
        Self {
            gateway_url: gateway_url.into().trim_end_matches('/').to_string(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.gateway_url.starts_with("http://") || self.gateway_url.starts_with("https://")) {
            return Err(Error::config(format!(
                "gateway URL must be http(s): {}",
                self.gateway_url
            )));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::config("poll interval must be positive"));
        }
        if self.max_signaling_failures == 0 {
            return Err(Error::config("max signaling failures must be at least 1"));
        }
        for server in &self.ice_servers {
            server.validate()?;
        }
        Ok(())
    }

    /// Parses a JSON list of `{type, url, username, credential}` records.
    pub fn with_ice_servers_json(mut self, json: &str) -> Result<Self> {
        let servers: Vec<IceServerConfig> = serde_json::from_str(json)?;
        for server in &servers {
            server.validate()?;
        }
        if !servers.is_empty() {
            self.ice_servers = servers;
        }
        Ok(self)
    }
}
