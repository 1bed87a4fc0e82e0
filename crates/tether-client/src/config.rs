//! Runtime configuration for a client session.

use crate::reconnect::ReconnectPolicy;
use std::time::Duration;
use tether_types::schema::{ClientCapabilities, Implementation, LATEST_PROTOCOL_VERSION};

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Session settings fixed at build time.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Sent as `clientInfo` during the handshake.
    pub client_info: Implementation,
    pub capabilities: ClientCapabilities,
    /// Version requested in `initialize`.
    pub protocol_version: String,
    /// Per-request timeout; `None` waits indefinitely.
    pub request_timeout: Option<Duration>,
    /// Ping interval on persistent transports; `None` disables the heartbeat.
    pub heartbeat_interval: Option<Duration>,
    pub reconnect: ReconnectPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_info: Implementation::new("tether", env!("CARGO_PKG_VERSION")),
            capabilities: ClientCapabilities::default(),
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
            request_timeout: Some(DEFAULT_REQUEST_TIMEOUT),
            heartbeat_interval: None,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.client_info.name, "tether");
        assert_eq!(config.protocol_version, LATEST_PROTOCOL_VERSION);
        assert_eq!(config.request_timeout, Some(Duration::from_secs(30)));
        assert!(config.heartbeat_interval.is_none());
        assert!(!config.reconnect.enabled);
    }
}
