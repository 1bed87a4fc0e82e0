//! Error types for MCP sessions.

use std::sync::Arc;
use tether_types::{ErrorObject, RequestId, TransportError};
use thiserror::Error;

/// Errors surfaced by [`McpClient`](crate::McpClient).
///
/// `Clone` so a single connection-level failure can resolve every pending
/// call and also be published as the terminal connection state.
#[derive(Debug, Clone, Error)]
pub enum McpError {
    #[error("Not connected to an MCP server")]
    NotConnected,

    #[error("Already connected or connecting; disconnect first")]
    AlreadyConnected,

    #[error("Failed to encode request: {0}")]
    RequestEncodingFailed(#[source] Arc<serde_json::Error>),

    #[error("Failed to decode response: {0}")]
    ResponseDecodingFailed(#[source] Arc<serde_json::Error>),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Unsolicited response for request {0}")]
    UnsolicitedResponse(RequestId),

    #[error("Unexpected message format: {0}")]
    UnexpectedMessageFormat(String),

    #[error("JSON-RPC error (code {}): {}", .0.code, .0.message)]
    JsonRpc(ErrorObject),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(#[source] Box<McpError>),

    #[error("Server negotiated unsupported protocol version '{0}'")]
    UnsupportedProtocolVersion(String),

    #[error("Heartbeat ping failed: {0}")]
    PingFailed(#[source] Box<McpError>),

    #[error("Gave up reconnecting after {0} attempts")]
    MaxReconnectAttemptsReached(u32),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Request '{method}' timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },
}

impl McpError {
    pub(crate) fn encoding(e: serde_json::Error) -> Self {
        Self::RequestEncodingFailed(Arc::new(e))
    }

    pub(crate) fn decoding(e: serde_json::Error) -> Self {
        Self::ResponseDecodingFailed(Arc::new(e))
    }

    /// Whether this error describes the connection rather than a single call.
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            Self::Transport(_)
                | Self::HandshakeFailed(_)
                | Self::PingFailed(_)
                | Self::MaxReconnectAttemptsReached(_)
        )
    }

    /// The peer's error object, if the server answered with a JSON-RPC error.
    pub fn as_rpc_error(&self) -> Option<&ErrorObject> {
        match self {
            Self::JsonRpc(obj) => Some(obj),
            _ => None,
        }
    }
}
