//! Session connection state.

use crate::error::McpError;
use std::fmt;
use std::time::Duration;

/// The single connection state owned by a session.
#[derive(Debug, Clone)]
pub enum ConnectionState {
    /// Idle. `Some` carries the failure that ended the last connection.
    Disconnected(Option<McpError>),
    /// Transport is opening or the handshake is in flight.
    Connecting,
    /// Handshake complete; requests may be sent.
    Connected,
    /// Teardown in progress.
    Disconnecting,
    /// Waiting `delay` before reconnection attempt number `attempt`.
    Reconnecting { attempt: u32, delay: Duration },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnected(_))
    }

    /// The error that ended the last connection, if any.
    pub fn error(&self) -> Option<&McpError> {
        match self {
            Self::Disconnected(err) => err.as_ref(),
            _ => None,
        }
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected(None)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected(None) => write!(f, "disconnected"),
            Self::Disconnected(Some(e)) => write!(f, "disconnected ({e})"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnecting => write!(f, "disconnecting"),
            Self::Reconnecting { attempt, delay } => {
                write!(f, "reconnecting (attempt {attempt} in {}ms)", delay.as_millis())
            }
        }
    }
}
