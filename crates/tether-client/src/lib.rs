//! MCP client session for Tether.
//!
//! [`McpClient`] drives one connection to an MCP server over any
//! [`Transport`](tether_types::Transport): the `initialize` handshake,
//! request/response correlation, server notifications and requests, an
//! optional heartbeat, and reconnection with exponential backoff.

mod api;
pub mod builder;
pub mod config;
pub mod error;
pub mod handler;
mod pending;
pub mod reconnect;
mod session;
pub mod state;

pub use builder::McpClientBuilder;
pub use config::ClientConfig;
pub use error::McpError;
pub use handler::{NoopNotificationHandler, NotificationHandler};
pub use reconnect::ReconnectPolicy;
pub use session::McpClient;
pub use state::ConnectionState;
