//! Concrete transports for talking to MCP servers.
//!
//! Each transport implements [`tether_types::Transport`]: it moves opaque
//! JSON-RPC frames and reports its lifecycle, leaving protocol semantics
//! to the session.

pub mod config;
mod http;
pub mod http_sse;
pub mod sse;
pub mod stdio;
mod stream;
pub mod streamable;

pub use config::{StdioConfig, TransportConfig};
pub use http::HttpConfig;
pub use http_sse::SseTransport;
pub use sse::{SseEvent, SseParser};
pub use stdio::StdioTransport;
pub use streamable::StreamableHttpTransport;
