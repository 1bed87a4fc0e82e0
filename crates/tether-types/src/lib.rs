//! Shared wire types for Tether.
//!
//! Holds the JSON-RPC 2.0 envelopes, the MCP payload schema, and the
//! transport contract that the session core is written against.

pub mod jsonrpc;
pub mod schema;
pub mod transport;

pub use jsonrpc::{
    ErrorObject, JsonRpcErrorResponse, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, RequestId, ResponsePayload,
};
pub use transport::{
    BoxFuture, MessageStream, Outlet, StateStream, Transport, TransportError, TransportState,
};

/// Opaque JSON payload carried in `params`, `result`, and error `data`.
pub type AnyValue = serde_json::Value;
