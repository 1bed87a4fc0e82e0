//! JSON-RPC 2.0 envelopes for MCP communication.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;

pub const JSONRPC_VERSION: &str = "2.0";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

/// The `"jsonrpc": "2.0"` marker. Rejects any other version on input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Version;

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(JSONRPC_VERSION)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        if value == JSONRPC_VERSION {
            Ok(Version)
        } else {
            Err(serde::de::Error::custom(format!(
                "unsupported jsonrpc version '{value}'"
            )))
        }
    }
}

/// A request identifier: either a string or an integer, echoed verbatim by the peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => f.write_str(s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(id: i64) -> Self {
        RequestId::Number(id)
    }
}

impl From<String> for RequestId {
    fn from(id: String) -> Self {
        RequestId::String(id)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        RequestId::String(id.to_string())
    }
}

/// A JSON-RPC 2.0 request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: Version,
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: Version,
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC 2.0 notification (no id, no response expected).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: Version,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    /// Create a new JSON-RPC notification.
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: Version,
            method: method.into(),
            params,
        }
    }
}

/// A successful JSON-RPC 2.0 response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: Version,
    pub id: RequestId,
    pub result: Value,
}

impl JsonRpcResponse {
    pub fn new(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: Version,
            id,
            result,
        }
    }
}

/// A failed JSON-RPC 2.0 response. `id` is null when the peer could not read it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcErrorResponse {
    pub jsonrpc: Version,
    pub id: Option<RequestId>,
    pub error: ErrorObject,
}

impl JsonRpcErrorResponse {
    pub fn new(id: Option<RequestId>, error: ErrorObject) -> Self {
        Self {
            jsonrpc: Version,
            id,
            error,
        }
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }

    pub fn invalid_params(detail: impl fmt::Display) -> Self {
        Self::new(INVALID_PARAMS, format!("Invalid params: {detail}"))
    }

    pub fn internal_error(detail: impl fmt::Display) -> Self {
        Self::new(INTERNAL_ERROR, format!("Internal error: {detail}"))
    }
}

impl fmt::Display for ErrorObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// Payload of a response-class message, still undecoded.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePayload {
    Result(Value),
    Error(Value),
}

impl ResponsePayload {
    /// Split into the success value or the peer's error object.
    ///
    /// Fails only when the `error` member is not a valid error object.
    pub fn into_outcome(self) -> Result<Result<Value, ErrorObject>, serde_json::Error> {
        match self {
            ResponsePayload::Result(value) => Ok(Ok(value)),
            ResponsePayload::Error(raw) => serde_json::from_value(raw).map(Err),
        }
    }
}

/// An inbound message after classification on its discriminant fields.
#[derive(Debug, Clone, PartialEq)]
pub enum JsonRpcMessage {
    /// Carries an id and a `result` or `error` member.
    Response {
        id: RequestId,
        payload: ResponsePayload,
    },
    /// Carries a method and no id.
    Notification {
        method: String,
        params: Option<Value>,
    },
    /// Carries both a method and an id; the peer expects a reply.
    Request {
        id: RequestId,
        method: String,
        params: Option<Value>,
    },
    /// Valid JSON object that fits none of the above.
    Malformed { reason: String },
}

/// Discriminant view of an envelope. `result: null` counts as present.
#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(default)]
    id: Option<RequestId>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default, deserialize_with = "present")]
    params: Option<Value>,
    #[serde(default, deserialize_with = "present")]
    result: Option<Value>,
    #[serde(default, deserialize_with = "present")]
    error: Option<Value>,
}

fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

impl JsonRpcMessage {
    /// Classify one inbound frame.
    ///
    /// Returns an error only when the bytes are not a JSON object with
    /// well-typed `id`/`method` members.
    pub fn parse(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let raw: RawEnvelope = serde_json::from_slice(bytes)?;
        Ok(Self::classify(raw))
    }

    fn classify(raw: RawEnvelope) -> Self {
        match (raw.id, raw.method) {
            (Some(id), _) if raw.error.is_some() || raw.result.is_some() => {
                // An error member wins over a result member.
                let payload = match raw.error {
                    Some(error) => ResponsePayload::Error(error),
                    None => ResponsePayload::Result(raw.result.unwrap_or_default()),
                };
                JsonRpcMessage::Response { id, payload }
            }
            (None, Some(method)) => JsonRpcMessage::Notification {
                method,
                params: raw.params,
            },
            (Some(id), Some(method)) => JsonRpcMessage::Request {
                id,
                method,
                params: raw.params,
            },
            (None, None) => {
                let reason = match raw.error {
                    Some(error) => format!("error response without id: {error}"),
                    None => "message has neither id nor method".to_string(),
                };
                JsonRpcMessage::Malformed { reason }
            }
            (Some(id), None) => JsonRpcMessage::Malformed {
                reason: format!("message {id} has no method, result, or error"),
            },
        }
    }
}
