//! JSON-RPC 2.0 message types carried inside frames.
//!
//! Both ends of a channel issue and serve calls, so every type here is
//! serialisable in both directions. The request id doubles as the stream tag
//! that routes a response back to the caller waiting for it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol version marker carried by every message.
pub const JSONRPC_VERSION: &str = "2.0";

/// Invalid JSON was received.
pub const PARSE_ERROR: i64 = -32700;
/// The message is not a valid request object.
pub const INVALID_REQUEST: i64 = -32600;
/// The method does not exist on this peer.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// The parameters do not match the method.
pub const INVALID_PARAMS: i64 = -32602;
/// The handler failed or panicked.
pub const INTERNAL_ERROR: i64 = -32603;
/// The peer does not export the requested capability.
pub const CAPABILITY_NOT_EXPORTED: i64 = -32001;

/// Built-in method used to request a capability stub.
pub const DISPENSE_METHOD: &str = "$/dispense";
/// Built-in liveness probe answered by the channel itself.
pub const PING_METHOD: &str = "$/ping";

/// A JSON-RPC 2.0 request message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Protocol version, always "2.0".
    pub jsonrpc: String,
    /// Per-channel request identifier.
    pub id: u64,
    /// The method to invoke.
    pub method: String,
    /// Optional parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    /// Creates a request with the given id.
    #[must_use]
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC 2.0 notification (no response expected).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Protocol version, always "2.0".
    pub jsonrpc: String,
    /// The method to invoke.
    pub method: String,
    /// Optional parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Notification {
    /// Creates a new notification.
    #[must_use]
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC 2.0 response message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Protocol version.
    pub jsonrpc: String,
    /// Request identifier this response corresponds to.
    pub id: Option<u64>,
    /// The result on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// The error on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    /// Builds a success response.
    #[must_use]
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    /// Builds an error response.
    #[must_use]
    pub fn failure(id: Option<u64>, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Splits the response into its outcome.
    ///
    /// A response without `error` is a success; a missing or `null` result
    /// is reported as `Value::Null`.
    ///
    /// # Errors
    ///
    /// Returns the embedded error object when the peer reported a failure.
    pub fn into_result(self) -> Result<Value, RpcError> {
        let result = self.result;
        self.error
            .map_or_else(|| Ok(result.unwrap_or(Value::Null)), Err)
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    /// Error code.
    pub code: i64,
    /// Human-readable error message.
    pub message: String,
    /// Optional additional data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    /// Creates an error object without extra data.
    #[must_use]
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Creates a `method not found` error.
    #[must_use]
    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("method '{method}' not found"))
    }

    /// Creates an `invalid params` error.
    #[must_use]
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, message)
    }

    /// Creates an `internal error`.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, message)
    }
}

/// Any message that can appear on a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// A call expecting a response.
    Request(Request),
    /// A call without a response.
    Notification(Notification),
    /// The answer to an earlier request.
    Response(Response),
}

#[derive(Deserialize)]
struct RawMessage {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

impl Message {
    /// Classifies a frame payload.
    ///
    /// Objects with a `method` are requests (with `id`) or notifications
    /// (without); everything else is treated as a response.
    ///
    /// # Errors
    ///
    /// Returns the JSON error when the payload is not a message object.
    pub fn parse(payload: &[u8]) -> Result<Self, serde_json::Error> {
        let raw: RawMessage = serde_json::from_slice(payload)?;
        let message = match (raw.method, raw.id) {
            (Some(method), Some(id)) => Self::Request(Request::new(id, method, raw.params)),
            (Some(method), None) => Self::Notification(Notification::new(method, raw.params)),
            (None, id) => Self::Response(Response {
                jsonrpc: JSONRPC_VERSION.to_owned(),
                id,
                result: raw.result,
                error: raw.error,
            }),
        };
        Ok(message)
    }
}
