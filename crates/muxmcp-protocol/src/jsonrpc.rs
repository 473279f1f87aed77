//! JSON-RPC 2.0 framing.
//!
//! The gateway validates every inbound frame before routing it, and must
//! distinguish unparseable bytes (`-32700`) from well-formed JSON that is
//! not a JSON-RPC 2.0 message (`-32600`). [`Frame::from_slice`] encodes
//! that distinction; the typed structs below carry frames through the
//! router and transports without re-serializing parameter payloads.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;

/// JSON-RPC version constant.
pub const JSONRPC_VERSION: &str = "2.0";

/// Zero-sized marker that serializes as the literal `"2.0"` and refuses
/// anything else on deserialization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JsonRpcVersion;

impl Serialize for JsonRpcVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(JSONRPC_VERSION)
    }
}

impl<'de> Deserialize<'de> for JsonRpcVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let version = String::deserialize(deserializer)?;
        if version == JSONRPC_VERSION {
            Ok(JsonRpcVersion)
        } else {
            Err(serde::de::Error::custom(format!(
                "invalid JSON-RPC version: expected '{JSONRPC_VERSION}', got '{version}'"
            )))
        }
    }
}

/// Request identifier: a string or an integer, per JSON-RPC 2.0.
///
/// Clients pick their own id space; the stdio transport replaces ids with
/// its own `Number` ids on the wire and restores the original before the
/// response leaves the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// String identifier.
    String(String),
    /// Numeric identifier.
    Number(i64),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s}"),
            Self::Number(n) => write!(f, "{n}"),
        }
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

/// JSON-RPC request message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// Protocol version marker.
    pub jsonrpc: JsonRpcVersion,
    /// Request identifier.
    pub id: RequestId,
    /// Method name.
    pub method: String,
    /// Method parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Create a request.
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC notification (a request without an id; no response follows).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    /// Protocol version marker.
    pub jsonrpc: JsonRpcVersion,
    /// Method name.
    pub method: String,
    /// Method parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    /// Create a notification.
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            method: method.into(),
            params,
        }
    }
}

/// Either `result` or `error`, never both.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponsePayload {
    /// Successful result.
    Success {
        /// Result value.
        result: Value,
    },
    /// Error outcome.
    Failure {
        /// Error object.
        error: JsonRpcError,
    },
}

/// JSON-RPC response message.
///
/// `id` is `None` only for parse-error replies, where the request id could
/// not be recovered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// Protocol version marker.
    pub jsonrpc: JsonRpcVersion,
    /// Identifier of the request being answered; null for parse errors.
    pub id: Option<RequestId>,
    /// Result or error.
    #[serde(flatten)]
    pub payload: ResponsePayload,
}

impl JsonRpcResponse {
    /// Successful response for `id`.
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            id: Some(id),
            payload: ResponsePayload::Success { result },
        }
    }

    /// Error response for `id`.
    pub fn error(id: RequestId, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            id: Some(id),
            payload: ResponsePayload::Failure { error },
        }
    }

    /// Parse-error response with a null id.
    pub fn parse_error(message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            id: None,
            payload: ResponsePayload::Failure {
                error: JsonRpcError::new(ErrorCode::ParseError, message),
            },
        }
    }

    /// The result value, if this is a success.
    pub fn result(&self) -> Option<&Value> {
        match &self.payload {
            ResponsePayload::Success { result } => Some(result),
            ResponsePayload::Failure { .. } => None,
        }
    }

    /// The error object, if this is a failure.
    pub fn error_object(&self) -> Option<&JsonRpcError> {
        match &self.payload {
            ResponsePayload::Success { .. } => None,
            ResponsePayload::Failure { error } => Some(error),
        }
    }

    /// Whether this response carries a result.
    pub fn is_success(&self) -> bool {
        matches!(self.payload, ResponsePayload::Success { .. })
    }
}

/// JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Numeric error code.
    pub code: i32,
    /// Human-readable message.
    pub message: String,
    /// Optional structured detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    /// Create an error with a code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.code(),
            message: message.into(),
            data: None,
        }
    }

    /// Attach structured detail.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

impl From<ErrorCode> for JsonRpcError {
    fn from(code: ErrorCode) -> Self {
        Self {
            code: code.code(),
            message: code.message().to_string(),
            data: None,
        }
    }
}

/// Error codes the gateway emits: the standard JSON-RPC five plus the two
/// domain codes the MCP surface uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Parse error (-32700).
    ParseError,
    /// Invalid request (-32600).
    InvalidRequest,
    /// Method not found (-32601).
    MethodNotFound,
    /// Invalid params (-32602).
    InvalidParams,
    /// Internal error (-32603).
    InternalError,
    /// Unauthorized (-32001).
    Unauthorized,
    /// Not found (-32002).
    NotFound,
    /// Any other application-defined code, forwarded verbatim.
    Application(i32),
}

impl ErrorCode {
    /// Numeric code.
    pub fn code(self) -> i32 {
        match self {
            Self::ParseError => -32700,
            Self::InvalidRequest => -32600,
            Self::MethodNotFound => -32601,
            Self::InvalidParams => -32602,
            Self::InternalError => -32603,
            Self::Unauthorized => -32001,
            Self::NotFound => -32002,
            Self::Application(code) => code,
        }
    }

    /// Canonical message.
    pub fn message(self) -> &'static str {
        match self {
            Self::ParseError => "Parse error",
            Self::InvalidRequest => "Invalid Request",
            Self::MethodNotFound => "Method not found",
            Self::InvalidParams => "Invalid params",
            Self::InternalError => "Internal error",
            Self::Unauthorized => "Unauthorized",
            Self::NotFound => "Not found",
            Self::Application(_) => "Application error",
        }
    }
}

impl From<i32> for ErrorCode {
    fn from(code: i32) -> Self {
        match code {
            -32700 => Self::ParseError,
            -32600 => Self::InvalidRequest,
            -32601 => Self::MethodNotFound,
            -32602 => Self::InvalidParams,
            -32603 => Self::InternalError,
            -32001 => Self::Unauthorized,
            -32002 => Self::NotFound,
            other => Self::Application(other),
        }
    }
}

/// A validated inbound frame.
#[derive(Debug, Clone)]
pub enum Frame {
    /// Request expecting a response.
    Request(JsonRpcRequest),
    /// Notification expecting nothing.
    Notification(JsonRpcNotification),
    /// Response (relevant on upstream-facing pipes).
    Response(JsonRpcResponse),
}

impl Frame {
    /// Method name, if this frame has one.
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request(r) => Some(&r.method),
            Self::Notification(n) => Some(&n.method),
            Self::Response(_) => None,
        }
    }

    /// Request id, if this frame has one.
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Self::Request(r) => Some(&r.id),
            Self::Notification(_) => None,
            Self::Response(r) => r.id.as_ref(),
        }
    }

    /// Serialize back to a JSON value.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Request(r) => serde_json::to_value(r),
            Self::Notification(n) => serde_json::to_value(n),
            Self::Response(r) => serde_json::to_value(r),
        }
        .expect("frame serialization is infallible")
    }

    /// Validate raw bytes as a single JSON-RPC 2.0 frame.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.is_empty() {
            return Err(FrameError::Parse("empty body".to_string()));
        }
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| FrameError::Parse(e.to_string()))?;
        Self::from_value(value)
    }

    /// Validate an already-parsed JSON value as a frame.
    pub fn from_value(value: Value) -> Result<Self, FrameError> {
        let obj = value
            .as_object()
            .ok_or_else(|| FrameError::Invalid("frame is not a JSON object".to_string()))?;

        match obj.get("jsonrpc").and_then(Value::as_str) {
            Some(JSONRPC_VERSION) => {}
            Some(other) => {
                return Err(FrameError::Invalid(format!(
                    "unsupported jsonrpc version '{other}'"
                )));
            }
            None => return Err(FrameError::Invalid("missing 'jsonrpc' field".to_string())),
        }

        let has_method = obj.contains_key("method");
        let has_result = obj.contains_key("result");
        let has_error = obj.contains_key("error");

        match (has_method, has_result, has_error) {
            (true, false, false) => {
                if obj.contains_key("id") {
                    serde_json::from_value(value)
                        .map(Self::Request)
                        .map_err(|e| FrameError::Invalid(e.to_string()))
                } else {
                    serde_json::from_value(value)
                        .map(Self::Notification)
                        .map_err(|e| FrameError::Invalid(e.to_string()))
                }
            }
            (false, true, false) | (false, false, true) => serde_json::from_value(value)
                .map(Self::Response)
                .map_err(|e| FrameError::Invalid(e.to_string())),
            (false, false, false) => Err(FrameError::Invalid(
                "frame has neither 'method' nor 'result'/'error'".to_string(),
            )),
            _ => Err(FrameError::Invalid(
                "frame mixes request and response fields".to_string(),
            )),
        }
    }
}

/// Why a frame failed validation. [`FrameError::Parse`] maps to `-32700`,
/// [`FrameError::Invalid`] to `-32600`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FrameError {
    /// Bytes were not valid JSON.
    #[error("parse error: {0}")]
    Parse(String),
    /// Valid JSON, but not a JSON-RPC 2.0 frame.
    #[error("invalid request: {0}")]
    Invalid(String),
}

impl FrameError {
    /// Error code for a reply carrying this failure.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Parse(_) => ErrorCode::ParseError,
            Self::Invalid(_) => ErrorCode::InvalidRequest,
        }
    }
}
