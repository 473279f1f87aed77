//! # muxmcp-protocol
//!
//! Wire types shared by every muxmcp crate: JSON-RPC 2.0 framing and the
//! subset of MCP messages the gateway interprets itself (`initialize`,
//! `notifications/initialized`, capability advertisements). Everything else
//! passes through the gateway as opaque JSON.

pub mod jsonrpc;
pub mod types;

pub use jsonrpc::{
    ErrorCode, Frame, FrameError, JsonRpcError, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, JsonRpcVersion, RequestId, ResponsePayload,
};
pub use types::{
    ClientCapabilities, Implementation, InitializeParams, InitializeResult, PromptsCapability,
    ResourcesCapability, ServerCapabilities, ToolsCapability,
};

/// Protocol version the gateway speaks and answers with on `initialize`.
pub const PROTOCOL_VERSION: &str = "2025-06-18";

/// Versions accepted in the `MCP-Protocol-Version` header.
///
/// Anything else is rejected with `-32600` before routing.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2025-06-18", "2025-03-26", "2024-11-05"];

/// Method name handled locally to establish a session.
pub const METHOD_INITIALIZE: &str = "initialize";

/// Notification name that completes the initialize handshake.
pub const METHOD_INITIALIZED: &str = "notifications/initialized";
