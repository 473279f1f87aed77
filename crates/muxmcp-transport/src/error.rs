//! Transport error taxonomy.
//!
//! Every failure a transport can produce maps onto a JSON-RPC error reply
//! via [`TransportError::to_rpc_error`]. The `data` object carries only a
//! cause class (and HTTP status where there is one) - upstream addresses,
//! stderr output, and io details stay in the log, never on the wire.

use muxmcp_protocol::{ErrorCode, JsonRpcError};
use serde_json::json;
use thiserror::Error;

/// Result alias for transport operations.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Errors produced by the upstream transports.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    /// The child process could not be spawned.
    #[error("failed to spawn child process: {detail}")]
    Spawn {
        /// Spawn failure detail (logged, not forwarded).
        detail: String,
    },

    /// The child process exited while requests were outstanding.
    #[error("upstream exited")]
    ChildExited,

    /// The child is down and a respawn has not yet succeeded.
    #[error("upstream offline, respawn pending")]
    Offline,

    /// The exchange exceeded its deadline.
    #[error("upstream request timed out")]
    Timeout,

    /// The upstream rejected our credentials.
    #[error("upstream rejected credentials (HTTP {status})")]
    Unauthorized {
        /// HTTP status that signalled the rejection.
        status: u16,
    },

    /// Non-success HTTP status without a JSON-RPC body.
    #[error("upstream returned HTTP {status}")]
    HttpStatus {
        /// The status code.
        status: u16,
    },

    /// The upstream replied with something that is not a JSON-RPC frame.
    #[error("upstream protocol error: {detail}")]
    Protocol {
        /// What was malformed (logged, not forwarded).
        detail: String,
    },

    /// The upstream could not be reached at all.
    #[error("upstream unavailable: {detail}")]
    Unavailable {
        /// Connection failure detail (logged, not forwarded).
        detail: String,
    },

    /// The transport does not support the requested operation.
    #[error("transport does not support {operation}")]
    Unsupported {
        /// The unsupported operation.
        operation: &'static str,
    },

    /// The transport has been shut down.
    #[error("transport closed")]
    Closed,

    /// I/O failure on the child process pipes.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TransportError {
    /// Map this failure onto the JSON-RPC error the client sees.
    pub fn to_rpc_error(&self) -> JsonRpcError {
        match self {
            Self::Unauthorized { status } => {
                JsonRpcError::new(ErrorCode::Unauthorized, "Unauthorized")
                    .with_data(json!({ "httpStatus": status }))
            }
            Self::Unsupported { operation } => JsonRpcError::new(
                ErrorCode::InvalidRequest,
                format!("transport does not support {operation}"),
            ),
            Self::ChildExited => JsonRpcError::new(ErrorCode::InternalError, "upstream exited")
                .with_data(json!({ "cause": "upstream-exited" })),
            Self::Offline => JsonRpcError::new(ErrorCode::InternalError, "upstream offline")
                .with_data(json!({ "cause": "upstream-offline" })),
            Self::Timeout => JsonRpcError::new(ErrorCode::InternalError, "upstream timeout")
                .with_data(json!({ "cause": "timeout" })),
            Self::HttpStatus { status } => {
                JsonRpcError::new(ErrorCode::InternalError, "upstream error")
                    .with_data(json!({ "cause": "http-status", "httpStatus": status }))
            }
            Self::Protocol { .. } => {
                JsonRpcError::new(ErrorCode::InternalError, "upstream protocol error")
                    .with_data(json!({ "cause": "upstream-protocol" }))
            }
            Self::Unavailable { .. } | Self::Spawn { .. } => {
                JsonRpcError::new(ErrorCode::InternalError, "upstream unavailable")
                    .with_data(json!({ "cause": "upstream-unavailable" }))
            }
            _ => JsonRpcError::new(ErrorCode::InternalError, "internal error")
                .with_data(json!({ "cause": "internal" })),
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_connect() {
            Self::Unavailable {
                detail: err.to_string(),
            }
        } else {
            Self::Protocol {
                detail: err.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unauthorized_maps_to_domain_code() {
        let rpc = TransportError::Unauthorized { status: 403 }.to_rpc_error();
        assert_eq!(rpc.code, -32001);
        assert_eq!(rpc.data.unwrap()["httpStatus"], 403);
    }

    #[test]
    fn child_exit_keeps_spec_message() {
        let rpc = TransportError::ChildExited.to_rpc_error();
        assert_eq!(rpc.code, -32603);
        assert_eq!(rpc.message, "upstream exited");
    }

    #[test]
    fn data_never_leaks_detail() {
        let rpc = TransportError::Unavailable {
            detail: "tcp connect to 10.0.0.9:9 refused".to_string(),
        }
        .to_rpc_error();
        let rendered = serde_json::to_string(&rpc).unwrap();
        assert!(!rendered.contains("10.0.0.9"));
    }

    #[test]
    fn unsupported_is_invalid_request() {
        let rpc = TransportError::Unsupported { operation: "streaming" }.to_rpc_error();
        assert_eq!(rpc.code, -32600);
    }
}
