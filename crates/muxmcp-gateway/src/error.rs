//! Gateway error taxonomy.

use muxmcp_protocol::{ErrorCode, JsonRpcError};
use thiserror::Error;

/// Result alias for gateway operations.
pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// Errors produced above the transport layer.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GatewayError {
    /// No adapter under that name.
    #[error("unknown adapter: {name}")]
    UnknownAdapter {
        /// The name that missed.
        name: String,
    },

    /// No session under that id.
    #[error("unknown session: {id}")]
    UnknownSession {
        /// The id that missed.
        id: String,
    },

    /// An adapter record violates its own invariants.
    #[error("invalid adapter '{name}': {message}")]
    InvalidAdapter {
        /// Offending adapter.
        name: String,
        /// What is wrong.
        message: String,
    },

    /// Inbound credentials were rejected.
    #[error("unauthorized: {reason}")]
    Unauthorized {
        /// Which enforcement step failed (never the expected value).
        reason: &'static str,
    },

    /// The `MCP-Protocol-Version` header named a version we do not speak.
    #[error("unsupported protocol version: {version}")]
    UnsupportedProtocolVersion {
        /// The offered version.
        version: String,
    },

    /// Configuration problem at startup.
    #[error("configuration error: {message}")]
    Configuration {
        /// What is wrong.
        message: String,
    },

    /// Transport-layer failure, already classified.
    #[error(transparent)]
    Transport(#[from] muxmcp_transport::TransportError),

    /// JSON failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O failure (manifest loading, socket binding).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Configuration-error constructor.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Map onto the JSON-RPC error a client sees.
    pub fn to_rpc_error(&self) -> JsonRpcError {
        match self {
            Self::UnknownAdapter { name } => JsonRpcError::new(
                ErrorCode::NotFound,
                format!("unknown adapter: {name}"),
            ),
            Self::UnknownSession { id } => {
                JsonRpcError::new(ErrorCode::NotFound, format!("unknown session: {id}"))
            }
            Self::Unauthorized { reason } => {
                JsonRpcError::new(ErrorCode::Unauthorized, format!("unauthorized: {reason}"))
            }
            Self::UnsupportedProtocolVersion { version } => JsonRpcError::new(
                ErrorCode::InvalidRequest,
                format!("unsupported protocol version: {version}"),
            ),
            Self::Transport(e) => e.to_rpc_error(),
            _ => JsonRpcError::new(ErrorCode::InternalError, "internal error"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_adapter_is_not_found() {
        let error = GatewayError::UnknownAdapter {
            name: "ghost".to_string(),
        };
        assert_eq!(error.to_rpc_error().code, -32002);
    }

    #[test]
    fn unauthorized_names_the_step_not_the_secret() {
        let error = GatewayError::Unauthorized {
            reason: "credentials mismatch",
        };
        let rpc = error.to_rpc_error();
        assert_eq!(rpc.code, -32001);
        assert!(rpc.message.contains("mismatch"));
    }

    #[test]
    fn transport_errors_pass_through_their_mapping() {
        let error = GatewayError::Transport(muxmcp_transport::TransportError::Timeout);
        assert_eq!(error.to_rpc_error().code, -32603);
    }
}
