//! Locally handled MCP methods.
//!
//! `initialize` and `notifications/initialized` never reach an upstream:
//! the gateway answers them from its own session and capability state.
//! The helpers here are pure; the router owns the orchestration.

use muxmcp_protocol::{
    ErrorCode, Implementation, InitializeParams, InitializeResult, JsonRpcError, JsonRpcRequest,
    PROTOCOL_VERSION,
};
use tracing::debug;

use crate::adapter::Adapter;
use crate::capabilities::CapabilityRecord;

/// The identity the gateway answers with for an adapter.
pub fn server_info_for(adapter: &Adapter) -> Implementation {
    Implementation::new(
        format!("{} for {}", crate::GATEWAY_NAME, adapter.display_name()),
        env!("CARGO_PKG_VERSION"),
    )
}

/// Parse and sanity-check `initialize` params.
pub fn parse_initialize_params(request: &JsonRpcRequest) -> Result<InitializeParams, JsonRpcError> {
    let params = request.params.clone().ok_or_else(|| {
        JsonRpcError::new(ErrorCode::InvalidParams, "initialize requires params")
    })?;
    serde_json::from_value(params)
        .map_err(|e| JsonRpcError::new(ErrorCode::InvalidParams, e.to_string()))
}

/// Build the initialize result for an adapter from its capability record.
///
/// The gateway always answers with its own protocol version; a client
/// proposing something else learns ours and decides whether to proceed.
pub fn initialize_result(adapter: &Adapter, record: &CapabilityRecord) -> InitializeResult {
    InitializeResult {
        protocol_version: PROTOCOL_VERSION.to_string(),
        capabilities: record.capabilities.clone(),
        server_info: server_info_for(adapter),
        instructions: None,
    }
}

/// Log a version mismatch between what the client proposed and what the
/// gateway answers.
pub fn note_version_proposal(params: &InitializeParams) {
    if params.protocol_version != PROTOCOL_VERSION {
        debug!(
            proposed = %params.protocol_version,
            answering = PROTOCOL_VERSION,
            "client proposed a different protocol version"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn adapter() -> Adapter {
        serde_json::from_value(json!({"id": "fs", "kind": "Stdio", "command": "cat"})).unwrap()
    }

    #[test]
    fn server_info_composes_gateway_and_adapter_names() {
        let info = server_info_for(&adapter());
        assert_eq!(info.name, "MCP Proxy for fs");
        assert_eq!(info.version, "1.0.0");
    }

    #[test]
    fn server_info_prefers_the_human_name() {
        let mut adapter = adapter();
        adapter.name = Some("filesystem".to_string());
        assert_eq!(server_info_for(&adapter).name, "MCP Proxy for filesystem");
    }

    #[test]
    fn initialize_answers_with_the_gateway_version() {
        let record = CapabilityRecord::empty();
        let result = initialize_result(&adapter(), &record);
        assert_eq!(result.protocol_version, PROTOCOL_VERSION);
    }

    #[test]
    fn params_validation() {
        let ok = JsonRpcRequest::new(
            7i64,
            "initialize",
            Some(json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "clientInfo": {"name": "t", "version": "1"}
            })),
        );
        let params = parse_initialize_params(&ok).unwrap();
        assert_eq!(params.client_info.name, "t");

        let missing = JsonRpcRequest::new(7i64, "initialize", None);
        assert_eq!(
            parse_initialize_params(&missing).unwrap_err().code,
            -32602
        );

        let malformed = JsonRpcRequest::new(7i64, "initialize", Some(json!({"nope": 1})));
        assert_eq!(
            parse_initialize_params(&malformed).unwrap_err().code,
            -32602
        );
    }
}
