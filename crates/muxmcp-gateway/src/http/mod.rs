//! The axum surface.
//!
//! Two route families: `/adapters/{name}/...` carries MCP traffic, and
//! `/discovery/...` drives the scanner. Everything shares one [`AppState`].

mod cors;
mod discovery;
mod mcp;

use axum::Router;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use dashmap::DashMap;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

use muxmcp_discovery::{DiscoveryStore, JobManager};

use crate::router::GatewayRouter;

pub use mcp::SseState;

/// Request bodies above this are rejected before parsing.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Shared state behind every handler.
pub struct AppState {
    /// The routing spine.
    pub router: Arc<GatewayRouter>,
    /// Scan jobs.
    pub jobs: Arc<JobManager>,
    /// Discovered servers.
    pub discovered: Arc<DiscoveryStore>,
    /// Per-session SSE numbering and replay buffers.
    pub sse_states: DashMap<String, Arc<parking_lot::Mutex<SseState>>>,
    /// Flipped on SIGINT/SIGTERM.
    pub shutdown: CancellationToken,
}

/// Build the full application router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/adapters/{name}/mcp",
            post(mcp::post_mcp)
                .get(mcp::get_mcp)
                .delete(mcp::delete_mcp)
                .options(mcp::options_mcp)
                .fallback(mcp::method_not_allowed),
        )
        .route("/adapters/{name}/sessions", get(mcp::list_sessions))
        .route("/adapters/{name}/sync", post(mcp::sync_adapter))
        .route(
            "/discovery/scan",
            post(discovery::submit_scan).get(discovery::list_scans),
        )
        .route(
            "/discovery/scan/{job_id}",
            get(discovery::get_scan).delete(discovery::cancel_scan),
        )
        .route("/discovery/servers", get(discovery::list_servers))
        .route("/discovery/servers/{id}", get(discovery::get_server))
        .layer(axum::middleware::from_fn(cors::apply_cors))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(CatchPanicLayer::custom(recover_panic))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Last-resort recovery: a panic anywhere in a handler becomes a -32603
/// with a correlation id, never a stack trace on the wire.
fn recover_panic(panic: Box<dyn std::any::Any + Send + 'static>) -> axum::response::Response {
    let detail = panic
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    let correlation_id = uuid::Uuid::new_v4().to_string();
    error!(%correlation_id, %detail, "handler panicked");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        axum::Json(json!({
            "jsonrpc": "2.0",
            "id": null,
            "error": {
                "code": -32603,
                "message": "Internal error",
                "data": { "correlationId": correlation_id }
            }
        })),
    )
        .into_response()
}
