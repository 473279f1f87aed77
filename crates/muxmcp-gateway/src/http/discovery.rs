//! The `/discovery/...` REST surface: the only way to reach the scanner.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use bytes::Bytes;
use serde_json::json;
use std::sync::Arc;

use muxmcp_discovery::{DiscoveryError, ScanConfig};

use super::AppState;

fn bad_request(message: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": "invalid_config", "message": message.into() })),
    )
        .into_response()
}

fn not_found(kind: &str, id: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "not_found", "message": format!("unknown {kind}: {id}") })),
    )
        .into_response()
}

/// POST `/discovery/scan`: submit a scan, answering `{jobId, status}`.
pub async fn submit_scan(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let config: ScanConfig = match serde_json::from_slice(&body) {
        Ok(config) => config,
        Err(e) => return bad_request(e.to_string()),
    };
    match state.jobs.submit(config) {
        Ok(snapshot) => (
            StatusCode::OK,
            Json(json!({ "jobId": snapshot.job_id, "status": snapshot.status })),
        )
            .into_response(),
        Err(DiscoveryError::InvalidConfig { message }) => bad_request(message),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "internal", "message": e.to_string() })),
        )
            .into_response(),
    }
}

/// GET `/discovery/scan`: list every known job.
pub async fn list_scans(State(state): State<Arc<AppState>>) -> Response {
    Json(state.jobs.list()).into_response()
}

/// GET `/discovery/scan/{job_id}`: one job, results included.
pub async fn get_scan(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Response {
    match state.jobs.get(&job_id) {
        Some(snapshot) => Json(snapshot).into_response(),
        None => not_found("scan job", &job_id),
    }
}

/// DELETE `/discovery/scan/{job_id}`: cancel a job.
pub async fn cancel_scan(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Response {
    match state.jobs.cancel(&job_id) {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(DiscoveryError::UnknownJob { .. }) => not_found("scan job", &job_id),
        Err(DiscoveryError::JobFinished { status, .. }) => (
            StatusCode::CONFLICT,
            Json(json!({ "error": "job_finished", "message": format!("job is already {status}") })),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "internal", "message": e.to_string() })),
        )
            .into_response(),
    }
}

/// GET `/discovery/servers`: all discovered servers.
pub async fn list_servers(State(state): State<Arc<AppState>>) -> Response {
    Json(state.discovered.list()).into_response()
}

/// GET `/discovery/servers/{id}`: one discovered server.
pub async fn get_server(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.discovered.get(&id) {
        Some(server) => Json(server).into_response(),
        None => not_found("discovered server", &id),
    }
}
