//! The `/adapters/{name}/mcp` endpoint family.
//!
//! POST carries JSON-RPC (and may upgrade to SSE when the upstream
//! streams), GET opens a client-facing SSE stream, DELETE ends a session,
//! OPTIONS answers preflight. Client-facing SSE events are renumbered by
//! the gateway: ids are strictly increasing integers from 1 per stream,
//! each event wrapping the upstream frame as `{"id":"<n>","data":...}`.
//! A bounded per-session replay buffer serves `Last-Event-ID` reconnects;
//! when the cursor cannot be mapped the stream starts over at 1 and the
//! discontinuity is logged.

use axum::extract::{Path, RawQuery, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use bytes::Bytes;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use muxmcp_protocol::{
    ErrorCode, Frame, JsonRpcError, JsonRpcResponse, JsonRpcVersion, ResponsePayload,
    SUPPORTED_PROTOCOL_VERSIONS,
};
use muxmcp_transport::core::{EventStream, StreamEvent};
use muxmcp_transport::streamable::{LAST_EVENT_ID_HEADER, SESSION_ID_HEADER};

use crate::auth::{self, InboundCredentials};
use crate::error::GatewayError;
use crate::router::{RouteContext, Routed};
use crate::session::Session;

use super::AppState;

/// Header naming the protocol version a client insists on.
pub const PROTOCOL_VERSION_HEADER: &str = "mcp-protocol-version";

/// Events retained per session for reconnect replay.
const REPLAY_BUFFER_EVENTS: usize = 1000;

/// One wrapped event retained for replay.
#[derive(Debug, Clone)]
pub struct BufferedEvent {
    /// Gateway-assigned id.
    pub gw_id: u64,
    /// Upstream `id:` field, used as the resume cursor.
    pub upstream_id: Option<String>,
    /// The upstream frame.
    pub data: Value,
}

/// Per-session SSE numbering and replay state.
#[derive(Debug)]
pub struct SseState {
    next_id: u64,
    buffer: VecDeque<BufferedEvent>,
}

impl Default for SseState {
    fn default() -> Self {
        Self::new()
    }
}

impl SseState {
    /// Fresh state: the first event gets id 1.
    pub fn new() -> Self {
        Self {
            next_id: 1,
            buffer: VecDeque::new(),
        }
    }

    fn reset(&mut self) {
        self.next_id = 1;
        self.buffer.clear();
    }

    /// Whether gateway id `n` has been assigned on this session.
    fn covers(&self, n: u64) -> bool {
        n > 0 && n < self.next_id
    }

    /// Buffered events after gateway id `n`, oldest first.
    fn replay_after(&self, n: u64) -> Vec<BufferedEvent> {
        self.buffer.iter().filter(|e| e.gw_id > n).cloned().collect()
    }

    /// The upstream cursor to resume from, given everything buffered is
    /// replayed locally.
    fn upstream_cursor(&self) -> Option<String> {
        self.buffer.iter().rev().find_map(|e| e.upstream_id.clone())
    }

    /// Assign the next gateway id to an upstream event and buffer it.
    fn assign(&mut self, upstream_id: Option<String>, data: Value) -> u64 {
        let gw_id = self.next_id;
        self.next_id += 1;
        if self.buffer.len() >= REPLAY_BUFFER_EVENTS {
            self.buffer.pop_front();
        }
        self.buffer.push_back(BufferedEvent {
            gw_id,
            upstream_id,
            data,
        });
        gw_id
    }
}

// ---------------------------------------------------------------------------
// Handlers

/// POST: one JSON-RPC frame in, a frame / an SSE stream / 204 out.
pub async fn post_mcp(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(adapter) = state.router.adapters().resolve(&name) else {
        return unknown_adapter(&name);
    };
    if let Err(response) = check_protocol_version(&headers) {
        return response;
    }

    let frame = match Frame::from_slice(&body) {
        Ok(frame) => frame,
        Err(e) => {
            // Parse errors answer on the HTTP channel even for what might
            // have been a notification - there is no id to tell.
            return (StatusCode::OK, Json(invalid_frame_reply(&e))).into_response();
        }
    };

    let cancel = state.shutdown.child_token();
    let outcome = state
        .router
        .route(
            &adapter,
            frame,
            RouteContext {
                creds: InboundCredentials {
                    headers: &headers,
                    query: query.as_deref(),
                },
                session_id: header_value(&headers, SESSION_ID_HEADER),
                cancel: cancel.clone(),
            },
        )
        .await;

    match outcome.routed {
        Routed::Response(response) => {
            respond_rpc(StatusCode::OK, &response, outcome.session_id.as_deref())
        }
        Routed::Stream(stream) => {
            let session_id = outcome
                .session_id
                .clone()
                .or_else(|| header_value(&headers, SESSION_ID_HEADER))
                .unwrap_or_else(|| state.router.sessions().create(&adapter.id).id);
            sse_response(&state, session_id, Vec::new(), stream, cancel)
        }
        Routed::None => {
            let mut response = StatusCode::NO_CONTENT.into_response();
            echo_session(&mut response, outcome.session_id.as_deref());
            response
        }
    }
}

/// GET: open a client-facing SSE stream.
pub async fn get_mcp(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    let Some(adapter) = state.router.adapters().resolve(&name) else {
        return unknown_adapter(&name);
    };
    if let Err(response) = check_protocol_version(&headers) {
        return response;
    }
    if !accepts_event_stream(&headers) {
        let reply = error_reply(
            ErrorCode::InvalidRequest,
            "GET requires Accept: text/event-stream",
        );
        return (StatusCode::BAD_REQUEST, Json(reply)).into_response();
    }
    if let Err(failure) = auth::enforce(
        &adapter.inbound_auth,
        InboundCredentials {
            headers: &headers,
            query: query.as_deref(),
        },
    ) {
        let reply = error_reply(
            ErrorCode::Unauthorized,
            format!("unauthorized: {}", failure.reason()),
        );
        return (StatusCode::UNAUTHORIZED, Json(reply)).into_response();
    }

    let session: Session = header_value(&headers, SESSION_ID_HEADER)
        .and_then(|id| state.router.sessions().get(&id))
        .unwrap_or_else(|| state.router.sessions().create(&adapter.id));

    let last_event_id = header_value(&headers, LAST_EVENT_ID_HEADER)
        .and_then(|text| text.parse::<u64>().ok());

    let sse_state = state
        .sse_states
        .entry(session.id.clone())
        .or_default()
        .clone();

    let (replay, upstream_cursor) = {
        let mut sse = sse_state.lock();
        match last_event_id {
            Some(n) if sse.covers(n) => (sse.replay_after(n), sse.upstream_cursor()),
            Some(n) => {
                warn!(
                    session = %session.id,
                    last_event_id = n,
                    "cannot resume stream, starting over"
                );
                sse.reset();
                (Vec::new(), None)
            }
            None => {
                sse.reset();
                (Vec::new(), None)
            }
        }
    };

    let cancel = state.shutdown.child_token();
    match state
        .router
        .open_stream(&adapter, Some(&session.id), upstream_cursor, cancel.clone())
        .await
    {
        Ok(stream) => sse_response(&state, session.id, replay, stream, cancel),
        Err(e) => {
            let reply = rpc_error_reply(e.to_rpc_error());
            let status = match e {
                GatewayError::Transport(muxmcp_transport::TransportError::Unsupported {
                    ..
                }) => StatusCode::BAD_REQUEST,
                _ => StatusCode::BAD_GATEWAY,
            };
            (status, Json(reply)).into_response()
        }
    }
}

/// DELETE: end the session named by `Mcp-Session-Id`.
pub async fn delete_mcp(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Response {
    let Some(_adapter) = state.router.adapters().resolve(&name) else {
        return unknown_adapter(&name);
    };
    let Some(session_id) = header_value(&headers, SESSION_ID_HEADER) else {
        let reply = error_reply(ErrorCode::InvalidRequest, "Mcp-Session-Id required");
        return (StatusCode::BAD_REQUEST, Json(reply)).into_response();
    };
    state.router.sessions().delete(&session_id);
    state.sse_states.remove(&session_id);
    debug!(%session_id, "session deleted by client");
    StatusCode::NO_CONTENT.into_response()
}

/// OPTIONS: CORS preflight; headers come from the middleware.
pub async fn options_mcp() -> StatusCode {
    StatusCode::NO_CONTENT
}

/// Any other HTTP method on the MCP endpoint.
pub async fn method_not_allowed() -> Response {
    let reply = error_reply(ErrorCode::MethodNotFound, "method not allowed");
    (StatusCode::METHOD_NOT_ALLOWED, Json(reply)).into_response()
}

/// GET `/adapters/{name}/sessions`: list the adapter's live sessions.
pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Response {
    let Some(adapter) = state.router.adapters().resolve(&name) else {
        return unknown_adapter(&name);
    };
    Json(state.router.sessions().list_by_adapter(&adapter.id)).into_response()
}

/// POST `/adapters/{name}/sync`: refetch the adapter's capability record.
pub async fn sync_adapter(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Response {
    let Some(adapter) = state.router.adapters().resolve(&name) else {
        return unknown_adapter(&name);
    };
    match state.router.sync_capabilities(&adapter).await {
        Ok(record) => Json(json!({
            "adapterId": adapter.id,
            "protocolVersion": record.protocol_version,
            "serverInfo": record.server_info,
            "capabilities": record.raw,
            "fetchedAt": record.fetched_at,
        }))
        .into_response(),
        Err(e) => {
            let reply = rpc_error_reply(e.to_rpc_error());
            (StatusCode::BAD_GATEWAY, Json(reply)).into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// SSE plumbing

/// Build the streaming response: replay first, then live events, all
/// renumbered and wrapped. The pump task owns the upstream receiver; the
/// client going away cancels the upstream read.
fn sse_response(
    state: &Arc<AppState>,
    session_id: String,
    replay: Vec<BufferedEvent>,
    mut upstream: EventStream,
    cancel: CancellationToken,
) -> Response {
    let sse_state = state
        .sse_states
        .entry(session_id.clone())
        .or_default()
        .clone();
    let shutdown = state.shutdown.clone();
    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(64);

    tokio::spawn(async move {
        for buffered in replay {
            if send_wrapped(&tx, buffered.gw_id, &buffered.data).await.is_err() {
                cancel.cancel();
                return;
            }
        }

        loop {
            tokio::select! {
                () = tx.closed() => {
                    debug!("client dropped SSE stream");
                    cancel.cancel();
                    return;
                }
                () = shutdown.cancelled() => {
                    let terminal = Event::default()
                        .event("error")
                        .data(r#"{"code":-32603,"message":"gateway shutting down"}"#);
                    let _ = tx.send(Ok(terminal)).await;
                    cancel.cancel();
                    return;
                }
                event = upstream.events.recv() => match event {
                    Some(StreamEvent::Message { data, id }) => {
                        let gw_id = sse_state.lock().assign(id, data.clone());
                        if send_wrapped(&tx, gw_id, &data).await.is_err() {
                            cancel.cancel();
                            return;
                        }
                    }
                    Some(StreamEvent::Error(error)) => {
                        if let Ok(text) = serde_json::to_string(&error) {
                            let _ = tx.send(Ok(Event::default().event("error").data(text))).await;
                        }
                        return;
                    }
                    None => return,
                },
            }
        }
    });

    let sse = Sse::new(ReceiverStream::new(rx)).keep_alive(KeepAlive::default());
    let mut response = sse.into_response();
    echo_session(&mut response, Some(&session_id));
    response
}

async fn send_wrapped(
    tx: &mpsc::Sender<Result<Event, Infallible>>,
    gw_id: u64,
    data: &Value,
) -> Result<(), ()> {
    let wrapped = json!({ "id": gw_id.to_string(), "data": data });
    let Ok(text) = serde_json::to_string(&wrapped) else {
        return Ok(());
    };
    tx.send(Ok(Event::default().id(gw_id.to_string()).data(text)))
        .await
        .map_err(|_| ())
}

// ---------------------------------------------------------------------------
// Small helpers

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string)
}

fn accepts_event_stream(headers: &HeaderMap) -> bool {
    header_value(headers, header::ACCEPT.as_str())
        .is_some_and(|accept| accept.contains("text/event-stream") || accept.contains("*/*"))
}

fn check_protocol_version(headers: &HeaderMap) -> Result<(), Response> {
    let Some(version) = header_value(headers, PROTOCOL_VERSION_HEADER) else {
        return Ok(());
    };
    if SUPPORTED_PROTOCOL_VERSIONS.contains(&version.as_str()) {
        Ok(())
    } else {
        let reply = error_reply(
            ErrorCode::InvalidRequest,
            format!("unsupported protocol version: {version}"),
        );
        Err((StatusCode::BAD_REQUEST, Json(reply)).into_response())
    }
}

fn unknown_adapter(name: &str) -> Response {
    let reply = error_reply(ErrorCode::NotFound, format!("unknown adapter: {name}"));
    (StatusCode::NOT_FOUND, Json(reply)).into_response()
}

/// An id-less error reply (the request id could not be recovered).
fn error_reply(code: ErrorCode, message: impl Into<String>) -> JsonRpcResponse {
    rpc_error_reply(JsonRpcError::new(code, message))
}

fn rpc_error_reply(error: JsonRpcError) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: JsonRpcVersion,
        id: None,
        payload: ResponsePayload::Failure { error },
    }
}

fn invalid_frame_reply(error: &muxmcp_protocol::FrameError) -> JsonRpcResponse {
    rpc_error_reply(JsonRpcError::new(error.error_code(), error.to_string()))
}

fn respond_rpc(status: StatusCode, reply: &JsonRpcResponse, session_id: Option<&str>) -> Response {
    let mut response = (status, Json(reply)).into_response();
    echo_session(&mut response, session_id);
    response
}

fn echo_session(response: &mut Response, session_id: Option<&str>) {
    if let Some(session_id) = session_id
        && let Ok(value) = session_id.parse()
    {
        response.headers_mut().insert(
            axum::http::HeaderName::from_static(SESSION_ID_HEADER),
            value,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn sse_ids_start_at_one_and_increase() {
        let mut state = SseState::new();
        assert_eq!(state.assign(None, json!({"a": 1})), 1);
        assert_eq!(state.assign(Some("u2".to_string()), json!({"a": 2})), 2);
        assert_eq!(state.assign(None, json!({"a": 3})), 3);
        assert!(state.covers(3));
        assert!(!state.covers(4));
        assert!(!state.covers(0));
    }

    #[test]
    fn replay_returns_only_later_events() {
        let mut state = SseState::new();
        for i in 1..=5 {
            state.assign(Some(format!("u{i}")), json!({"n": i}));
        }
        let replay = state.replay_after(2);
        assert_eq!(replay.len(), 3);
        assert_eq!(replay[0].gw_id, 3);
        assert_eq!(state.upstream_cursor().as_deref(), Some("u5"));
    }

    #[test]
    fn buffer_is_bounded() {
        let mut state = SseState::new();
        for i in 1..=(REPLAY_BUFFER_EVENTS as u64 + 10) {
            state.assign(None, json!({"n": i}));
        }
        assert_eq!(state.buffer.len(), REPLAY_BUFFER_EVENTS);
        assert_eq!(state.buffer.front().unwrap().gw_id, 11);
    }

    #[test]
    fn reset_starts_numbering_over() {
        let mut state = SseState::new();
        state.assign(None, json!({}));
        state.reset();
        assert_eq!(state.assign(None, json!({})), 1);
    }

    #[test]
    fn accept_header_matching() {
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, "text/event-stream".parse().unwrap());
        assert!(accepts_event_stream(&headers));

        headers.insert(header::ACCEPT, "application/json".parse().unwrap());
        assert!(!accepts_event_stream(&headers));

        assert!(!accepts_event_stream(&HeaderMap::new()));
    }
}
