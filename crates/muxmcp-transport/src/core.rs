//! The transport seam.
//!
//! The router is transport-agnostic: it hands a validated frame plus an
//! [`ExchangeContext`] to whichever [`Transport`] the adapter is bound to
//! and gets back a single response, an event stream, or nothing.

use async_trait::async_trait;
use muxmcp_protocol::{Frame, JsonRpcError, JsonRpcResponse};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::TransportResult;

/// Per-call context threaded from the inbound HTTP request to the upstream.
#[derive(Debug, Clone)]
pub struct ExchangeContext {
    /// Deadline for the upstream call. Callers compute the minimum of the
    /// adapter's configured timeout and the inbound request's remaining
    /// deadline before building the context.
    pub deadline: Duration,
    /// Upstream session id to present, if the upstream assigned one.
    pub upstream_session_id: Option<String>,
    /// Upstream event id to resume an SSE stream from.
    pub last_event_id: Option<String>,
    /// Cancelled when the client goes away or the gateway shuts down.
    pub cancel: CancellationToken,
}

impl ExchangeContext {
    /// Context with just a deadline.
    pub fn with_deadline(deadline: Duration) -> Self {
        Self {
            deadline,
            upstream_session_id: None,
            last_event_id: None,
            cancel: CancellationToken::new(),
        }
    }
}

/// One event on an upstream-to-client stream.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A JSON-RPC frame from the upstream, with the upstream's own event
    /// id when it sent one (used for resumption).
    Message {
        /// The frame payload.
        data: Value,
        /// Upstream `id:` field, if present.
        id: Option<String>,
    },
    /// Terminal error; the stream closes after this.
    Error(JsonRpcError),
}

/// A live upstream event stream.
#[derive(Debug)]
pub struct EventStream {
    /// Ordered events; channel closure is end-of-stream.
    pub events: mpsc::Receiver<StreamEvent>,
    /// Session id the upstream assigned on open, if any.
    pub upstream_session_id: Option<String>,
}

/// Outcome of one routed exchange.
#[derive(Debug)]
pub enum Exchange {
    /// Single response frame.
    Response {
        /// The response to relay.
        response: JsonRpcResponse,
        /// Session id the upstream assigned, if any.
        upstream_session_id: Option<String>,
    },
    /// The upstream elected to stream.
    Stream(EventStream),
    /// Notification accepted; nothing to relay.
    None,
}

/// An upstream MCP transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one frame upstream and wait for its outcome.
    async fn exchange(&self, frame: Frame, ctx: &ExchangeContext) -> TransportResult<Exchange>;

    /// Open a server-to-client event stream without sending a frame (the
    /// GET side of streamable HTTP). Transports that cannot stream reject.
    async fn open_stream(&self, _ctx: &ExchangeContext) -> TransportResult<EventStream> {
        Err(crate::error::TransportError::Unsupported {
            operation: "streaming",
        })
    }

    /// Tear the transport down, releasing any owned process or connection.
    async fn shutdown(&self);
}
