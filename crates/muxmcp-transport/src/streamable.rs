//! Streamable HTTP transport (MCP streamable-HTTP specification).
//!
//! POST exchanges behave like the remote HTTP transport until the upstream
//! answers with `text/event-stream`, at which point the exchange becomes a
//! stream: a producer task reads SSE events off the response body and
//! pushes them into a bounded channel. The consumer side must keep up - if
//! it stalls the upstream reader past the configured backpressure window
//! the stream is closed with an error event.
//!
//! Upstream session ids arrive in the `Mcp-Session-Id` response header and
//! are surfaced so the gateway can map them one-to-one onto its sessions.
//! `Last-Event-ID` is forwarded on reconnects for upstreams that support
//! resumption.

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use muxmcp_protocol::{ErrorCode, Frame, JsonRpcError, JsonRpcResponse};

use crate::config::StreamableConfig;
use crate::core::{EventStream, Exchange, ExchangeContext, StreamEvent, Transport};
use crate::error::{TransportError, TransportResult};
use crate::sse::SseDecoder;

/// Header carrying the MCP session id.
pub const SESSION_ID_HEADER: &str = "mcp-session-id";
/// Header carrying the SSE resumption cursor.
pub const LAST_EVENT_ID_HEADER: &str = "last-event-id";

/// Transport for a streamable-HTTP upstream.
#[derive(Debug)]
pub struct StreamableHttpTransport {
    client: reqwest::Client,
    config: StreamableConfig,
}

impl StreamableHttpTransport {
    /// Build the transport and its pooled HTTP client.
    pub fn new(config: StreamableConfig) -> TransportResult<Self> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| TransportError::Unavailable {
                detail: format!("failed to build HTTP client: {e}"),
            })?;
        debug!(url = %config.url, "created streamable HTTP transport");
        Ok(Self { client, config })
    }

    fn apply_common(
        &self,
        mut req: reqwest::RequestBuilder,
        ctx: &ExchangeContext,
    ) -> reqwest::RequestBuilder {
        req = req.header(
            reqwest::header::ACCEPT,
            "application/json, text/event-stream",
        );
        if let Some(ref session) = ctx.upstream_session_id {
            req = req.header(SESSION_ID_HEADER, session);
        }
        if let Some(ref auth) = self.config.auth {
            req = auth.apply(req);
        }
        req
    }

    /// Await response headers within the exchange deadline; the body may
    /// outlive the deadline when it turns out to be a stream.
    async fn send(
        &self,
        req: reqwest::RequestBuilder,
        ctx: &ExchangeContext,
    ) -> TransportResult<reqwest::Response> {
        let deadline = ctx.deadline.min(self.config.request_timeout);
        let response = tokio::select! {
            result = tokio::time::timeout(deadline, req.send()) => {
                result.map_err(|_| TransportError::Timeout)??
            }
            () = ctx.cancel.cancelled() => return Err(TransportError::Closed),
        };

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(TransportError::Unauthorized {
                status: status.as_u16(),
            });
        }
        Ok(response)
    }

    fn spawn_producer(&self, response: reqwest::Response, cancel: CancellationToken) -> EventStream {
        let upstream_session_id = session_id_of(&response);
        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        let backpressure = self.config.backpressure;

        tokio::spawn(async move {
            let mut body = response.bytes_stream();
            let mut decoder = SseDecoder::new();
            'read: loop {
                let chunk = tokio::select! {
                    chunk = body.next() => chunk,
                    () = cancel.cancelled() => {
                        debug!("client cancelled, closing upstream stream");
                        break 'read;
                    }
                };
                let bytes = match chunk {
                    Some(Ok(bytes)) => bytes,
                    Some(Err(e)) => {
                        warn!(error = %e, "upstream stream failed");
                        let _ = tx.try_send(StreamEvent::Error(
                            TransportError::from(e).to_rpc_error(),
                        ));
                        break 'read;
                    }
                    None => break 'read,
                };

                for event in decoder.feed(&bytes) {
                    let data = match serde_json::from_str(&event.data) {
                        Ok(value) => value,
                        Err(e) => {
                            warn!(error = %e, "skipping non-JSON SSE event");
                            continue;
                        }
                    };
                    trace!(upstream_id = ?event.id, "relaying upstream event");
                    let message = StreamEvent::Message {
                        data,
                        id: event.id,
                    };
                    // A consumer stalled past the backpressure window kills
                    // the stream rather than blocking the upstream reader.
                    if tokio::time::timeout(backpressure, tx.send(message))
                        .await
                        .is_err()
                    {
                        warn!("consumer stalled past backpressure window, closing stream");
                        let _ = tx.try_send(StreamEvent::Error(JsonRpcError::new(
                            ErrorCode::InternalError,
                            "stream closed: consumer too slow",
                        )));
                        break 'read;
                    }
                }
            }
            // Dropping tx is end-of-stream for the consumer.
        });

        EventStream {
            events: rx,
            upstream_session_id,
        }
    }
}

fn session_id_of(response: &reqwest::Response) -> Option<String> {
    response
        .headers()
        .get(SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string)
}

fn content_type_of(response: &reqwest::Response) -> String {
    response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase()
}

#[async_trait]
impl Transport for StreamableHttpTransport {
    async fn exchange(&self, frame: Frame, ctx: &ExchangeContext) -> TransportResult<Exchange> {
        let is_notification = matches!(frame, Frame::Notification(_));
        let body = frame.to_value();

        let req = self.apply_common(
            self.client
                .post(&self.config.url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .json(&body),
            ctx,
        );
        let response = self.send(req, ctx).await?;

        if is_notification {
            drop(response);
            return Ok(Exchange::None);
        }

        let status = response.status();
        let content_type = content_type_of(&response);

        if content_type.starts_with("text/event-stream") {
            // The upstream elected to stream the reply.
            return Ok(Exchange::Stream(
                self.spawn_producer(response, ctx.cancel.clone()),
            ));
        }

        let upstream_session_id = session_id_of(&response);
        let bytes = tokio::time::timeout(ctx.deadline, response.bytes())
            .await
            .map_err(|_| TransportError::Timeout)??;

        match serde_json::from_slice::<JsonRpcResponse>(&bytes) {
            Ok(parsed) => Ok(Exchange::Response {
                response: parsed,
                upstream_session_id,
            }),
            Err(e) if status.is_success() => Err(TransportError::Protocol {
                detail: format!("2xx body is not a JSON-RPC response: {e}"),
            }),
            Err(_) => Err(TransportError::HttpStatus {
                status: status.as_u16(),
            }),
        }
    }

    async fn open_stream(&self, ctx: &ExchangeContext) -> TransportResult<EventStream> {
        let mut req = self.apply_common(self.client.get(&self.config.url), ctx);
        if let Some(ref last) = ctx.last_event_id {
            req = req.header(LAST_EVENT_ID_HEADER, last);
        }
        let response = self.send(req, ctx).await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::HttpStatus {
                status: status.as_u16(),
            });
        }
        if !content_type_of(&response).starts_with("text/event-stream") {
            return Err(TransportError::Protocol {
                detail: "upstream GET did not return an event stream".to_string(),
            });
        }
        Ok(self.spawn_producer(response, ctx.cancel.clone()))
    }

    async fn shutdown(&self) {
        // Streams are owned by their cancellation tokens; the pool drains
        // on drop.
    }
}
