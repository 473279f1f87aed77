//! The message router.
//!
//! One router instance serves every adapter. It owns no session or
//! capability state of its own - just a registry of live transports keyed
//! by adapter id, built single-flight on first use. The routing pipeline
//! is fixed: inbound auth, then local-method interception, then transport
//! dispatch. Inbound credential headers never reach an upstream; whatever
//! auth the upstream sees is materialized from the adapter's descriptor
//! inside the transport.

use dashmap::DashMap;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use muxmcp_protocol::{
    Frame, JsonRpcRequest, JsonRpcResponse, METHOD_INITIALIZE, METHOD_INITIALIZED,
    PROTOCOL_VERSION,
};
use muxmcp_transport::{
    EventStream, Exchange, ExchangeContext, Transport, TransportError,
    http::RemoteHttpTransport, stdio::StdioSupervisor, streamable::StreamableHttpTransport,
};

use crate::adapter::{Adapter, AdapterStore, TransportKind};
use crate::auth::{self, InboundCredentials};
use crate::capabilities::{CapabilityCache, CapabilityRecord};
use crate::error::{GatewayError, GatewayResult};
use crate::protocol;
use crate::session::SessionStore;

/// What a routed frame produced.
#[derive(Debug)]
pub enum Routed {
    /// A single response to relay.
    Response(JsonRpcResponse),
    /// An event stream to relay.
    Stream(EventStream),
    /// Nothing (notification accepted, or a dropped notification error).
    None,
}

/// Per-call inputs the HTTP layer hands to the router.
pub struct RouteContext<'a> {
    /// Credential-bearing request parts.
    pub creds: InboundCredentials<'a>,
    /// Session id from `Mcp-Session-Id`, if the client sent one.
    pub session_id: Option<String>,
    /// Cancelled when the client connection goes away.
    pub cancel: CancellationToken,
}

/// Outcome of a route call.
pub struct RouteOutcome {
    /// The reply to relay.
    pub routed: Routed,
    /// Session the call ran under (created on initialize), for header echo.
    pub session_id: Option<String>,
}

type TransportCell = Arc<OnceCell<Arc<dyn Transport>>>;

/// The routing spine.
pub struct GatewayRouter {
    adapters: Arc<AdapterStore>,
    sessions: Arc<SessionStore>,
    capabilities: CapabilityCache,
    transports: DashMap<String, TransportCell>,
    /// Deadline for the gateway's own upstream capability handshakes.
    probe_timeout: Duration,
    shutdown: CancellationToken,
}

impl GatewayRouter {
    /// Build a router over shared stores.
    pub fn new(
        adapters: Arc<AdapterStore>,
        sessions: Arc<SessionStore>,
        capabilities: CapabilityCache,
        probe_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            adapters,
            sessions,
            capabilities,
            transports: DashMap::new(),
            probe_timeout,
            shutdown,
        }
    }

    /// The adapter store this router reads.
    pub fn adapters(&self) -> &Arc<AdapterStore> {
        &self.adapters
    }

    /// The session store this router writes.
    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// Route one validated frame for `adapter`.
    pub async fn route(
        &self,
        adapter: &Arc<Adapter>,
        frame: Frame,
        ctx: RouteContext<'_>,
    ) -> RouteOutcome {
        if let Err(failure) = auth::enforce(&adapter.inbound_auth, ctx.creds) {
            debug!(adapter = %adapter.id, reason = failure.reason(), "inbound auth rejected");
            let routed = match frame.id() {
                Some(id) => Routed::Response(JsonRpcResponse::error(
                    id.clone(),
                    GatewayError::Unauthorized {
                        reason: failure.reason(),
                    }
                    .to_rpc_error(),
                )),
                None => Routed::None,
            };
            return RouteOutcome {
                routed,
                session_id: None,
            };
        }

        match &frame {
            Frame::Request(request) if request.method == METHOD_INITIALIZE => {
                self.handle_initialize(adapter, request, ctx.session_id).await
            }
            Frame::Notification(notification) if notification.method == METHOD_INITIALIZED => {
                if let Some(ref session_id) = ctx.session_id {
                    self.sessions.mark_initialized(session_id);
                }
                RouteOutcome {
                    routed: Routed::None,
                    session_id: ctx.session_id,
                }
            }
            _ => self.dispatch(adapter, frame, ctx).await,
        }
    }

    /// Open a server-to-client stream (GET side) for `adapter`.
    pub async fn open_stream(
        &self,
        adapter: &Arc<Adapter>,
        session_id: Option<&str>,
        upstream_last_event_id: Option<String>,
        cancel: CancellationToken,
    ) -> GatewayResult<EventStream> {
        if !adapter.kind.supports_streaming() {
            return Err(TransportError::Unsupported {
                operation: "streaming",
            }
            .into());
        }
        let transport = self.transport_for(adapter).await?;
        let mut ctx = ExchangeContext::with_deadline(adapter.policy.request_timeout());
        ctx.cancel = cancel;
        ctx.last_event_id = upstream_last_event_id;
        ctx.upstream_session_id = session_id
            .and_then(|id| self.sessions.get(id))
            .and_then(|s| s.upstream_session_id);
        let stream = transport.open_stream(&ctx).await?;
        if let (Some(session_id), Some(upstream)) =
            (session_id, stream.upstream_session_id.as_deref())
        {
            self.sessions.set_upstream_session(session_id, upstream);
        }
        Ok(stream)
    }

    /// Probe-and-store: refresh the capability record for an adapter on
    /// operator demand.
    pub async fn sync_capabilities(
        &self,
        adapter: &Arc<Adapter>,
    ) -> GatewayResult<CapabilityRecord> {
        self.capabilities.invalidate(&adapter.id).await;
        let record = self.fetch_capabilities(adapter).await?;
        self.capabilities.put(&adapter.id, record.clone()).await;
        Ok(record)
    }

    /// Tear down an adapter: sessions, transport, cached capabilities.
    pub async fn remove_adapter(&self, adapter_id: &str) {
        if let Some(adapter) = self.adapters.remove(adapter_id) {
            info!(adapter = %adapter.id, "tearing adapter down");
        }
        let reaped = self.sessions.delete_by_adapter(adapter_id);
        if reaped > 0 {
            debug!(adapter = %adapter_id, reaped, "dropped adapter sessions");
        }
        if let Some((_, cell)) = self.transports.remove(adapter_id)
            && let Some(transport) = cell.get()
        {
            transport.shutdown().await;
        }
        self.capabilities.invalidate(adapter_id).await;
    }

    /// Shut every live transport down.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let cells: Vec<TransportCell> =
            self.transports.iter().map(|entry| entry.value().clone()).collect();
        for cell in cells {
            if let Some(transport) = cell.get() {
                transport.shutdown().await;
            }
        }
    }

    async fn handle_initialize(
        &self,
        adapter: &Arc<Adapter>,
        request: &JsonRpcRequest,
        session_id: Option<String>,
    ) -> RouteOutcome {
        let params = match protocol::parse_initialize_params(request) {
            Ok(params) => params,
            Err(error) => {
                return RouteOutcome {
                    routed: Routed::Response(JsonRpcResponse::error(request.id.clone(), error)),
                    session_id: None,
                };
            }
        };
        protocol::note_version_proposal(&params);

        let session = session_id
            .and_then(|id| self.sessions.get(&id))
            .unwrap_or_else(|| self.sessions.create(&adapter.id));

        // Fetch once per adapter, shared across racing initializes. A
        // fetch failure degrades to an empty record so initialize still
        // succeeds; nothing is cached and the next initialize retries.
        let record = match self
            .capabilities
            .get_or_fetch(&adapter.id, self.fetch_capabilities(adapter))
            .await
        {
            Ok(record) => record,
            Err(e) => {
                warn!(adapter = %adapter.id, error = %e, "capability fetch failed, answering empty");
                Arc::new(CapabilityRecord::empty())
            }
        };

        let result = protocol::initialize_result(adapter, &record);
        self.sessions.set_initialize_result(
            &session.id,
            &result.protocol_version,
            params.client_info,
            result.server_info.clone(),
            result.capabilities.clone(),
        );

        let response = JsonRpcResponse::success(
            request.id.clone(),
            serde_json::to_value(&result).expect("initialize result serializes"),
        );
        RouteOutcome {
            routed: Routed::Response(response),
            session_id: Some(session.id),
        }
    }

    async fn dispatch(
        &self,
        adapter: &Arc<Adapter>,
        frame: Frame,
        ctx: RouteContext<'_>,
    ) -> RouteOutcome {
        let client_id = frame.id().cloned();
        let session_id = ctx.session_id.clone();

        let result = self.dispatch_inner(adapter, frame, &ctx).await;
        if let Some(ref id) = session_id {
            self.sessions.update_activity(id);
        }

        let routed = match result {
            Ok(Exchange::Response {
                response,
                upstream_session_id,
            }) => {
                if let (Some(session_id), Some(upstream)) =
                    (session_id.as_deref(), upstream_session_id.as_deref())
                {
                    self.sessions.set_upstream_session(session_id, upstream);
                }
                Routed::Response(response)
            }
            Ok(Exchange::Stream(stream)) => {
                if let (Some(session_id), Some(upstream)) =
                    (session_id.as_deref(), stream.upstream_session_id.as_deref())
                {
                    self.sessions.set_upstream_session(session_id, upstream);
                }
                Routed::Stream(stream)
            }
            Ok(Exchange::None) => Routed::None,
            Err(e) => match client_id {
                Some(id) => {
                    warn!(adapter = %adapter.id, error = %e, "exchange failed");
                    Routed::Response(JsonRpcResponse::error(id, e.to_rpc_error()))
                }
                None => {
                    debug!(adapter = %adapter.id, error = %e, "dropping failed notification");
                    Routed::None
                }
            },
        };
        RouteOutcome {
            routed,
            session_id,
        }
    }

    async fn dispatch_inner(
        &self,
        adapter: &Arc<Adapter>,
        frame: Frame,
        ctx: &RouteContext<'_>,
    ) -> GatewayResult<Exchange> {
        let transport = self.transport_for(adapter).await?;
        let mut exchange_ctx = ExchangeContext::with_deadline(adapter.policy.request_timeout());
        exchange_ctx.cancel = ctx.cancel.clone();
        exchange_ctx.upstream_session_id = ctx
            .session_id
            .as_deref()
            .and_then(|id| self.sessions.get(id))
            .and_then(|s| s.upstream_session_id);
        Ok(transport.exchange(frame, &exchange_ctx).await?)
    }

    /// The transport for an adapter, constructed single-flight on first
    /// use and cached until teardown.
    async fn transport_for(&self, adapter: &Arc<Adapter>) -> GatewayResult<Arc<dyn Transport>> {
        let cell = self
            .transports
            .entry(adapter.id.clone())
            .or_default()
            .clone();
        let transport = cell
            .get_or_try_init(|| async { self.build_transport(adapter) })
            .await?;
        Ok(Arc::clone(transport))
    }

    fn build_transport(&self, adapter: &Arc<Adapter>) -> GatewayResult<Arc<dyn Transport>> {
        info!(adapter = %adapter.id, kind = ?adapter.kind, "building transport");
        let transport: Arc<dyn Transport> = match adapter.kind {
            TransportKind::Stdio => Arc::new(StdioSupervisor::new(adapter.stdio_config())),
            TransportKind::RemoteHttp => {
                let mut config = muxmcp_transport::HttpConfig::new(
                    adapter.url.clone().expect("validated http adapter"),
                );
                config.auth = adapter.upstream_auth.clone();
                config.request_timeout = adapter.policy.request_timeout();
                Arc::new(RemoteHttpTransport::new(config)?)
            }
            TransportKind::StreamableHttp | TransportKind::Sse => {
                Arc::new(StreamableHttpTransport::new(adapter.streamable_config())?)
            }
        };
        Ok(transport)
    }

    /// The gateway's own upstream initialize, used to learn capabilities.
    async fn fetch_capabilities(
        &self,
        adapter: &Arc<Adapter>,
    ) -> Result<CapabilityRecord, GatewayError> {
        let transport = self.transport_for(adapter).await?;
        let deadline = self.probe_timeout.min(adapter.policy.request_timeout());
        let mut ctx = ExchangeContext::with_deadline(deadline);
        ctx.cancel = self.shutdown.child_token();

        let request = Frame::Request(JsonRpcRequest::new(
            1i64,
            METHOD_INITIALIZE,
            Some(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": "muxmcp-gateway",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            })),
        ));

        let response = match transport.exchange(request, &ctx).await? {
            Exchange::Response { response, .. } => response,
            Exchange::Stream(mut stream) => {
                // An initialize POST may elect SSE; the first frame is the
                // response.
                loop {
                    match stream.events.recv().await {
                        Some(muxmcp_transport::StreamEvent::Message { data, .. }) => {
                            match serde_json::from_value::<JsonRpcResponse>(data) {
                                Ok(response) => break response,
                                Err(_) => continue,
                            }
                        }
                        Some(muxmcp_transport::StreamEvent::Error(error)) => {
                            return Err(GatewayError::configuration(format!(
                                "capability stream failed: {}",
                                error.message
                            )));
                        }
                        None => {
                            return Err(TransportError::Protocol {
                                detail: "capability stream ended before a response".to_string(),
                            }
                            .into());
                        }
                    }
                }
            }
            Exchange::None => {
                return Err(TransportError::Protocol {
                    detail: "initialize produced no response".to_string(),
                }
                .into());
            }
        };

        let result = response
            .result()
            .ok_or_else(|| {
                response
                    .error_object()
                    .map(|e| {
                        GatewayError::configuration(format!(
                            "upstream initialize answered {}",
                            e.code
                        ))
                    })
                    .unwrap_or_else(|| GatewayError::configuration("empty initialize reply"))
            })?
            .clone();

        // Complete the upstream handshake; failures here are not fatal.
        let initialized = Frame::Notification(muxmcp_protocol::JsonRpcNotification::new(
            METHOD_INITIALIZED,
            None,
        ));
        if let Err(e) = transport.exchange(initialized, &ctx).await {
            debug!(adapter = %adapter.id, error = %e, "initialized notification not delivered");
        }

        let mut record =
            CapabilityRecord::from_raw(result.get("capabilities").cloned().unwrap_or_default());
        record.server_info = result
            .get("serverInfo")
            .and_then(|v| serde_json::from_value(v.clone()).ok());
        record.protocol_version = result
            .get("protocolVersion")
            .and_then(serde_json::Value::as_str)
            .map(ToString::to_string);
        Ok(record)
    }
}
