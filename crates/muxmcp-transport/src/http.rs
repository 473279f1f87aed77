//! Remote HTTP transport: one POST per JSON-RPC exchange.
//!
//! Stateless. The inbound frame is forwarded verbatim (after the router
//! has applied the adapter's upstream credentials), the response body is
//! parsed as a single JSON-RPC frame, and upstream error frames pass
//! through with their original codes.

use async_trait::async_trait;
use tracing::{debug, trace};

use muxmcp_protocol::{Frame, JsonRpcResponse};

use crate::config::HttpConfig;
use crate::core::{Exchange, ExchangeContext, Transport};
use crate::error::{TransportError, TransportResult};

/// Transport for a plain JSON-over-HTTP upstream.
#[derive(Debug)]
pub struct RemoteHttpTransport {
    client: reqwest::Client,
    config: HttpConfig,
}

impl RemoteHttpTransport {
    /// Build the transport and its pooled HTTP client.
    pub fn new(config: HttpConfig) -> TransportResult<Self> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| TransportError::Unavailable {
                detail: format!("failed to build HTTP client: {e}"),
            })?;
        debug!(url = %config.url, "created remote HTTP transport");
        Ok(Self { client, config })
    }

    fn post(&self, body: &serde_json::Value, deadline: std::time::Duration) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .post(&self.config.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .timeout(deadline.min(self.config.request_timeout))
            .json(body);
        if let Some(ref auth) = self.config.auth {
            req = auth.apply(req);
        }
        req
    }
}

#[async_trait]
impl Transport for RemoteHttpTransport {
    async fn exchange(&self, frame: Frame, ctx: &ExchangeContext) -> TransportResult<Exchange> {
        let is_notification = matches!(frame, Frame::Notification(_));
        let body = frame.to_value();
        trace!(url = %self.config.url, "forwarding frame upstream");

        let response = tokio::select! {
            result = self.post(&body, ctx.deadline).send() => result?,
            () = ctx.cancel.cancelled() => return Err(TransportError::Closed),
        };

        if is_notification {
            // Fire-and-forget: status and body are intentionally ignored.
            drop(response);
            return Ok(Exchange::None);
        }

        let status = response.status();
        let bytes = response.bytes().await?;

        if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(TransportError::Unauthorized {
                status: status.as_u16(),
            });
        }

        // Upstream JSON-RPC errors come back with their original code even
        // when the HTTP status is non-2xx; only non-JSON bodies collapse
        // to an internal error carrying the status.
        match serde_json::from_slice::<JsonRpcResponse>(&bytes) {
            Ok(parsed) => Ok(Exchange::Response {
                response: parsed,
                upstream_session_id: None,
            }),
            Err(e) if status.is_success() => Err(TransportError::Protocol {
                detail: format!("2xx body is not a JSON-RPC response: {e}"),
            }),
            Err(_) => Err(TransportError::HttpStatus {
                status: status.as_u16(),
            }),
        }
    }

    async fn shutdown(&self) {
        // Connection pool drains on drop.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use muxmcp_protocol::{JsonRpcNotification, JsonRpcRequest, RequestId};
    use secrecy::SecretString;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::config::UpstreamAuth;

    fn ctx() -> ExchangeContext {
        ExchangeContext::with_deadline(Duration::from_secs(5))
    }

    fn request_frame() -> Frame {
        Frame::Request(JsonRpcRequest::new(1i64, "tools/list", Some(json!({}))))
    }

    #[tokio::test]
    async fn forwards_request_and_returns_response_verbatim() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .and(body_partial_json(json!({"method": "tools/list"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0", "id": 1, "result": {"tools": []}
            })))
            .mount(&server)
            .await;

        let transport =
            RemoteHttpTransport::new(HttpConfig::new(format!("{}/mcp", server.uri()))).unwrap();
        let outcome = transport.exchange(request_frame(), &ctx()).await.unwrap();
        match outcome {
            Exchange::Response { response, .. } => {
                assert_eq!(response.id, Some(RequestId::Number(1)));
                assert!(response.is_success());
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn applies_configured_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("authorization", "Bearer SECRET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0", "id": 1, "result": {}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mut config = HttpConfig::new(server.uri());
        config.auth = Some(UpstreamAuth::Bearer {
            token: SecretString::from("SECRET"),
        });
        let transport = RemoteHttpTransport::new(config).unwrap();
        transport.exchange(request_frame(), &ctx()).await.unwrap();
    }

    #[tokio::test]
    async fn upstream_401_surfaces_as_unauthorized() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let transport = RemoteHttpTransport::new(HttpConfig::new(server.uri())).unwrap();
        let err = transport.exchange(request_frame(), &ctx()).await.unwrap_err();
        assert!(matches!(err, TransportError::Unauthorized { status: 401 }));
        assert_eq!(err.to_rpc_error().code, -32001);
    }

    #[tokio::test]
    async fn non_json_5xx_carries_http_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;

        let transport = RemoteHttpTransport::new(HttpConfig::new(server.uri())).unwrap();
        let err = transport.exchange(request_frame(), &ctx()).await.unwrap_err();
        let rpc = err.to_rpc_error();
        assert_eq!(rpc.code, -32603);
        assert_eq!(rpc.data.unwrap()["httpStatus"], 502);
    }

    #[tokio::test]
    async fn json_error_body_passes_through_with_original_code() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({
                "jsonrpc": "2.0", "id": 1,
                "error": {"code": -32099, "message": "upstream says no"}
            })))
            .mount(&server)
            .await;

        let transport = RemoteHttpTransport::new(HttpConfig::new(server.uri())).unwrap();
        let outcome = transport.exchange(request_frame(), &ctx()).await.unwrap();
        match outcome {
            Exchange::Response { response, .. } => {
                assert_eq!(response.error_object().unwrap().code, -32099);
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn notifications_are_fire_and_forget() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("ignored"))
            .expect(1)
            .mount(&server)
            .await;

        let transport = RemoteHttpTransport::new(HttpConfig::new(server.uri())).unwrap();
        let outcome = transport
            .exchange(
                Frame::Notification(JsonRpcNotification::new("notifications/initialized", None)),
                &ctx(),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, Exchange::None));
    }

    #[tokio::test]
    async fn connection_refused_is_unavailable() {
        // Port 9 on localhost is essentially never listening.
        let transport =
            RemoteHttpTransport::new(HttpConfig::new("http://127.0.0.1:9/mcp")).unwrap();
        let err = transport.exchange(request_frame(), &ctx()).await.unwrap_err();
        let rpc = err.to_rpc_error();
        assert_eq!(rpc.code, -32603);
        assert_eq!(rpc.data.unwrap()["cause"], "upstream-unavailable");
    }
}
