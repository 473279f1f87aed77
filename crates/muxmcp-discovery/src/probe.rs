//! One-shot MCP characterization probe.
//!
//! Where the scanner only wants to know *whether* something speaks MCP,
//! this client builds the richer picture an operator asks for: it runs
//! `initialize` and then walks `tools/list`, `resources/list`, and
//! `prompts/list`, tolerating SSE replies by reading their first `data:`
//! frame. The report it returns is shaped for the gateway's capability
//! cache.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::debug;

use muxmcp_protocol::PROTOCOL_VERSION;
use muxmcp_transport::UpstreamAuth;
use muxmcp_transport::sse::SseDecoder;

use crate::error::{DiscoveryError, DiscoveryResult};

/// Everything a characterization probe learned about an upstream.
#[derive(Debug, Clone)]
pub struct ProbeReport {
    /// `serverInfo` from the initialize result.
    pub server_info: Option<Value>,
    /// Protocol version the server answered with.
    pub protocol_version: Option<String>,
    /// Raw capability object from the initialize result.
    pub capabilities: Value,
    /// `tools/list` result, if the server supports tools.
    pub tools: Option<Value>,
    /// `resources/list` result, if supported.
    pub resources: Option<Value>,
    /// `prompts/list` result, if supported.
    pub prompts: Option<Value>,
    /// When the probe ran.
    pub fetched_at: DateTime<Utc>,
}

/// Client issuing characterization probes.
#[derive(Debug)]
pub struct ProbeClient {
    client: reqwest::Client,
    timeout: Duration,
}

impl ProbeClient {
    /// Build a probe client with the given per-request timeout.
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .pool_max_idle_per_host(2)
                .build()
                .expect("reqwest client construction cannot fail with default TLS"),
            timeout,
        }
    }

    /// Characterize the MCP server at `url`.
    pub async fn characterize(
        &self,
        url: &str,
        auth: Option<&UpstreamAuth>,
    ) -> DiscoveryResult<ProbeReport> {
        let init = self
            .call(url, auth, 1, "initialize", json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {"name": "muxmcp-probe", "version": env!("CARGO_PKG_VERSION")}
            }))
            .await?;

        let capabilities = init.get("capabilities").cloned().unwrap_or(Value::Null);
        let server_info = init.get("serverInfo").cloned();
        let protocol_version = init
            .get("protocolVersion")
            .and_then(Value::as_str)
            .map(ToString::to_string);

        // List calls are best-effort: a server without prompts answering
        // -32601 should not sink the whole report.
        let tools = self.try_call(url, auth, 2, "tools/list").await;
        let resources = self.try_call(url, auth, 3, "resources/list").await;
        let prompts = self.try_call(url, auth, 4, "prompts/list").await;

        Ok(ProbeReport {
            server_info,
            protocol_version,
            capabilities,
            tools,
            resources,
            prompts,
            fetched_at: Utc::now(),
        })
    }

    async fn try_call(
        &self,
        url: &str,
        auth: Option<&UpstreamAuth>,
        id: i64,
        method: &str,
    ) -> Option<Value> {
        match self.call(url, auth, id, method, json!({})).await {
            Ok(result) => Some(result),
            Err(e) => {
                debug!(%method, error = %e, "probe list call skipped");
                None
            }
        }
    }

    /// One JSON-RPC call; SSE replies yield their first data frame.
    async fn call(
        &self,
        url: &str,
        auth: Option<&UpstreamAuth>,
        id: i64,
        method: &str,
        params: Value,
    ) -> DiscoveryResult<Value> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let mut req = self
            .client
            .post(url)
            .timeout(self.timeout)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(
                reqwest::header::ACCEPT,
                "application/json, text/event-stream",
            )
            .json(&body);
        if let Some(auth) = auth {
            req = auth.apply(req);
        }

        let response = req.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DiscoveryError::probe(format!(
                "{method} returned HTTP {status}"
            )));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();

        let frame: Value = if content_type.starts_with("text/event-stream") {
            self.first_frame(response)
                .await
                .ok_or_else(|| DiscoveryError::probe(format!("{method} stream ended early")))?
        } else {
            response.json().await?
        };

        if let Some(error) = frame.get("error") {
            return Err(DiscoveryError::probe(format!(
                "{method} answered error {}",
                error.get("code").and_then(Value::as_i64).unwrap_or(0)
            )));
        }
        frame
            .get("result")
            .cloned()
            .ok_or_else(|| DiscoveryError::probe(format!("{method} reply has no result")))
    }

    async fn first_frame(&self, response: reqwest::Response) -> Option<Value> {
        let mut body = response.bytes_stream();
        let mut decoder = SseDecoder::new();
        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                chunk = body.next() => match chunk {
                    Some(Ok(bytes)) => {
                        if let Some(event) = decoder.feed(&bytes).into_iter().next() {
                            return serde_json::from_str(&event.data).ok();
                        }
                    }
                    _ => return None,
                },
                () = &mut deadline => return None,
            }
        }
    }
}
