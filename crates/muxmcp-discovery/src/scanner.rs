//! Network scanner: probes `(ip, port)` targets for MCP servers.
//!
//! Each target gets an unauthenticated `initialize` POST at `/mcp` and
//! then `/`. What comes back decides the classification: a JSON-RPC
//! initialize result means an open server (vulnerability high), a 401/403
//! with a JSON-RPC error body means an authenticated one, sub-classified
//! from its `WWW-Authenticate` challenge. Everything else is not MCP.
//!
//! Targets are processed in batches of the configured concurrency; the
//! job manager's cancellation token is checked between batches, so no new
//! probe starts after cancellation while in-flight probes finish or time
//! out on their own.

use chrono::Utc;
use dashmap::DashMap;
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use muxmcp_protocol::PROTOCOL_VERSION;
use muxmcp_transport::sse::SseDecoder;

use crate::store::{
    AuthClassification, DiscoveredServer, DiscoveredTransport, Vulnerability, server_id,
};

/// Endpoints tried on each target, in order.
const PROBE_ENDPOINTS: &[&str] = &["/mcp", "/"];

/// How long a target stays in the recently-scanned suppression set.
const SUPPRESS_TTL: Duration = Duration::from_secs(300);

/// What one completed scan produced.
#[derive(Debug, Default)]
pub struct ScanOutcome {
    /// Servers found.
    pub results: Vec<DiscoveredServer>,
    /// Per-probe errors worth reporting (the scan itself still completes).
    pub errors: Vec<String>,
}

/// The probing engine. One instance is shared by every scan job; the
/// suppression set inside it is what makes incremental scans cheap.
#[derive(Debug)]
pub struct Scanner {
    client: reqwest::Client,
    recently_scanned: DashMap<SocketAddr, Instant>,
}

impl Default for Scanner {
    fn default() -> Self {
        Self::new()
    }
}

impl Scanner {
    /// Build a scanner with its own connection pool.
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .pool_max_idle_per_host(2)
                .build()
                .expect("reqwest client construction cannot fail with default TLS"),
            recently_scanned: DashMap::new(),
        }
    }

    /// Probe `targets`, reporting progress in `[0, 1]` after each batch.
    pub async fn run(
        &self,
        targets: &[SocketAddr],
        timeout: Duration,
        concurrency: usize,
        cancel: &CancellationToken,
        mut on_progress: impl FnMut(f64) + Send,
    ) -> ScanOutcome {
        self.evict_suppressed();
        let total = targets.len();
        let mut outcome = ScanOutcome::default();
        let mut done = 0usize;

        info!(total, concurrency, "starting scan");
        for batch in targets.chunks(concurrency.max(1)) {
            if cancel.is_cancelled() {
                info!(done, total, "scan cancelled");
                break;
            }

            let probes = batch.iter().filter_map(|&target| {
                if self.suppressed(target) {
                    trace!(%target, "suppressed, scanned recently");
                    return None;
                }
                Some(async move { (target, self.probe_target(target, timeout).await) })
            });

            for (target, result) in futures::future::join_all(probes).await {
                self.recently_scanned.insert(target, Instant::now());
                match result {
                    Ok(Some(server)) => outcome.results.push(server),
                    Ok(None) => {}
                    Err(message) => outcome.errors.push(format!("{target}: {message}")),
                }
            }

            done += batch.len();
            on_progress(done as f64 / total.max(1) as f64);
        }
        info!(
            found = outcome.results.len(),
            errors = outcome.errors.len(),
            "scan finished"
        );
        outcome
    }

    fn suppressed(&self, target: SocketAddr) -> bool {
        self.recently_scanned
            .get(&target)
            .is_some_and(|seen| seen.elapsed() < SUPPRESS_TTL)
    }

    fn evict_suppressed(&self) {
        self.recently_scanned
            .retain(|_, seen| seen.elapsed() < SUPPRESS_TTL);
    }

    /// Probe one target; `Ok(None)` means "not an MCP server".
    async fn probe_target(
        &self,
        target: SocketAddr,
        timeout: Duration,
    ) -> Result<Option<DiscoveredServer>, String> {
        for endpoint in PROBE_ENDPOINTS {
            let url = format!("http://{target}{endpoint}");
            match self.probe_endpoint(&url, target, endpoint, timeout).await {
                Ok(Some(server)) => return Ok(Some(server)),
                Ok(None) => {}
                Err(e) => {
                    // Unreachable targets are the normal case for a scan.
                    debug!(%target, error = %e, "probe failed");
                    return Ok(None);
                }
            }
        }
        Ok(None)
    }

    async fn probe_endpoint(
        &self,
        url: &str,
        target: SocketAddr,
        endpoint: &str,
        timeout: Duration,
    ) -> Result<Option<DiscoveredServer>, reqwest::Error> {
        let response = self
            .client
            .post(url)
            .timeout(timeout)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(
                reqwest::header::ACCEPT,
                "application/json, text/event-stream",
            )
            .json(&probe_body())
            .send()
            .await?;

        let status = response.status();
        let address = target.to_string();

        if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
        {
            let challenge = response
                .headers()
                .get(reqwest::header::WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            let body: Value = match response.json().await {
                Ok(body) => body,
                Err(_) => return Ok(None),
            };
            if !is_jsonrpc_error(&body) {
                return Ok(None);
            }
            let (auth, vulnerability) = classify_challenge(&challenge);
            return Ok(Some(discovered(
                &address,
                endpoint,
                url,
                DiscoveredTransport::Http,
                None,
                auth,
                vulnerability,
            )));
        }

        if !status.is_success() {
            return Ok(None);
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();

        if content_type.starts_with("text/event-stream") {
            let Some(frame) = first_sse_frame(response, timeout).await else {
                return Ok(None);
            };
            if let Some(info) = initialize_server_info(&frame) {
                return Ok(Some(discovered(
                    &address,
                    endpoint,
                    url,
                    DiscoveredTransport::Sse,
                    Some(info),
                    AuthClassification::None,
                    Vulnerability::High,
                )));
            }
            return Ok(None);
        }

        let body: Value = match response.json().await {
            Ok(body) => body,
            Err(_) => return Ok(None),
        };
        if let Some(info) = initialize_server_info(&body) {
            return Ok(Some(discovered(
                &address,
                endpoint,
                url,
                DiscoveredTransport::Http,
                Some(info),
                AuthClassification::None,
                Vulnerability::High,
            )));
        }
        Ok(None)
    }
}

/// The fixed initialize frame every probe sends.
fn probe_body() -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "initialize",
        "params": {
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {"name": "mcp-scanner", "version": "1.0"}
        }
    })
}

/// `serverInfo` out of an initialize result, if `body` is one.
fn initialize_server_info(body: &Value) -> Option<Value> {
    if body.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
        return None;
    }
    body.get("result")?.get("serverInfo").cloned()
}

fn is_jsonrpc_error(body: &Value) -> bool {
    body.get("jsonrpc").and_then(Value::as_str) == Some("2.0") && body.get("error").is_some()
}

/// Sub-classify an auth-required server from its challenge header.
fn classify_challenge(challenge: &str) -> (AuthClassification, Vulnerability) {
    if challenge.contains("resource_metadata") {
        (AuthClassification::RequiredOauth, Vulnerability::Low)
    } else if challenge.contains("Bearer") {
        (AuthClassification::RequiredBearer, Vulnerability::Medium)
    } else {
        (AuthClassification::RequiredOther, Vulnerability::Medium)
    }
}

/// Read the first SSE `data:` frame off a streaming probe reply.
async fn first_sse_frame(response: reqwest::Response, timeout: Duration) -> Option<Value> {
    use futures::StreamExt;
    let mut body = response.bytes_stream();
    let mut decoder = SseDecoder::new();
    let deadline = tokio::time::sleep(timeout);
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

fn discovered(
    address: &str,
    endpoint: &str,
    url: &str,
    transport: DiscoveredTransport,
    server_info: Option<Value>,
    auth: AuthClassification,
    vulnerability: Vulnerability,
) -> DiscoveredServer {
    let now = Utc::now();
    DiscoveredServer {
        id: server_id(address, endpoint),
        url: url.to_string(),
        transport,
        server_info,
        auth,
        vulnerability,
        first_seen: now,
        last_seen: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn addr_of(server: &MockServer) -> SocketAddr {
        *server.address()
    }

    #[tokio::test]
    async fn open_mcp_server_classifies_high() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .and(body_partial_json(json!({"method": "initialize"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0", "id": 1,
                "result": {
                    "protocolVersion": "2025-06-18",
                    "capabilities": {},
                    "serverInfo": {"name": "open-server", "version": "1.0"}
                }
            })))
            .mount(&server)
            .await;

        let scanner = Scanner::new();
        let outcome = scanner
            .run(
                &[addr_of(&server)],
                Duration::from_secs(2),
                4,
                &CancellationToken::new(),
                |_| {},
            )
            .await;

        assert_eq!(outcome.results.len(), 1);
        let found = &outcome.results[0];
        assert_eq!(found.auth, AuthClassification::None);
        assert_eq!(found.vulnerability, Vulnerability::High);
        assert_eq!(found.server_info.as_ref().unwrap()["name"], "open-server");
    }

    #[tokio::test]
    async fn sse_reply_is_detected_from_first_frame() {
        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":",
            "{\"serverInfo\":{\"name\":\"sse-server\",\"version\":\"2\"}}}\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_raw(body, "text/event-stream"),
            )
            .mount(&server)
            .await;

        let scanner = Scanner::new();
        let outcome = scanner
            .run(
                &[addr_of(&server)],
                Duration::from_secs(2),
                4,
                &CancellationToken::new(),
                |_| {},
            )
            .await;

        assert_eq!(outcome.results.len(), 1);
        assert_eq!(outcome.results[0].transport, DiscoveredTransport::Sse);
        assert_eq!(outcome.results[0].vulnerability, Vulnerability::High);
    }

    #[tokio::test]
    async fn bearer_challenge_classifies_medium() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(401)
                    .insert_header("www-authenticate", "Bearer realm=\"mcp\"")
                    .set_body_json(json!({
                        "jsonrpc": "2.0", "id": 1,
                        "error": {"code": -32001, "message": "Unauthorized"}
                    })),
            )
            .mount(&server)
            .await;

        let scanner = Scanner::new();
        let outcome = scanner
            .run(
                &[addr_of(&server)],
                Duration::from_secs(2),
                4,
                &CancellationToken::new(),
                |_| {},
            )
            .await;

        assert_eq!(outcome.results.len(), 1);
        assert_eq!(outcome.results[0].auth, AuthClassification::RequiredBearer);
        assert_eq!(outcome.results[0].vulnerability, Vulnerability::Medium);
    }

    #[tokio::test]
    async fn oauth_challenge_classifies_low() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(401)
                    .insert_header(
                        "www-authenticate",
                        "Bearer resource_metadata=\"https://x/.well-known/oauth\"",
                    )
                    .set_body_json(json!({
                        "jsonrpc": "2.0", "id": 1,
                        "error": {"code": -32001, "message": "Unauthorized"}
                    })),
            )
            .mount(&server)
            .await;

        let scanner = Scanner::new();
        let outcome = scanner
            .run(
                &[addr_of(&server)],
                Duration::from_secs(2),
                4,
                &CancellationToken::new(),
                |_| {},
            )
            .await;

        assert_eq!(outcome.results[0].auth, AuthClassification::RequiredOauth);
        assert_eq!(outcome.results[0].vulnerability, Vulnerability::Low);
    }

    #[tokio::test]
    async fn non_mcp_replies_are_ignored() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>hi</html>"))
            .mount(&server)
            .await;

        let scanner = Scanner::new();
        let outcome = scanner
            .run(
                &[addr_of(&server)],
                Duration::from_secs(2),
                4,
                &CancellationToken::new(),
                |_| {},
            )
            .await;
        assert!(outcome.results.is_empty());
    }

    #[tokio::test]
    async fn cancellation_stops_new_batches() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let scanner = Scanner::new();
        let mut progressed = false;
        let outcome = scanner
            .run(
                &["127.0.0.1:1".parse().unwrap(), "127.0.0.1:2".parse().unwrap()],
                Duration::from_millis(100),
                1,
                &cancel,
                |_| progressed = true,
            )
            .await;
        assert!(outcome.results.is_empty());
        assert!(!progressed, "no batch may start after cancellation");
    }

    #[tokio::test]
    async fn repeat_scan_is_suppressed_within_ttl() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0", "id": 1,
                "result": {"serverInfo": {"name": "s", "version": "1"}}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let scanner = Scanner::new();
        let targets = [addr_of(&server)];
        let cancel = CancellationToken::new();
        let first = scanner
            .run(&targets, Duration::from_secs(2), 4, &cancel, |_| {})
            .await;
        assert_eq!(first.results.len(), 1);

        // Second run inside the TTL: the mock's expect(1) enforces that no
        // second request went out.
        let second = scanner
            .run(&targets, Duration::from_secs(2), 4, &cancel, |_| {})
            .await;
        assert!(second.results.is_empty());
    }

    #[test]
    fn probe_body_matches_the_wire_contract() {
        let body = probe_body();
        assert_eq!(body["method"], "initialize");
        assert_eq!(body["params"]["clientInfo"]["name"], "mcp-scanner");
        assert_eq!(body["params"]["clientInfo"]["version"], "1.0");
    }
}
