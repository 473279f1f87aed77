//! End-to-end tests through the axum surface: in-process requests via
//! `tower::ServiceExt::oneshot`, real child processes for stdio adapters,
//! wiremock doubles for HTTP upstreams.

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use dashmap::DashMap;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower::util::ServiceExt;
use wiremock::matchers::{body_partial_json, header as wm_header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use muxmcp_gateway::capabilities::CapabilityCache;
use muxmcp_gateway::http::{AppState, build_router};
use muxmcp_gateway::{AdapterStore, GatewayRouter, SessionStore};
use muxmcp_discovery::{DiscoveryStore, JobManager, Scanner};

struct Harness {
    app: Router,
    state: Arc<AppState>,
}

fn harness(adapters_json: Value) -> Harness {
    let adapters = Arc::new(AdapterStore::new());
    adapters
        .load_manifest(&adapters_json.to_string())
        .expect("test manifest is valid");

    let shutdown = CancellationToken::new();
    let sessions = Arc::new(SessionStore::new());
    let router = Arc::new(GatewayRouter::new(
        Arc::clone(&adapters),
        sessions,
        CapabilityCache::default(),
        Duration::from_millis(300),
        shutdown.clone(),
    ));
    let discovered = Arc::new(DiscoveryStore::new());
    let jobs = Arc::new(JobManager::new(
        Arc::new(Scanner::new()),
        Arc::clone(&discovered),
        Vec::new(),
    ));
    let state = Arc::new(AppState {
        router,
        jobs,
        discovered,
        sse_states: DashMap::new(),
        shutdown,
    });
    Harness {
        app: build_router(Arc::clone(&state)),
        state,
    }
}

fn post(path: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("request builds")
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .expect("body collects");
    serde_json::from_slice(&bytes).expect("body is JSON")
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .expect("body collects");
    String::from_utf8(bytes.to_vec()).expect("body is UTF-8")
}

// ---------------------------------------------------------------------------
// S1: stdio initialize is answered locally

#[tokio::test]
async fn stdio_initialize_creates_a_listable_session() {
    let h = harness(json!([{"id": "fs", "kind": "Stdio", "command": "cat", "args": []}]));

    let request = post(
        "/adapters/fs/mcp",
        r#"{"jsonrpc":"2.0","id":7,"method":"initialize","params":{"protocolVersion":"2025-06-18","capabilities":{},"clientInfo":{"name":"t","version":"1"}}}"#,
    );
    let response = h.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let session_header = response
        .headers()
        .get("mcp-session-id")
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string);
    let body = body_json(response).await;

    assert_eq!(body["id"], 7);
    assert_eq!(body["result"]["protocolVersion"], "2025-06-18");
    assert_eq!(body["result"]["serverInfo"]["name"], "MCP Proxy for fs");
    assert_eq!(body["result"]["serverInfo"]["version"], "1.0.0");
    assert!(session_header.is_some(), "initialize echoes Mcp-Session-Id");

    let response = h
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/adapters/fs/sessions")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let sessions = body_json(response).await;
    let listed: Vec<&Value> = sessions.as_array().unwrap().iter().collect();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["adapterId"], "fs");
}

// ---------------------------------------------------------------------------
// S2: remote HTTP forwarding with credential replacement

#[tokio::test]
async fn remote_http_strips_client_credentials_and_applies_upstream_auth() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(wm_header("authorization", "Bearer SECRET"))
        .and(body_partial_json(json!({"method": "tools/list"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0", "id": 1, "result": {"tools": []}
        })))
        .expect(1)
        .mount(&upstream)
        .await;

    let h = harness(json!([{
        "id": "w", "kind": "RemoteHttp", "url": format!("{}/mcp", upstream.uri()),
        "upstreamAuth": {"bearer": {"token": "SECRET"}}
    }]));

    let request = Request::builder()
        .method("POST")
        .uri("/adapters/w/mcp")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::AUTHORIZATION, "Bearer CLIENTTOK")
        .body(Body::from(
            r#"{"jsonrpc":"2.0","id":1,"method":"tools/list","params":{}}"#,
        ))
        .unwrap();
    let response = h.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["result"]["tools"], json!([]));
}

// ---------------------------------------------------------------------------
// S3: stdio id rewriting round trip

#[tokio::test]
async fn stdio_ids_are_rewritten_upstream_and_restored_for_the_client() {
    // The child answers the first two upstream ids in order; the client's
    // string ids must come back untouched.
    let script = concat!(
        r#"read l; echo '{"jsonrpc":"2.0","id":1,"result":{"seq":1}}'; "#,
        r#"read l; echo '{"jsonrpc":"2.0","id":2,"result":{"seq":2}}'; "#,
        r#"cat > /dev/null"#,
    );
    let h = harness(json!([{
        "id": "fs", "kind": "Stdio", "command": "sh", "args": ["-c", script]
    }]));

    let first = h
        .app
        .clone()
        .oneshot(post(
            "/adapters/fs/mcp",
            r#"{"jsonrpc":"2.0","id":"a","method":"tools/list","params":{}}"#,
        ))
        .await
        .unwrap();
    let first = body_json(first).await;
    assert_eq!(first["id"], "a");
    assert_eq!(first["result"]["seq"], 1);

    let second = h
        .app
        .clone()
        .oneshot(post(
            "/adapters/fs/mcp",
            r#"{"jsonrpc":"2.0","id":"b","method":"tools/list","params":{}}"#,
        ))
        .await
        .unwrap();
    let second = body_json(second).await;
    assert_eq!(second["id"], "b");
    assert_eq!(second["result"]["seq"], 2);
}

// ---------------------------------------------------------------------------
// S5: auth rejection without upstream contact

#[tokio::test]
async fn missing_bearer_is_rejected_before_any_upstream_contact() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&upstream)
        .await;

    let h = harness(json!([{
        "id": "w", "kind": "RemoteHttp", "url": upstream.uri(),
        "inboundAuth": {"bearer": {"token": "EXPECTED"}}
    }]));

    let response = h
        .app
        .clone()
        .oneshot(post(
            "/adapters/w/mcp",
            r#"{"jsonrpc":"2.0","id":1,"method":"tools/list","params":{}}"#,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], -32001);
}

// ---------------------------------------------------------------------------
// Boundary behaviors

#[tokio::test]
async fn empty_body_answers_parse_error() {
    let h = harness(json!([{"id": "fs", "kind": "Stdio", "command": "cat"}]));
    let response = h.app.clone().oneshot(post("/adapters/fs/mcp", "")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], -32700);
    assert_eq!(body["id"], Value::Null);
}

#[tokio::test]
async fn json_without_jsonrpc_field_is_invalid_request() {
    let h = harness(json!([{"id": "fs", "kind": "Stdio", "command": "cat"}]));
    let response = h
        .app
        .clone()
        .oneshot(post("/adapters/fs/mcp", r#"{"id":1,"method":"x"}"#))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], -32600);
}

#[tokio::test]
async fn notification_answers_204_with_empty_body() {
    let h = harness(json!([{"id": "fs", "kind": "Stdio", "command": "cat"}]));
    let response = h
        .app
        .clone()
        .oneshot(post(
            "/adapters/fs/mcp",
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(body_text(response).await.is_empty());
}

#[tokio::test]
async fn get_without_event_stream_accept_is_rejected() {
    let h = harness(json!([{"id": "fs", "kind": "Stdio", "command": "cat"}]));
    let response = h
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/adapters/fs/mcp")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], -32600);
}

#[tokio::test]
async fn unsupported_protocol_version_header_is_rejected() {
    let h = harness(json!([{"id": "fs", "kind": "Stdio", "command": "cat"}]));
    let request = Request::builder()
        .method("POST")
        .uri("/adapters/fs/mcp")
        .header(header::CONTENT_TYPE, "application/json")
        .header("mcp-protocol-version", "1999-01-01")
        .body(Body::from(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#))
        .unwrap();
    let response = h.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], -32600);
}

#[tokio::test]
async fn unknown_adapter_is_not_found() {
    let h = harness(json!([]));
    let response = h
        .app
        .clone()
        .oneshot(post(
            "/adapters/ghost/mcp",
            r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], -32002);
}

#[tokio::test]
async fn cors_preflight_answers_204_with_the_header_set() {
    let h = harness(json!([{"id": "fs", "kind": "Stdio", "command": "cat"}]));
    let request = Request::builder()
        .method("OPTIONS")
        .uri("/adapters/fs/mcp")
        .header(header::ORIGIN, "http://localhost:3000")
        .body(Body::empty())
        .unwrap();
    let response = h.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(
        response
            .headers()
            .get("access-control-allow-origin")
            .unwrap(),
        "http://localhost:3000"
    );
    assert_eq!(
        response
            .headers()
            .get("access-control-allow-methods")
            .unwrap(),
        "GET, POST, OPTIONS"
    );
}

// ---------------------------------------------------------------------------
// SSE wrapping and resumption (S4)

fn streamable_manifest(upstream_uri: &str) -> Value {
    json!([{
        "id": "s", "kind": "StreamableHttp", "url": format!("{upstream_uri}/mcp")
    }])
}

#[tokio::test]
async fn client_stream_events_are_wrapped_and_numbered_from_one() {
    let upstream = MockServer::start().await;
    let sse_body = concat!(
        "id: u1\ndata: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\",\"params\":{\"n\":1}}\n\n",
        "id: u2\ndata: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\",\"params\":{\"n\":2}}\n\n",
    );
    Mock::given(method("GET"))
        .and(path("/mcp"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_raw(sse_body, "text/event-stream"),
        )
        .mount(&upstream)
        .await;

    let h = harness(streamable_manifest(&upstream.uri()));
    let request = Request::builder()
        .uri("/adapters/s/mcp")
        .header(header::ACCEPT, "text/event-stream")
        .body(Body::empty())
        .unwrap();
    let response = h.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("mcp-session-id").is_some());

    let text = body_text(response).await;
    assert!(text.contains("id: 1\n"), "first event carries id 1: {text}");
    assert!(text.contains("id: 2\n"), "second event carries id 2: {text}");
    // Wrapped form: {"id":"<n>","data":<original>}
    assert!(text.contains(r#""id":"1""#));
    assert!(text.contains(r#""n":1"#));
}

#[tokio::test]
async fn reconnect_with_last_event_id_resumes_without_duplicates() {
    let upstream = MockServer::start().await;
    // Fresh opens serve u1 and u2; resumed opens (Last-Event-ID: u2)
    // serve only u3.
    Mock::given(method("GET"))
        .and(path("/mcp"))
        .and(wm_header("last-event-id", "u2"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_raw(
                    "id: u3\ndata: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\",\"params\":{\"n\":3}}\n\n",
                    "text/event-stream",
                ),
        )
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .and(path("/mcp"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_raw(
                    concat!(
                        "id: u1\ndata: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\",\"params\":{\"n\":1}}\n\n",
                        "id: u2\ndata: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\",\"params\":{\"n\":2}}\n\n",
                    ),
                    "text/event-stream",
                ),
        )
        .mount(&upstream)
        .await;

    let h = harness(streamable_manifest(&upstream.uri()));

    let first = h
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/adapters/s/mcp")
                .header(header::ACCEPT, "text/event-stream")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let session_id = first
        .headers()
        .get("mcp-session-id")
        .and_then(|v| v.to_str().ok())
        .unwrap()
        .to_string();
    let text = body_text(first).await;
    assert!(text.contains("id: 2\n"));

    let second = h
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/adapters/s/mcp")
                .header(header::ACCEPT, "text/event-stream")
                .header("mcp-session-id", &session_id)
                .header("last-event-id", "2")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let text = body_text(second).await;
    assert!(
        text.contains("id: 3\n"),
        "resumed stream continues past the cursor: {text}"
    );
    assert!(!text.contains("id: 1\n"), "no duplicate of event 1: {text}");
    assert!(!text.contains("id: 2\n"), "no duplicate of event 2: {text}");
}

// ---------------------------------------------------------------------------
// S6: scanning finds an MCP server on localhost

#[tokio::test]
async fn scan_discovers_a_local_mcp_server() {
    let target = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0", "id": 1,
            "result": {
                "protocolVersion": "2025-06-18",
                "capabilities": {},
                "serverInfo": {"name": "target", "version": "1"}
            }
        })))
        .mount(&target)
        .await;

    let h = harness(json!([]));
    let addr = target.address();
    let scan = json!({
        "scanRanges": [addr.ip().to_string()],
        "ports": [addr.port()],
        "timeout": "2s"
    });

    let response = h
        .app
        .clone()
        .oneshot(post("/discovery/scan", &scan.to_string()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let submitted = body_json(response).await;
    let job_id = submitted["jobId"].as_str().unwrap().to_string();

    // Poll until terminal.
    let mut job = Value::Null;
    for _ in 0..100 {
        let response = h
            .app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/discovery/scan/{job_id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        job = body_json(response).await;
        if job["status"] == "completed" || job["status"] == "failed" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(job["status"], "completed");
    assert_eq!(job["results"][0]["auth"], "none");
    assert_eq!(job["results"][0]["vulnerability"], "high");

    let response = h
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/discovery/servers")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let servers = body_json(response).await;
    assert_eq!(servers.as_array().unwrap().len(), 1);
    assert_eq!(servers[0]["serverInfo"]["name"], "target");
}

#[tokio::test]
async fn oversized_cidr_in_scan_config_is_a_400() {
    let h = harness(json!([]));
    let response = h
        .app
        .clone()
        .oneshot(post(
            "/discovery/scan",
            r#"{"scanRanges":["10.0.0.0/8"],"ports":[80]}"#,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"], "invalid_config");
}

// ---------------------------------------------------------------------------
// Session deletion

#[tokio::test]
async fn delete_removes_the_session() {
    let h = harness(json!([{"id": "fs", "kind": "Stdio", "command": "cat"}]));

    let response = h
        .app
        .clone()
        .oneshot(post(
            "/adapters/fs/mcp",
            r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":"2025-06-18","capabilities":{},"clientInfo":{"name":"t","version":"1"}}}"#,
        ))
        .await
        .unwrap();
    let session_id = response
        .headers()
        .get("mcp-session-id")
        .and_then(|v| v.to_str().ok())
        .unwrap()
        .to_string();

    let response = h
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/adapters/fs/mcp")
                .header("mcp-session-id", &session_id)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(h.state.router.sessions().get(&session_id).is_none());
}
