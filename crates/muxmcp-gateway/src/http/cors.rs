//! CORS for browser-based MCP clients (e.g. inspector UIs).
//!
//! Localhost origins are echoed back so credentialed requests work during
//! development; everything else gets the wildcard.

use axum::extract::Request;
use axum::http::{HeaderValue, header};
use axum::middleware::Next;
use axum::response::Response;

const ALLOW_METHODS: &str = "GET, POST, OPTIONS";
const ALLOW_HEADERS: &str =
    "Origin, Content-Type, Accept, Authorization, MCP-Protocol-Version, Mcp-Session-Id";

/// Middleware stamping CORS headers onto every response.
pub async fn apply_cors(request: Request, next: Next) -> Response {
    let origin = request
        .headers()
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string);

    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    let allow_origin = match origin {
        Some(ref origin) if is_localhost(origin) => origin.as_str(),
        _ => "*",
    };
    if let Ok(value) = HeaderValue::from_str(allow_origin) {
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
    }
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(ALLOW_METHODS),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(ALLOW_HEADERS),
    );
    response
}

fn is_localhost(origin: &str) -> bool {
    url::Url::parse(origin)
        .ok()
        .and_then(|url| url.host_str().map(ToString::to_string))
        .is_some_and(|host| {
            host == "localhost" || host == "127.0.0.1" || host == "[::1]" || host == "::1"
        })
}
