//! Transport configuration and upstream credential descriptors.

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Where an API key is placed on the upstream request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiKeyLocation {
    /// A named request header.
    Header,
    /// A query-string parameter.
    Query,
    /// A cookie.
    Cookie,
}

/// Credentials the gateway presents to an upstream.
///
/// Inbound client credentials are always stripped; whatever reaches the
/// upstream is a pure function of this descriptor.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamAuth {
    /// `Authorization: Bearer <token>`.
    Bearer {
        /// The token.
        token: SecretString,
    },
    /// HTTP basic credentials.
    Basic {
        /// User name.
        username: String,
        /// Password.
        password: SecretString,
    },
    /// API key at a configured location under a configured name.
    ApiKey {
        /// Placement.
        location: ApiKeyLocation,
        /// Header / parameter / cookie name.
        name: String,
        /// The key value.
        value: SecretString,
    },
}

impl std::fmt::Debug for UpstreamAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bearer { .. } => f.debug_struct("Bearer").field("token", &"<redacted>").finish(),
            Self::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Self::ApiKey { location, name, .. } => f
                .debug_struct("ApiKey")
                .field("location", location)
                .field("name", name)
                .field("value", &"<redacted>")
                .finish(),
        }
    }
}

impl UpstreamAuth {
    /// Materialize the descriptor onto an outbound request.
    pub fn apply(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self {
            Self::Bearer { token } => req.header(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {}", token.expose_secret()),
            ),
            Self::Basic { username, password } => {
                req.basic_auth(username, Some(password.expose_secret()))
            }
            Self::ApiKey {
                location,
                name,
                value,
            } => match location {
                ApiKeyLocation::Header => req.header(name.as_str(), value.expose_secret()),
                ApiKeyLocation::Query => req.query(&[(name.as_str(), value.expose_secret())]),
                ApiKeyLocation::Cookie => req.header(
                    reqwest::header::COOKIE,
                    format!("{}={}", name, value.expose_secret()),
                ),
            },
        }
    }
}

/// Configuration for a stdio (child process) upstream.
#[derive(Debug, Clone)]
pub struct StdioConfig {
    /// Command to execute.
    pub command: String,
    /// Command arguments.
    pub args: Vec<String>,
    /// Extra environment for the child.
    pub env: HashMap<String, String>,
    /// Working directory.
    pub working_dir: Option<String>,
    /// Maximum accepted stdout line length; longer frames are dropped.
    pub max_line_length: usize,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Tear the child down after this much idle time.
    pub idle_close: Option<Duration>,
    /// Respawn the child when it exits.
    pub restart: bool,
    /// Memory hint exported to the child, in megabytes.
    pub memory_limit_mb: u64,
}

impl Default for StdioConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            max_line_length: 1024 * 1024,
            request_timeout: Duration::from_secs(30),
            idle_close: None,
            restart: true,
            memory_limit_mb: 256,
        }
    }
}

/// Configuration for a remote HTTP upstream.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Endpoint URL.
    pub url: String,
    /// Credentials to present.
    pub auth: Option<UpstreamAuth>,
    /// Per-request timeout.
    pub request_timeout: Duration,
}

impl HttpConfig {
    /// Config for `url` with default timeout and no credentials.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            auth: None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Configuration for a streamable HTTP upstream.
#[derive(Debug, Clone)]
pub struct StreamableConfig {
    /// Endpoint URL.
    pub url: String,
    /// Credentials to present.
    pub auth: Option<UpstreamAuth>,
    /// Per-request timeout for non-streaming exchanges.
    pub request_timeout: Duration,
    /// How long a slow consumer may stall the upstream reader before the
    /// stream is closed with an error event.
    pub backpressure: Duration,
    /// Bound on in-flight events between reader and consumer.
    pub channel_capacity: usize,
}

impl StreamableConfig {
    /// Config for `url` with default timeouts.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            auth: None,
            request_timeout: Duration::from_secs(30),
            backpressure: Duration::from_secs(2),
            channel_capacity: 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_redacts_secrets() {
        let auth = UpstreamAuth::Bearer {
            token: SecretString::from("super-secret"),
        };
        let rendered = format!("{auth:?}");
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn auth_deserializes_from_manifest_shape() {
        let auth: UpstreamAuth =
            serde_json::from_str(r#"{"bearer":{"token":"SECRET"}}"#).unwrap();
        assert!(matches!(auth, UpstreamAuth::Bearer { .. }));

        let auth: UpstreamAuth = serde_json::from_str(
            r#"{"apikey":{"location":"header","name":"X-Api-Key","value":"k"}}"#,
        )
        .unwrap();
        match auth {
            UpstreamAuth::ApiKey { location, name, .. } => {
                assert_eq!(location, ApiKeyLocation::Header);
                assert_eq!(name, "X-Api-Key");
            }
            other => panic!("expected apikey, got {other:?}"),
        }
    }

    #[test]
    fn stdio_defaults_match_policy() {
        let config = StdioConfig::default();
        assert_eq!(config.max_line_length, 1024 * 1024);
        assert_eq!(config.memory_limit_mb, 256);
        assert!(config.restart);
    }
}
