//! Adapter model and store.
//!
//! An adapter is the routing unit: a stable name bound to exactly one
//! upstream. Stdio adapters carry a command line, everything else a URL -
//! [`Adapter::validate`] rejects records that mix the two. The store is a
//! plain keyed map; persistence and the CRUD surface live outside the
//! gateway, which only ever reads records and loads a manifest at boot.

use dashmap::DashMap;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use muxmcp_transport::{StdioConfig, StreamableConfig, UpstreamAuth};

use crate::auth::InboundAuth;
use crate::error::{GatewayError, GatewayResult};

/// Which transport an adapter's upstream speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum TransportKind {
    /// Child process, newline-JSON on stdio.
    Stdio,
    /// Plain request/response HTTP.
    RemoteHttp,
    /// MCP streamable HTTP.
    StreamableHttp,
    /// Legacy SSE endpoint; handled by the streamable transport.
    Sse,
}

impl TransportKind {
    /// Whether this kind can back a client-facing SSE stream.
    pub fn supports_streaming(self) -> bool {
        matches!(self, Self::StreamableHttp | Self::Sse)
    }
}

/// Connection policy knobs, all optional in the manifest.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionPolicy {
    /// Per-request timeout in milliseconds.
    pub request_timeout_ms: u64,
    /// Idle interval in milliseconds after which a stdio child is torn
    /// down; absent means keep it alive.
    pub idle_close_ms: Option<u64>,
    /// Respawn a stdio child when it exits.
    pub restart: bool,
}

impl Default for ConnectionPolicy {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            idle_close_ms: None,
            restart: true,
        }
    }
}

impl ConnectionPolicy {
    /// Request timeout as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// One routing entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Adapter {
    /// Stable identifier; the `{name}` path segment resolves against it.
    pub id: String,
    /// Human name; also resolvable in paths.
    #[serde(default)]
    pub name: Option<String>,
    /// Upstream transport kind.
    pub kind: TransportKind,
    /// Command path (stdio only).
    #[serde(default)]
    pub command: Option<String>,
    /// Command arguments (stdio only).
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra child environment (stdio only).
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Upstream URL (non-stdio only).
    #[serde(default)]
    pub url: Option<String>,
    /// Credentials presented upstream.
    #[serde(default)]
    pub upstream_auth: Option<UpstreamAuth>,
    /// Credentials demanded of clients.
    #[serde(default)]
    pub inbound_auth: InboundAuth,
    /// Timeouts and lifecycle knobs.
    #[serde(default)]
    pub policy: ConnectionPolicy,
}

impl Adapter {
    /// Display name: the human name when set, the id otherwise.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Enforce the kind/locator invariant.
    pub fn validate(&self) -> GatewayResult<()> {
        let fail = |message: &str| {
            Err(GatewayError::InvalidAdapter {
                name: self.id.clone(),
                message: message.to_string(),
            })
        };
        match self.kind {
            TransportKind::Stdio => {
                if self.command.as_deref().is_none_or(str::is_empty) {
                    return fail("stdio adapter needs a command");
                }
                if self.url.is_some() {
                    return fail("stdio adapter must not carry a url");
                }
            }
            TransportKind::RemoteHttp | TransportKind::StreamableHttp | TransportKind::Sse => {
                let Some(ref url) = self.url else {
                    return fail("http adapter needs a url");
                };
                if url::Url::parse(url).is_err() {
                    return fail("adapter url does not parse");
                }
                if self.command.is_some() || !self.args.is_empty() {
                    return fail("http adapter must not carry a command");
                }
            }
        }
        Ok(())
    }

    /// Stdio transport config for this adapter.
    ///
    /// # Panics
    ///
    /// Call only on validated stdio adapters.
    pub fn stdio_config(&self) -> StdioConfig {
        StdioConfig {
            command: self.command.clone().expect("validated stdio adapter"),
            args: self.args.clone(),
            env: self.env.clone(),
            request_timeout: self.policy.request_timeout(),
            idle_close: self.policy.idle_close_ms.map(Duration::from_millis),
            restart: self.policy.restart,
            ..Default::default()
        }
    }

    /// Streamable transport config for this adapter.
    ///
    /// # Panics
    ///
    /// Call only on validated non-stdio adapters.
    pub fn streamable_config(&self) -> StreamableConfig {
        let mut config =
            StreamableConfig::new(self.url.clone().expect("validated http adapter"));
        config.auth = self.upstream_auth.clone();
        config.request_timeout = self.policy.request_timeout();
        config
    }
}

/// Keyed adapter store. Mutation happens through the external CRUD layer;
/// the gateway reads, plus a teardown hook so transports die with their
/// adapter.
#[derive(Debug, Default)]
pub struct AdapterStore {
    adapters: DashMap<String, Arc<Adapter>>,
}

impl AdapterStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and insert an adapter; replaces any record with the same id.
    pub fn insert(&self, adapter: Adapter) -> GatewayResult<()> {
        adapter.validate()?;
        info!(id = %adapter.id, kind = ?adapter.kind, "registered adapter");
        self.adapters.insert(adapter.id.clone(), Arc::new(adapter));
        Ok(())
    }

    /// Resolve a path segment against id first, then human name.
    pub fn resolve(&self, name: &str) -> Option<Arc<Adapter>> {
        if let Some(found) = self.adapters.get(name) {
            return Some(Arc::clone(&found));
        }
        self.adapters
            .iter()
            .find(|entry| entry.name.as_deref() == Some(name))
            .map(|entry| Arc::clone(&entry))
    }

    /// Remove an adapter, returning it for teardown.
    pub fn remove(&self, id: &str) -> Option<Arc<Adapter>> {
        self.adapters.remove(id).map(|(_, adapter)| adapter)
    }

    /// All adapters, unordered.
    pub fn list(&self) -> Vec<Arc<Adapter>> {
        self.adapters.iter().map(|e| Arc::clone(&e)).collect()
    }

    /// Load a JSON manifest (an array of adapter records).
    pub fn load_manifest(&self, json: &str) -> GatewayResult<usize> {
        let adapters: Vec<Adapter> = serde_json::from_str(json)?;
        let count = adapters.len();
        for adapter in adapters {
            self.insert(adapter)?;
        }
        Ok(count)
    }
}
