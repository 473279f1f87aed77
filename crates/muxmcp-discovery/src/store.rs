//! Discovered-server store.
//!
//! Keyed by a deterministic id so the same server found by two scans
//! collapses into one record: insert is upsert, refreshing `last_seen`,
//! and `reap` ages out servers that stopped answering.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::debug;

/// How a discovered server gates access, as observed by the probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthClassification {
    /// Accepted an unauthenticated initialize.
    None,
    /// Rejected with a bearer challenge.
    RequiredBearer,
    /// Rejected with an OAuth resource-metadata challenge.
    RequiredOauth,
    /// Rejected with some other challenge.
    RequiredOther,
    /// Could not be determined.
    Unknown,
}

/// Exposure classification: High means the server answered without any
/// inbound authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vulnerability {
    /// Open to anyone who can reach it.
    High,
    /// Auth required (non-OAuth scheme).
    Medium,
    /// Auth required with OAuth discovery metadata.
    Low,
}

/// Transport flavor a discovered server answered over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiscoveredTransport {
    /// Plain JSON reply.
    Http,
    /// SSE reply.
    Sse,
}

/// One discovered MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredServer {
    /// Deterministic id: hex sha256 of `address|endpoint`.
    pub id: String,
    /// Full probe URL that answered.
    pub url: String,
    /// Transport flavor of the answer.
    pub transport: DiscoveredTransport,
    /// `serverInfo` from the initialize result, when one was obtained.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_info: Option<Value>,
    /// Observed auth posture.
    pub auth: AuthClassification,
    /// Exposure classification.
    pub vulnerability: Vulnerability,
    /// First time any scan saw this server.
    pub first_seen: DateTime<Utc>,
    /// Most recent sighting.
    pub last_seen: DateTime<Utc>,
}

/// Deterministic id for a server at `address` answering on `endpoint`.
pub fn server_id(address: &str, endpoint: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(address.as_bytes());
    hasher.update(b"|");
    hasher.update(endpoint.as_bytes());
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

/// Shared store of discovered servers.
#[derive(Debug, Default)]
pub struct DiscoveryStore {
    servers: DashMap<String, DiscoveredServer>,
}

impl DiscoveryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a server. Existing records keep their
    /// `first_seen` and take everything else from the new sighting.
    pub fn upsert(&self, mut server: DiscoveredServer) {
        match self.servers.get(&server.id).map(|e| e.first_seen) {
            Some(first_seen) => {
                server.first_seen = first_seen;
                debug!(id = %server.id, "refreshing discovered server");
            }
            None => debug!(id = %server.id, url = %server.url, "new discovered server"),
        }
        self.servers.insert(server.id.clone(), server);
    }

    /// Look one server up by id.
    pub fn get(&self, id: &str) -> Option<DiscoveredServer> {
        self.servers.get(id).map(|e| e.clone())
    }

    /// All known servers, unordered.
    pub fn list(&self) -> Vec<DiscoveredServer> {
        self.servers.iter().map(|e| e.clone()).collect()
    }

    /// Drop servers not seen within `threshold`.
    pub fn reap(&self, threshold: Duration) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::MAX);
        self.servers.retain(|_, server| server.last_seen >= cutoff);
    }

    /// Number of records held.
    pub fn len(&self) -> usize {
        self.servers.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}
