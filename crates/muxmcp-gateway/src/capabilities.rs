//! Capability cache with TTL and single-flight fetches.
//!
//! Built on moka's future cache: `try_get_with` guarantees that when N
//! callers race on a cold key exactly one fetch runs and everyone shares
//! its outcome, and that a failed fetch leaves nothing cached.

use chrono::{DateTime, Utc};
use moka::future::Cache;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use muxmcp_protocol::{Implementation, ServerCapabilities};

use crate::error::GatewayError;

/// Default entry TTL.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// What the gateway knows about an upstream's advertised feature set.
#[derive(Debug, Clone)]
pub struct CapabilityRecord {
    /// Parsed capability object.
    pub capabilities: ServerCapabilities,
    /// The raw capability blob, preserved for forwarding.
    pub raw: Value,
    /// Upstream identity, when known.
    pub server_info: Option<Implementation>,
    /// Protocol version the upstream answered with.
    pub protocol_version: Option<String>,
    /// When this record was fetched.
    pub fetched_at: DateTime<Utc>,
}

impl CapabilityRecord {
    /// Record from a raw capability blob.
    pub fn from_raw(raw: Value) -> Self {
        let capabilities = serde_json::from_value(raw.clone()).unwrap_or_default();
        Self {
            capabilities,
            raw,
            server_info: None,
            protocol_version: None,
            fetched_at: Utc::now(),
        }
    }

    /// An empty record, used when an upstream cannot be asked.
    pub fn empty() -> Self {
        Self {
            capabilities: ServerCapabilities::default(),
            raw: Value::Object(serde_json::Map::new()),
            server_info: None,
            protocol_version: None,
            fetched_at: Utc::now(),
        }
    }
}

/// TTL-bounded adapter-id -> capability map.
#[derive(Debug, Clone)]
pub struct CapabilityCache {
    cache: Cache<String, Arc<CapabilityRecord>>,
}

impl CapabilityCache {
    /// Cache with the given entry TTL.
    pub fn new(ttl: Duration) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(10_000)
                .time_to_live(ttl)
                .build(),
        }
    }

    /// Get the cached record for `adapter_id`, running `fetch` if the
    /// entry is cold. Concurrent callers on a cold key share one fetch;
    /// a fetch error is shared too, and caches nothing.
    pub async fn get_or_fetch<F>(
        &self,
        adapter_id: &str,
        fetch: F,
    ) -> Result<Arc<CapabilityRecord>, Arc<GatewayError>>
    where
        F: Future<Output = Result<CapabilityRecord, GatewayError>>,
    {
        self.cache
            .try_get_with(adapter_id.to_string(), async move {
                fetch.await.map(Arc::new)
            })
            .await
    }

    /// Store a record directly (probe results, explicit sync).
    pub async fn put(&self, adapter_id: &str, record: CapabilityRecord) {
        self.cache
            .insert(adapter_id.to_string(), Arc::new(record))
            .await;
    }

    /// Drop the entry for `adapter_id`; the next request refetches.
    pub async fn invalidate(&self, adapter_id: &str) {
        self.cache.invalidate(adapter_id).await;
    }

    /// The cached record, without fetching.
    pub async fn peek(&self, adapter_id: &str) -> Option<Arc<CapabilityRecord>> {
        self.cache.get(adapter_id).await
    }
}

impl Default for CapabilityCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}
