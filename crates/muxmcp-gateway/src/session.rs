//! Session store.
//!
//! One session per client conversation with one adapter. Ids are 128-bit
//! random hex tokens so they double as bearer-ish handles on the wire.
//! Every mutation happens under the map's shard lock and readers get
//! whole-struct clones, so a reader never observes a half-updated record.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::RngCore;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use muxmcp_protocol::{Implementation, ServerCapabilities};

/// One client conversation with one adapter.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Opaque session id.
    pub id: String,
    /// Owning adapter.
    pub adapter_id: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last time any frame touched this session.
    pub last_activity: DateTime<Utc>,
    /// Session id the upstream assigned (streamable transports only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_session_id: Option<String>,
    /// Protocol version negotiated on initialize.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<String>,
    /// Client-reported identity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_info: Option<Implementation>,
    /// Server identity answered to the client.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_info: Option<Implementation>,
    /// Capabilities answered to the client.
    #[serde(skip)]
    pub capabilities: Option<ServerCapabilities>,
    /// Whether `notifications/initialized` has arrived.
    pub initialized: bool,
}

/// Generate an unguessable session id: 16 random bytes, hex-encoded.
fn new_session_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Shared session store.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: DashMap<String, Session>,
}

impl SessionStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session bound to `adapter_id`.
    pub fn create(&self, adapter_id: &str) -> Session {
        let now = Utc::now();
        let session = Session {
            id: new_session_id(),
            adapter_id: adapter_id.to_string(),
            created_at: now,
            last_activity: now,
            upstream_session_id: None,
            protocol_version: None,
            client_info: None,
            server_info: None,
            capabilities: None,
            initialized: false,
        };
        debug!(session_id = %session.id, %adapter_id, "session created");
        self.sessions.insert(session.id.clone(), session.clone());
        session
    }

    /// Snapshot a session.
    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    /// Refresh the activity stamp. Silently ignores unknown ids.
    pub fn update_activity(&self, session_id: &str) {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.last_activity = Utc::now();
        }
    }

    /// Record the initialize outcome on a session.
    pub fn set_initialize_result(
        &self,
        session_id: &str,
        protocol_version: &str,
        client_info: Implementation,
        server_info: Implementation,
        capabilities: ServerCapabilities,
    ) {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.protocol_version = Some(protocol_version.to_string());
            session.client_info = Some(client_info);
            session.server_info = Some(server_info);
            session.capabilities = Some(capabilities);
            session.last_activity = Utc::now();
        }
    }

    /// Record capabilities on a session.
    pub fn set_capabilities(&self, session_id: &str, capabilities: ServerCapabilities) {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.capabilities = Some(capabilities);
        }
    }

    /// Bind the upstream's session id. Ignores empty bindings.
    pub fn set_upstream_session(&self, session_id: &str, upstream_id: &str) {
        if upstream_id.is_empty() {
            return;
        }
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.upstream_session_id = Some(upstream_id.to_string());
        }
    }

    /// Stamp a session as initialized.
    pub fn mark_initialized(&self, session_id: &str) {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.initialized = true;
            session.last_activity = Utc::now();
        }
    }

    /// Sessions owned by one adapter.
    pub fn list_by_adapter(&self, adapter_id: &str) -> Vec<Session> {
        self.sessions
            .iter()
            .filter(|s| s.adapter_id == adapter_id)
            .map(|s| s.clone())
            .collect()
    }

    /// Delete a session. Silently ignores unknown ids.
    pub fn delete(&self, session_id: &str) {
        if self.sessions.remove(session_id).is_some() {
            debug!(%session_id, "session deleted");
        }
    }

    /// Delete every session owned by an adapter (adapter teardown).
    pub fn delete_by_adapter(&self, adapter_id: &str) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, s| s.adapter_id != adapter_id);
        before - self.sessions.len()
    }

    /// Delete sessions idle longer than `max_idle`; returns how many went.
    pub fn reap_idle(&self, max_idle: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_idle).unwrap_or(chrono::Duration::MAX);
        let before = self.sessions.len();
        self.sessions.retain(|_, s| s.last_activity >= cutoff);
        let reaped = before - self.sessions.len();
        if reaped > 0 {
            info!(reaped, "reaped idle sessions");
        }
        reaped
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Run [`SessionStore::reap_idle`] on an interval until `shutdown`.
    pub fn spawn_reaper(
        self: &Arc<Self>,
        max_idle: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = interval.tick() => { store.reap_idle(max_idle); }
                    () = shutdown.cancelled() => return,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn ids_are_long_and_unique() {
        let store = SessionStore::new();
        let a = store.create("fs");
        let b = store.create("fs");
        assert_eq!(a.id.len(), 32);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn lifecycle_round_trip() {
        let store = SessionStore::new();
        let session = store.create("fs");

        store.set_upstream_session(&session.id, "up-1");
        store.mark_initialized(&session.id);

        let loaded = store.get(&session.id).unwrap();
        assert_eq!(loaded.upstream_session_id.as_deref(), Some("up-1"));
        assert!(loaded.initialized);

        store.delete(&session.id);
        assert!(store.get(&session.id).is_none());
        // Deleting again is silent.
        store.delete(&session.id);
    }

    #[test]
    fn empty_upstream_binding_is_ignored() {
        let store = SessionStore::new();
        let session = store.create("fs");
        store.set_upstream_session(&session.id, "");
        assert!(store.get(&session.id).unwrap().upstream_session_id.is_none());
    }

    #[test]
    fn list_by_adapter_filters() {
        let store = SessionStore::new();
        store.create("fs");
        store.create("fs");
        store.create("web");
        assert_eq!(store.list_by_adapter("fs").len(), 2);
        assert_eq!(store.list_by_adapter("web").len(), 1);
    }

    #[test]
    fn delete_by_adapter_sweeps() {
        let store = SessionStore::new();
        store.create("fs");
        store.create("fs");
        store.create("web");
        assert_eq!(store.delete_by_adapter("fs"), 2);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn reap_idle_spares_active_sessions() {
        let store = SessionStore::new();
        let stale = store.create("fs");
        let fresh = store.create("fs");

        // Backdate one session's activity.
        store
            .sessions
            .get_mut(&stale.id)
            .unwrap()
            .last_activity = Utc::now() - chrono::Duration::hours(2);

        assert_eq!(store.reap_idle(Duration::from_secs(3600)), 1);
        assert!(store.get(&fresh.id).is_some());
        assert!(store.get(&stale.id).is_none());
    }
}
