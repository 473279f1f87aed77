//! Gateway binary: wire the stores together, bind, serve, drain.

use anyhow::Context;
use clap::Parser;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use muxmcp_discovery::{DiscoveryStore, JobManager, Scanner};
use muxmcp_gateway::capabilities::CapabilityCache;
use muxmcp_gateway::http::{AppState, build_router};
use muxmcp_gateway::{AdapterStore, GatewayConfig, GatewayRouter, SessionStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = GatewayConfig::parse();
    if config.tls_enabled || config.tls_auto {
        // Certificate provisioning and TLS termination sit in front of the
        // gateway; the flags are accepted so deployments can carry them.
        warn!("inbound TLS requested; terminate TLS at the fronting proxy");
    }
    if config.otel_enabled {
        info!(endpoint = ?config.otel_endpoint, "OTEL export is handled by the collector sidecar");
    }

    let shutdown = CancellationToken::new();

    let adapters = Arc::new(AdapterStore::new());
    if let Some(ref path) = config.adapters_file {
        let manifest = std::fs::read_to_string(path)
            .with_context(|| format!("reading adapter manifest {}", path.display()))?;
        let count = adapters
            .load_manifest(&manifest)
            .context("loading adapter manifest")?;
        info!(count, "adapters loaded from manifest");
    }

    let sessions = Arc::new(SessionStore::new());
    sessions.spawn_reaper(config.session_idle, shutdown.clone());

    let router = Arc::new(GatewayRouter::new(
        Arc::clone(&adapters),
        Arc::clone(&sessions),
        CapabilityCache::new(config.capability_ttl),
        config.probe_timeout,
        shutdown.clone(),
    ));

    let discovered = Arc::new(DiscoveryStore::new());
    let jobs = Arc::new(
        JobManager::new(
            Arc::new(Scanner::new()),
            Arc::clone(&discovered),
            config.local_addresses(),
        )
        .with_retention(config.scan_retention),
    );
    jobs.spawn_reaper(Duration::from_secs(3600));

    let state = Arc::new(AppState {
        router: Arc::clone(&router),
        jobs: Arc::clone(&jobs),
        discovered,
        sse_states: DashMap::new(),
        shutdown: shutdown.clone(),
    });
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "gateway listening");

    let signal_token = shutdown.clone();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        signal_token.cancel();
    });

    let mut serve_task = tokio::spawn(server.into_future());
    tokio::select! {
        result = &mut serve_task => {
            result.context("server task panicked")?.context("server error")?;
        }
        () = shutdown.cancelled() => {
            info!(grace = ?config.shutdown_grace, "draining in-flight requests");
            match tokio::time::timeout(config.shutdown_grace, &mut serve_task).await {
                Ok(result) => result.context("server task panicked")?.context("server error")?,
                Err(_) => warn!("grace period elapsed with streams outstanding"),
            }
        }
    }

    router.shutdown().await;
    jobs.shutdown();
    info!("gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
