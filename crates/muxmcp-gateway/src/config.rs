//! Gateway configuration.
//!
//! Everything is settable as a flag or an environment variable; durations
//! use the same `"30s"` / `"5m"` strings the scan config accepts. Adapter
//! records come from a JSON manifest - the CRUD surface that would mutate
//! them at runtime lives outside this binary.

use clap::Parser;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use muxmcp_discovery::parse_duration;

fn duration_arg(text: &str) -> Result<Duration, String> {
    parse_duration(text).map_err(|e| e.to_string())
}

/// Runtime configuration for the gateway binary.
#[derive(Debug, Clone, Parser)]
#[command(name = "muxmcp-gateway", version, about = "Multi-tenant MCP gateway")]
pub struct GatewayConfig {
    /// Address to listen on.
    #[arg(long, env = "MUXMCP_LISTEN_ADDR", default_value = "127.0.0.1:8811")]
    pub listen_addr: SocketAddr,

    /// JSON manifest of adapter records loaded at boot.
    #[arg(long, env = "MUXMCP_ADAPTERS_FILE")]
    pub adapters_file: Option<PathBuf>,

    /// Deadline for the gateway's own upstream probes and capability
    /// handshakes.
    #[arg(long, env = "MUXMCP_PROBE_TIMEOUT", default_value = "5s", value_parser = duration_arg)]
    pub probe_timeout: Duration,

    /// Capability cache entry TTL.
    #[arg(long, env = "MUXMCP_CAPABILITY_TTL", default_value = "5m", value_parser = duration_arg)]
    pub capability_ttl: Duration,

    /// Idle interval after which sessions are reaped.
    #[arg(long, env = "MUXMCP_SESSION_IDLE", default_value = "30m", value_parser = duration_arg)]
    pub session_idle: Duration,

    /// Retention for terminal scan jobs.
    #[arg(long, env = "MUXMCP_SCAN_RETENTION", default_value = "24h", value_parser = duration_arg)]
    pub scan_retention: Duration,

    /// Grace period for draining in-flight requests on shutdown.
    #[arg(long, env = "MUXMCP_SHUTDOWN_GRACE", default_value = "30s", value_parser = duration_arg)]
    pub shutdown_grace: Duration,

    /// Terminate inbound TLS (requires a cert and key, or --tls-auto).
    #[arg(long, env = "MUXMCP_TLS_ENABLED", default_value_t = false)]
    pub tls_enabled: bool,

    /// PEM certificate path for inbound TLS.
    #[arg(long, env = "MUXMCP_TLS_CERT")]
    pub tls_cert: Option<PathBuf>,

    /// PEM key path for inbound TLS.
    #[arg(long, env = "MUXMCP_TLS_KEY")]
    pub tls_key: Option<PathBuf>,

    /// Generate a self-signed certificate instead of loading one.
    #[arg(long, env = "MUXMCP_TLS_AUTO", default_value_t = false)]
    pub tls_auto: bool,

    /// OTLP endpoint for trace export.
    #[arg(long, env = "MUXMCP_OTEL_ENDPOINT")]
    pub otel_endpoint: Option<String>,

    /// Enable OpenTelemetry export.
    #[arg(long, env = "MUXMCP_OTEL_ENABLED", default_value_t = false)]
    pub otel_enabled: bool,
}

impl GatewayConfig {
    /// Addresses the scanner treats as "the gateway itself" when a scan
    /// asks to exclude the proxy.
    pub fn local_addresses(&self) -> Vec<IpAddr> {
        let ip = self.listen_addr.ip();
        if ip.is_unspecified() {
            vec![
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                IpAddr::V6(Ipv6Addr::LOCALHOST),
            ]
        } else {
            vec![ip]
        }
    }
}
