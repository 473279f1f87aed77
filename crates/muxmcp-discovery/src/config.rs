//! Scan configuration as submitted over the discovery REST surface.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{DiscoveryError, DiscoveryResult};

/// Default per-probe timeout.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
/// Default worker-pool size.
pub const DEFAULT_MAX_CONCURRENT: usize = 10;

/// A port spec: a single port or an inclusive `"start-end"` range.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortSpec {
    /// A single port.
    Port(u16),
    /// A `"start-end"` range.
    Range(String),
}

/// Scan configuration.
///
/// `scanRanges` entries may be CIDR blocks, single addresses, or
/// `"a.b.c.d-e.f.g.h"` ranges. Missing fields take the documented
/// defaults; validation happens during expansion, not deserialization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ScanConfig {
    /// Address ranges to scan.
    pub scan_ranges: Vec<String>,
    /// Ports to scan on each address.
    pub ports: Vec<PortSpec>,
    /// Per-probe timeout as a duration string (`"5s"`, `"750ms"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    /// Worker-pool size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<usize>,
    /// Addresses to skip.
    #[serde(default)]
    pub exclude_addresses: Vec<String>,
    /// Skip the gateway's own listening address.
    #[serde(default)]
    pub exclude_proxy: bool,
}

impl ScanConfig {
    /// Per-probe timeout with the default applied.
    pub fn probe_timeout(&self) -> DiscoveryResult<Duration> {
        match self.timeout {
            Some(ref text) => parse_duration(text),
            None => Ok(DEFAULT_PROBE_TIMEOUT),
        }
    }

    /// Worker-pool size with the default applied.
    pub fn concurrency(&self) -> usize {
        self.max_concurrent
            .filter(|&n| n > 0)
            .unwrap_or(DEFAULT_MAX_CONCURRENT)
    }
}

/// Parse a duration string: an integer count followed by `ms`, `s`, `m`,
/// or `h` (a bare integer means seconds).
pub fn parse_duration(text: &str) -> DiscoveryResult<Duration> {
    let text = text.trim();
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (digits, unit) = text.split_at(split);
    let count: u64 = digits
        .parse()
        .map_err(|_| DiscoveryError::invalid_config(format!("bad duration '{text}'")))?;
    match unit.trim() {
        "ms" => Ok(Duration::from_millis(count)),
        "" | "s" => Ok(Duration::from_secs(count)),
        "m" => Ok(Duration::from_secs(count * 60)),
        "h" => Ok(Duration::from_secs(count * 3600)),
        other => Err(DiscoveryError::invalid_config(format!(
            "unknown duration unit '{other}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn deserializes_the_rest_shape() {
        let config: ScanConfig = serde_json::from_value(json!({
            "scanRanges": ["127.0.0.1/32", "10.0.0.1-10.0.0.9"],
            "ports": [8080, "9000-9005"],
            "timeout": "2s",
            "maxConcurrent": 4,
            "excludeAddresses": ["10.0.0.5"],
            "excludeProxy": true
        }))
        .unwrap();
        assert_eq!(config.scan_ranges.len(), 2);
        assert_eq!(config.probe_timeout().unwrap(), Duration::from_secs(2));
        assert_eq!(config.concurrency(), 4);
        assert!(config.exclude_proxy);
    }

    #[test]
    fn defaults_apply_when_fields_are_missing() {
        let config: ScanConfig =
            serde_json::from_value(json!({"scanRanges": ["127.0.0.1"], "ports": [80]})).unwrap();
        assert_eq!(config.probe_timeout().unwrap(), DEFAULT_PROBE_TIMEOUT);
        assert_eq!(config.concurrency(), DEFAULT_MAX_CONCURRENT);
        assert!(!config.exclude_proxy);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result = serde_json::from_value::<ScanConfig>(json!({
            "scanRanges": [], "ports": [], "bogus": 1
        }));
        assert!(result.is_err());
    }

    #[test]
    fn duration_units() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("24h").unwrap(), Duration::from_secs(86_400));
        assert_eq!(parse_duration("7").unwrap(), Duration::from_secs(7));
        assert!(parse_duration("fast").is_err());
        assert!(parse_duration("5d").is_err());
    }
}
