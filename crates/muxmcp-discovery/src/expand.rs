//! Scan-target expansion.
//!
//! Turns a [`ScanConfig`] into the concrete `(ip, port)` set a scan will
//! probe. CIDR blocks wider than /16 are rejected outright - a typo like
//! `10.0.0.0/8` would otherwise queue sixteen million probes.

use ipnetwork::IpNetwork;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use crate::config::{PortSpec, ScanConfig};
use crate::error::{DiscoveryError, DiscoveryResult};

/// Widest CIDR block accepted.
pub const MAX_PREFIX_BITS: u8 = 16;

/// Expand a scan config into its target set, exclusions applied.
pub fn expand_targets(
    config: &ScanConfig,
    extra_exclusions: &[IpAddr],
) -> DiscoveryResult<Vec<SocketAddr>> {
    if config.scan_ranges.is_empty() {
        return Err(DiscoveryError::invalid_config("scanRanges is empty"));
    }
    if config.ports.is_empty() {
        return Err(DiscoveryError::invalid_config("ports is empty"));
    }

    let mut excluded: HashSet<IpAddr> = extra_exclusions.iter().copied().collect();
    for text in &config.exclude_addresses {
        let addr: IpAddr = text.parse().map_err(|_| {
            DiscoveryError::invalid_config(format!("bad exclude address '{text}'"))
        })?;
        excluded.insert(addr);
    }

    let ports = expand_ports(&config.ports)?;
    let mut targets = Vec::new();
    for range in &config.scan_ranges {
        for addr in expand_range(range)? {
            if excluded.contains(&addr) {
                continue;
            }
            for &port in &ports {
                targets.push(SocketAddr::new(addr, port));
            }
        }
    }
    Ok(targets)
}

/// Expand one range entry: CIDR, `a-b` range, or a single address.
fn expand_range(range: &str) -> DiscoveryResult<Vec<IpAddr>> {
    let range = range.trim();

    if range.contains('/') {
        let network: IpNetwork = range
            .parse()
            .map_err(|e| DiscoveryError::invalid_config(format!("bad CIDR '{range}': {e}")))?;
        let host_bits_cap = match network {
            IpNetwork::V4(_) => MAX_PREFIX_BITS,
            // /112 leaves the same 2^16 host budget for IPv6.
            IpNetwork::V6(_) => 128 - MAX_PREFIX_BITS,
        };
        if network.prefix() < host_bits_cap {
            return Err(DiscoveryError::invalid_config(format!(
                "CIDR '{range}' is wider than /{host_bits_cap}"
            )));
        }
        return Ok(network.iter().collect());
    }

    if let Some((start, end)) = range.split_once('-') {
        let start: Ipv4Addr = start.trim().parse().map_err(|_| {
            DiscoveryError::invalid_config(format!("bad range start in '{range}'"))
        })?;
        let end: Ipv4Addr = end.trim().parse().map_err(|_| {
            DiscoveryError::invalid_config(format!("bad range end in '{range}'"))
        })?;
        let (start, end) = (u32::from(start), u32::from(end));
        if end < start {
            return Err(DiscoveryError::invalid_config(format!(
                "range '{range}' runs backwards"
            )));
        }
        if end - start >= u32::from(u16::MAX) {
            return Err(DiscoveryError::invalid_config(format!(
                "range '{range}' covers more than 65535 addresses"
            )));
        }
        return Ok((start..=end).map(|n| IpAddr::V4(Ipv4Addr::from(n))).collect());
    }

    let addr: IpAddr = range
        .parse()
        .map_err(|_| DiscoveryError::invalid_config(format!("bad address '{range}'")))?;
    Ok(vec![addr])
}

/// Expand port specs into a deduplicated, ordered list.
fn expand_ports(specs: &[PortSpec]) -> DiscoveryResult<Vec<u16>> {
    let mut seen = HashSet::new();
    let mut ports = Vec::new();
    for spec in specs {
        match spec {
            PortSpec::Port(port) => {
                if seen.insert(*port) {
                    ports.push(*port);
                }
            }
            PortSpec::Range(text) => {
                let (start, end) = text.split_once('-').ok_or_else(|| {
                    DiscoveryError::invalid_config(format!("bad port range '{text}'"))
                })?;
                let start: u16 = start.trim().parse().map_err(|_| {
                    DiscoveryError::invalid_config(format!("bad port range '{text}'"))
                })?;
                let end: u16 = end.trim().parse().map_err(|_| {
                    DiscoveryError::invalid_config(format!("bad port range '{text}'"))
                })?;
                if end < start {
                    return Err(DiscoveryError::invalid_config(format!(
                        "port range '{text}' runs backwards"
                    )));
                }
                for port in start..=end {
                    if seen.insert(port) {
                        ports.push(port);
                    }
                }
            }
        }
    }
    Ok(ports)
}
