//! Passive discovery from the OS neighbor (ARP) table.

use crate::domain::Candidate;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use tracing::{info, warn};

const PROC_NET_ARP: &str = "/proc/net/arp";

static IPV4_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}$").expect("static regex"));

/// Read the neighbor table and return one low-confidence candidate per
/// resolved IPv4 neighbor. Never fails; an unreadable table yields nothing.
pub async fn discover_passive() -> Vec<Candidate> {
    let ips = match tokio::fs::read_to_string(PROC_NET_ARP).await {
        Ok(table) => parse_proc_net_arp(&table),
        Err(e) => {
            warn!("PassiveDiscovery: {} unavailable ({}), trying 'ip neigh show'", PROC_NET_ARP, e);
            match tokio::process::Command::new("ip").args(["neigh", "show"]).output().await {
                Ok(out) if out.status.success() => {
                    parse_ip_neigh(&String::from_utf8_lossy(&out.stdout))
                }
                Ok(out) => {
                    warn!("PassiveDiscovery: 'ip neigh show' exited with {}", out.status);
                    Vec::new()
                }
                Err(e) => {
                    warn!("PassiveDiscovery: failed to run 'ip neigh show': {}", e);
                    Vec::new()
                }
            }
        }
    };

    let candidates: Vec<Candidate> = ips.into_iter().map(Candidate::passive).collect();
    info!("PassiveDiscovery: Found {} candidates", candidates.len());
    candidates
}

fn is_usable(ip: &str) -> bool {
    if !IPV4_RE.is_match(ip) {
        return false;
    }
    match ip.parse::<Ipv4Addr>() {
        Ok(addr) => !(addr.is_unspecified() || addr.is_broadcast() || addr.is_multicast()),
        Err(_) => false,
    }
}

/// Parse `/proc/net/arp`. Entries with flags 0x0 are incomplete and skipped.
pub fn parse_proc_net_arp(table: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    for line in table.lines().skip(1) {
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.len() < 4 {
            continue;
        }
        let (ip, flags, mac) = (cols[0], cols[2], cols[3]);
        if flags == "0x0" || mac == "00:00:00:00:00:00" {
            continue;
        }
        if is_usable(ip) {
            seen.insert(ip.to_string());
        }
    }
    seen.into_iter().collect()
}

/// Parse `ip neigh show` output, skipping FAILED / INCOMPLETE neighbors.
pub fn parse_ip_neigh(output: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    for line in output.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 4 {
            continue;
        }
        if parts.iter().any(|p| *p == "FAILED" || *p == "INCOMPLETE") {
            continue;
        }
        if is_usable(parts[0]) {
            seen.insert(parts[0].to_string());
        }
    }
    seen.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_proc_net_arp() {
        let table = "\
IP address       HW type     Flags       HW address            Mask     Device
192.168.1.1      0x1         0x2         aa:bb:cc:dd:ee:ff     *        eth0
192.168.1.20     0x1         0x0         00:00:00:00:00:00     *        eth0
192.168.1.7      0x1         0x2         11:22:33:44:55:66     *        eth0
";
        assert_eq!(parse_proc_net_arp(table), vec!["192.168.1.1", "192.168.1.7"]);
    }

    #[test]
    fn parses_ip_neigh() {
        let out = "\
192.168.1.1 dev eth0 lladdr aa:bb:cc:dd:ee:ff REACHABLE
192.168.1.9 dev eth0  FAILED
fe80::1 dev eth0 lladdr aa:bb:cc:dd:ee:ff router STALE
10.0.0.4 dev eth1 lladdr 11:22:33:44:55:66 STALE
";
        assert_eq!(parse_ip_neigh(out), vec!["10.0.0.4", "192.168.1.1"]);
    }
}
