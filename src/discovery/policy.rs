use crate::domain::Protocol;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMode {
    Active,
    Passive,
    Hybrid,
    ManualOnly,
}

/// Discovery allowlist delivered by the policy service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryPolicy {
    pub mode: DiscoveryMode,
    pub active_enabled: bool,
    /// Connection attempts per second during an active scan.
    pub active_rate_limit_pps: u32,
    pub allowed_subnets: Vec<String>,
    pub port_probes: BTreeMap<Protocol, Vec<u16>>,
}

impl Default for DiscoveryPolicy {
    fn default() -> Self {
        let port_probes = Protocol::ALL.iter().map(|p| (*p, vec![p.default_port()])).collect();
        Self {
            mode: DiscoveryMode::Hybrid,
            active_enabled: true,
            active_rate_limit_pps: 10,
            allowed_subnets: Vec::new(),
            port_probes,
        }
    }
}

impl DiscoveryPolicy {
    pub fn is_active_allowed(&self) -> bool {
        match self.mode {
            DiscoveryMode::ManualOnly | DiscoveryMode::Passive => false,
            DiscoveryMode::Active | DiscoveryMode::Hybrid => self.active_enabled,
        }
    }

    pub fn is_passive_allowed(&self) -> bool {
        matches!(self.mode, DiscoveryMode::Passive | DiscoveryMode::Hybrid)
    }

    /// Port → protocols expected on it.
    pub fn port_map(&self) -> BTreeMap<u16, Vec<Protocol>> {
        let mut map: BTreeMap<u16, Vec<Protocol>> = BTreeMap::new();
        for (protocol, ports) in &self.port_probes {
            for port in ports {
                let entry = map.entry(*port).or_default();
                if !entry.contains(protocol) {
                    entry.push(*protocol);
                }
            }
        }
        map
    }

    pub fn log_decision(&self) {
        info!(
            mode = ?self.mode,
            active = self.is_active_allowed(),
            passive = self.is_passive_allowed(),
            rate_limit_pps = self.active_rate_limit_pps,
            "Discovery policy decision"
        );
        if !self.allowed_subnets.is_empty() {
            info!(subnets = ?self.allowed_subnets, "Discovery policy subnets");
        }
    }
}
