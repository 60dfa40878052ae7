//! Network Prober: passive neighbor table plus policy-gated active scan.

pub mod active;
pub mod passive;
pub mod policy;
pub mod subnet;

use crate::config::DiscoveryConfig;
use crate::domain::Candidate;
use active::ActiveScanner;
use policy::DiscoveryPolicy;
use std::collections::BTreeMap;
use tracing::info;

pub use policy::DiscoveryMode;

#[derive(Debug, Clone)]
pub struct NetworkProber {
    config: DiscoveryConfig,
}

impl NetworkProber {
    pub fn new(config: DiscoveryConfig) -> Self {
        Self { config }
    }

    /// Subnets to actively scan: the policy allowlist, or the configured
    /// default subnet when the allowlist is empty.
    pub fn scan_subnets(&self, policy: &DiscoveryPolicy) -> Vec<String> {
        if policy.allowed_subnets.is_empty() {
            vec![self.config.default_subnet.clone()]
        } else {
            policy.allowed_subnets.clone()
        }
    }

    /// Run one discovery pass under `policy`. Never fails; unreachable
    /// sources simply contribute no candidates.
    pub async fn discover(&self, policy: &DiscoveryPolicy) -> Vec<Candidate> {
        let passive = if policy.is_passive_allowed() {
            passive::discover_passive().await
        } else {
            Vec::new()
        };

        let active = if policy.is_active_allowed() {
            let scanner = ActiveScanner::new(
                policy.port_map(),
                policy.active_rate_limit_pps,
                self.config.scan_concurrency,
                self.config.connect_timeout(),
            );
            scanner.scan(&self.scan_subnets(policy)).await
        } else {
            Vec::new()
        };

        let merged = merge_candidates(passive, active);
        info!("NetworkProber: {} candidates after merge", merged.len());
        merged
    }
}

/// Combine passive and active candidates; an active result replaces the
/// passive one for the same ip.
pub fn merge_candidates(passive: Vec<Candidate>, active: Vec<Candidate>) -> Vec<Candidate> {
    let mut by_ip: BTreeMap<String, Candidate> = BTreeMap::new();
    for c in passive {
        by_ip.entry(c.ip.clone()).or_insert(c);
    }
    for c in active {
        by_ip.insert(c.ip.clone(), c);
    }
    by_ip.into_values().collect()
}
