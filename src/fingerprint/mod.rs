//! Protocol Fingerprinter: per-protocol handshake probes over discovery
//! candidates.

pub mod mtconnect;
pub mod opcua;
pub mod tcp;

use crate::domain::{Candidate, Fingerprint, Protocol};
use crate::metrics::DiscoveryMetrics;
use crate::protocols::ProtocolError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// One protocol's identification handshake against `ip:port`.
///
/// `Ok(None)` means the target answered but is not this protocol; errors are
/// treated the same way by the orchestrator.
#[async_trait]
pub trait ProtocolProbe: Send + Sync {
    fn protocol(&self) -> Protocol;
    async fn probe(&self, ip: &str, port: u16) -> Result<Option<Fingerprint>, ProtocolError>;
}

#[derive(Clone)]
pub struct Fingerprinter {
    probes: Vec<Arc<dyn ProtocolProbe>>,
    timeout: Duration,
}

impl Fingerprinter {
    pub fn new(probes: Vec<Arc<dyn ProtocolProbe>>, timeout: Duration) -> Self {
        Self { probes, timeout }
    }

    /// The built-in probe set: MTConnect, OPC UA, Modbus and FOCAS.
    pub fn with_default_probes(timeout: Duration) -> Result<Self, ProtocolError> {
        let probes: Vec<Arc<dyn ProtocolProbe>> = vec![
            Arc::new(mtconnect::MtconnectProbe::new(timeout)?),
            Arc::new(opcua::OpcuaProbe::new(timeout)),
            Arc::new(tcp::TcpConnectProbe::modbus(timeout)),
            Arc::new(tcp::TcpConnectProbe::focas(timeout)),
        ];
        Ok(Self::new(probes, timeout))
    }

    fn probe_for(&self, protocol: Protocol) -> Option<Arc<dyn ProtocolProbe>> {
        self.probes.iter().find(|p| p.protocol() == protocol).cloned()
    }

    /// Fingerprint every candidate concurrently. Candidates without hints,
    /// or with no probe that answers, produce nothing.
    pub async fn fingerprint_all(&self, candidates: &[Candidate]) -> Vec<Fingerprint> {
        if candidates.is_empty() {
            return Vec::new();
        }
        info!("Fingerprint: processing {} candidates", candidates.len());

        let mut set = JoinSet::new();
        for candidate in candidates.iter().filter(|c| !c.hints.is_empty()) {
            let this = self.clone();
            let candidate = candidate.clone();
            set.spawn(async move { this.fingerprint(&candidate).await });
        }

        let mut results = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Some(fp)) => results.push(fp),
                Ok(None) => {}
                Err(e) => warn!("Fingerprint: probe task failed: {}", e),
            }
        }
        results.sort_by(|a, b| a.ip.cmp(&b.ip));
        info!("Fingerprint: resolved {} identities", results.len());
        results
    }

    /// Run every hinted probe for one candidate and keep the most confident
    /// answer. Earlier hints win ties.
    pub async fn fingerprint(&self, candidate: &Candidate) -> Option<Fingerprint> {
        let mut best: Option<Fingerprint> = None;
        for hint in &candidate.hints {
            for protocol in &hint.protocols {
                let Some(probe) = self.probe_for(*protocol) else {
                    continue;
                };
                let outcome = tokio::time::timeout(self.timeout, probe.probe(&candidate.ip, hint.port)).await;
                let fp = match outcome {
                    Ok(Ok(Some(fp))) => fp,
                    Ok(Ok(None)) => continue,
                    Ok(Err(e)) => {
                        debug!(ip = %candidate.ip, port = hint.port, protocol = %protocol, "probe failed: {}", e);
                        DiscoveryMetrics::record_probe_failure();
                        continue;
                    }
                    Err(_) => {
                        debug!(ip = %candidate.ip, port = hint.port, protocol = %protocol, "probe timed out");
                        DiscoveryMetrics::record_probe_failure();
                        continue;
                    }
                };
                if best.as_ref().map_or(true, |b| fp.confidence > b.confidence) {
                    best = Some(fp);
                }
            }
        }
        best
    }
}
