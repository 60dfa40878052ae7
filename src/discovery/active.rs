//! Rate-limited TCP connect scan over policy subnets.

use crate::discovery::subnet::expand_ipv4_cidr;
use crate::domain::{Candidate, CandidateSource, Protocol, ProtocolHint};
use crate::metrics::DiscoveryMetrics;
use crate::rate_limiter::{Limits, RateLimiter};
use std::collections::{BTreeMap, HashMap};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

pub const ACTIVE_CONFIDENCE: f64 = 0.9;

#[derive(Debug, Clone)]
pub struct ActiveScanner {
    port_map: BTreeMap<u16, Vec<Protocol>>,
    limiter: RateLimiter,
    connect_timeout: Duration,
}

impl ActiveScanner {
    pub fn new(
        port_map: BTreeMap<u16, Vec<Protocol>>,
        rate_limit_pps: u32,
        concurrency: u32,
        connect_timeout: Duration,
    ) -> Self {
        let limiter = RateLimiter::new(Limits {
            per_second: (rate_limit_pps > 0).then_some(rate_limit_pps),
            concurrency: Some(concurrency.max(1)),
        });
        Self { port_map, limiter, connect_timeout }
    }

    /// Scan each subnet in turn. A subnet that cannot be expanded is logged and
    /// skipped; the rest still run.
    pub async fn scan(&self, subnets: &[String]) -> Vec<Candidate> {
        let mut found: BTreeMap<Ipv4Addr, Candidate> = BTreeMap::new();
        for subnet in subnets {
            let hosts = match expand_ipv4_cidr(subnet) {
                Ok(hosts) => hosts,
                Err(e) => {
                    warn!("ActiveDiscovery: skipping subnet: {}", e);
                    DiscoveryMetrics::record_subnet_error();
                    continue;
                }
            };
            info!(subnet = %subnet, hosts = hosts.len(), ports = self.port_map.len(), "ActiveDiscovery: scanning");
            for candidate in self.scan_hosts(&hosts).await {
                if let Ok(ip) = candidate.ip.parse::<Ipv4Addr>() {
                    found.insert(ip, candidate);
                }
            }
        }
        info!("ActiveDiscovery: Found {} candidates", found.len());
        found.into_values().collect()
    }

    async fn scan_hosts(&self, hosts: &[Ipv4Addr]) -> Vec<Candidate> {
        let mut set = JoinSet::new();
        for host in hosts {
            for port in self.port_map.keys() {
                let addr = SocketAddr::new((*host).into(), *port);
                let limiter = self.limiter.clone();
                let timeout = self.connect_timeout;
                // The permit is taken before spawning so pacing and the
                // concurrency bound apply to connect attempts, not tasks.
                let permit = limiter.acquire().await;
                set.spawn(async move {
                    let open = probe_port(addr, timeout).await;
                    drop(permit);
                    (addr, open)
                });
            }
        }

        let mut open_by_host: HashMap<Ipv4Addr, Vec<u16>> = HashMap::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((SocketAddr::V4(addr), true)) => {
                    open_by_host.entry(*addr.ip()).or_default().push(addr.port());
                }
                Ok(_) => {}
                Err(e) => warn!("ActiveDiscovery: connect task failed: {}", e),
            }
        }

        let mut candidates: Vec<Candidate> = open_by_host
            .into_iter()
            .map(|(ip, mut ports)| {
                ports.sort_unstable();
                self.candidate(ip, ports)
            })
            .collect();
        candidates.sort_by(|a, b| a.ip.cmp(&b.ip));
        candidates
    }

    fn candidate(&self, ip: Ipv4Addr, open_ports: Vec<u16>) -> Candidate {
        let hints = open_ports
            .iter()
            .filter_map(|port| {
                self.port_map
                    .get(port)
                    .map(|protocols| ProtocolHint { port: *port, protocols: protocols.clone() })
            })
            .collect();
        Candidate {
            ip: ip.to_string(),
            source: CandidateSource::Active,
            open_ports,
            hints,
            confidence: ACTIVE_CONFIDENCE,
        }
    }
}

/// True when a TCP connection to `addr` completes within `timeout`.
pub async fn probe_port(addr: SocketAddr, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(_stream)) => true,
        Ok(Err(e)) => {
            debug!(%addr, "connect refused: {}", e);
            false
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn finds_listening_port_with_hint() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let mut ports = BTreeMap::new();
        ports.insert(port, vec![Protocol::Modbus]);
        let scanner = ActiveScanner::new(ports, 0, 4, Duration::from_millis(500));
        let found = scanner.scan(&["127.0.0.1/32".to_string()]).await;

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].ip, "127.0.0.1");
        assert_eq!(found[0].source, CandidateSource::Active);
        assert_eq!(found[0].open_ports, vec![port]);
        assert_eq!(found[0].hints[0].protocols, vec![Protocol::Modbus]);
        assert!((found[0].confidence - 0.9).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn bad_subnet_does_not_stop_others() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let mut ports = BTreeMap::new();
        ports.insert(port, vec![Protocol::Mtconnect]);
        let scanner = ActiveScanner::new(ports, 0, 4, Duration::from_millis(500));
        let found = scanner
            .scan(&["garbage".to_string(), "10.0.0.0/8".to_string(), "127.0.0.1/32".to_string()])
            .await;
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn closed_port_yields_nothing() {
        // Bind then drop to get a port that is very likely closed
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let mut ports = BTreeMap::new();
        ports.insert(port, vec![Protocol::Modbus]);
        let scanner = ActiveScanner::new(ports, 0, 4, Duration::from_millis(200));
        assert!(scanner.scan(&["127.0.0.1/32".to_string()]).await.is_empty());
    }
}
