use crate::error::{GatewayError, Result};
use std::net::Ipv4Addr;

/// Largest subnet an active scan will expand (a /16).
pub const MAX_SCAN_HOSTS: u64 = 1 << 16;

/// Expand an IPv4 CIDR (or a bare address) into scannable host addresses.
///
/// Network and broadcast addresses are skipped except for /31 and /32.
pub fn expand_ipv4_cidr(cidr: &str) -> Result<Vec<Ipv4Addr>> {
    let cidr = cidr.trim();
    let (addr_part, prefix) = match cidr.split_once('/') {
        Some((a, p)) => {
            let prefix: u32 = p.parse().map_err(|_| GatewayError::Subnet(cidr.to_string()))?;
            (a, prefix)
        }
        None => (cidr, 32),
    };
    if prefix > 32 {
        return Err(GatewayError::Subnet(cidr.to_string()));
    }
    let addr: Ipv4Addr = addr_part.parse().map_err(|_| GatewayError::Subnet(cidr.to_string()))?;

    let size: u64 = 1u64 << (32 - prefix);
    if size > MAX_SCAN_HOSTS {
        return Err(GatewayError::Subnet(format!(
            "{} ({} addresses exceeds scan limit of {})",
            cidr, size, MAX_SCAN_HOSTS
        )));
    }

    let mask: u32 = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
    let network = u32::from(addr) & mask;

    let hosts = if prefix >= 31 {
        (0..size).map(|i| Ipv4Addr::from(network + i as u32)).collect()
    } else {
        (1..size - 1).map(|i| Ipv4Addr::from(network + i as u32)).collect()
    };
    Ok(hosts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slash_24_skips_network_and_broadcast() {
        let hosts = expand_ipv4_cidr("192.168.1.0/24").unwrap();
        assert_eq!(hosts.len(), 254);
        assert_eq!(hosts[0], Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(hosts[253], Ipv4Addr::new(192, 168, 1, 254));
    }

    #[test]
    fn host_bits_are_masked() {
        let hosts = expand_ipv4_cidr("10.0.0.77/30").unwrap();
        assert_eq!(hosts, vec![Ipv4Addr::new(10, 0, 0, 77),Ipv4Addr::new(10, 0, 0, 78)]);
    }

    #[test]
    fn single_host() {
        assert_eq!(expand_ipv4_cidr("127.0.0.1/32").unwrap(), vec![Ipv4Addr::LOCALHOST]);
        assert_eq!(expand_ipv4_cidr("127.0.0.1").unwrap(), vec![Ipv4Addr::LOCALHOST]);
    }

    #[test]
    fn rejects_garbage_and_oversized() {
        assert!(expand_ipv4_cidr("10.0.0.0/33").is_err());
        assert!(expand_ipv4_cidr("not-an-ip/24").is_err());
        assert!(expand_ipv4_cidr("10.0.0.0/8").is_err());
    }
}
