use crate::discovery::active::probe_port;
use crate::domain::{Fingerprint, Protocol};
use crate::fingerprint::ProtocolProbe;
use crate::protocols::ProtocolError;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;

/// Identification by a bare TCP connect on the protocol's port, for
/// protocols without a cheap discovery handshake.
pub struct TcpConnectProbe {
    protocol: Protocol,
    confidence: f64,
    vendor: Option<&'static str>,
    timeout: Duration,
}

impl TcpConnectProbe {
    pub fn modbus(timeout: Duration) -> Self {
        Self { protocol: Protocol::Modbus, confidence: 0.9, vendor: None, timeout }
    }

    pub fn focas(timeout: Duration) -> Self {
        Self { protocol: Protocol::FanucFocas, confidence: 0.7, vendor: Some("FANUC"), timeout }
    }

    fn scheme(&self) -> &'static str {
        match self.protocol {
            Protocol::Modbus => "modbus-tcp",
            Protocol::FanucFocas => "focas",
            Protocol::Mtconnect => "http",
            Protocol::Opcua => "opc.tcp",
        }
    }
}

#[async_trait]
impl ProtocolProbe for TcpConnectProbe {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    async fn probe(&self, ip: &str, port: u16) -> Result<Option<Fingerprint>, ProtocolError> {
        let addr: SocketAddr = format!("{}:{}", ip, port)
            .parse()
            .map_err(|_| ProtocolError::Malformed(format!("bad address {}:{}", ip, port)))?;
        if !probe_port(addr, self.timeout).await {
            return Ok(None);
        }
        let endpoint = format!("{}://{}:{}", self.scheme(), ip, port);
        let fp = Fingerprint::new(ip, self.protocol, endpoint, self.confidence)
            .with_vendor(self.vendor.map(str::to_string))
            .with_evidence("port_open", port);
        Ok(Some(fp))
    }
}
