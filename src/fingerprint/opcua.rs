use crate::domain::{Fingerprint, Protocol};
use crate::fingerprint::ProtocolProbe;
use crate::protocols::opcua::{discover_endpoints, ApplicationDescription};
use crate::protocols::ProtocolError;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;

pub const OPCUA_CONFIDENCE: f64 = 0.95;
pub const OPCUA_ACK_ONLY_CONFIDENCE: f64 = 0.8;

static KNOWN_VENDORS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (r"(?i)siemens|sinumerik", "Siemens"),
        (r"(?i)fanuc", "FANUC"),
        (r"(?i)haas", "Haas"),
        (r"(?i)mazak", "Mazak"),
        (r"(?i)okuma", "Okuma"),
        (r"(?i)heidenhain", "Heidenhain"),
        (r"(?i)beckhoff|twincat", "Beckhoff"),
        (r"(?i)\bdmg\b|dmgmori", "DMG MORI"),
        (r"(?i)b&r|br-automation", "B&R"),
    ]
    .into_iter()
    .filter_map(|(pattern, vendor)| Regex::new(pattern).ok().map(|re| (re, vendor)))
    .collect()
});

/// Best-effort vendor name from the server's application description.
pub fn vendor_from_application(app: &ApplicationDescription) -> Option<String> {
    let haystack = [&app.product_uri, &app.application_uri, &app.application_name]
        .iter()
        .filter_map(|s| s.as_deref())
        .collect::<Vec<_>>()
        .join(" ");
    KNOWN_VENDORS
        .iter()
        .find(|(re, _)| re.is_match(&haystack))
        .map(|(_, vendor)| vendor.to_string())
}

pub struct OpcuaProbe {
    timeout: Duration,
}

impl OpcuaProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ProtocolProbe for OpcuaProbe {
    fn protocol(&self) -> Protocol {
        Protocol::Opcua
    }

    async fn probe(&self, ip: &str, port: u16) -> Result<Option<Fingerprint>, ProtocolError> {
        let endpoint = format!("opc.tcp://{}:{}", ip, port);
        let result = discover_endpoints(&format!("{}:{}", ip, port), &endpoint, self.timeout).await?;

        let Some(first) = result.endpoints.first() else {
            let mut fp = Fingerprint::new(ip, Protocol::Opcua, endpoint, OPCUA_ACK_ONLY_CONFIDENCE)
                .with_evidence("ack_protocol_version", result.ack.protocol_version);
            if let Some(err) = result.error {
                fp = fp.with_evidence("discovery_error", err);
            }
            return Ok(Some(fp));
        };

        let app = &first.server;
        let build = result.build_info.unwrap_or_default();
        let vendor = build.manufacturer_name.clone().or_else(|| vendor_from_application(app));
        let model = build.product_name.clone().or_else(|| app.application_name.clone());
        let mut fp = Fingerprint::new(ip, Protocol::Opcua, endpoint, OPCUA_CONFIDENCE)
            .with_vendor(vendor)
            .with_model(model)
            .with_controller_version(build.software_version.clone())
            .with_evidence("endpoint_count", result.endpoints.len());
        if let Some(number) = build.build_number {
            fp = fp.with_evidence("build_number", number);
        }
        if let Some(err) = result.error {
            fp = fp.with_evidence("session_error", err);
        }
        if let Some(uri) = &app.application_uri {
            fp = fp.with_evidence("application_uri", uri.clone());
        }
        if let Some(uri) = &app.product_uri {
            fp = fp.with_evidence("product_uri", uri.clone());
        }
        Ok(Some(fp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::opcua::test_server::{self, Script};

    #[test]
    fn vendor_heuristic() {
        let app = ApplicationDescription {
            application_uri: Some("urn:SINUMERIK:840D".into()),
            ..ApplicationDescription::default()
        };
        assert_eq!(vendor_from_application(&app).as_deref(), Some("Siemens"));
        assert!(vendor_from_application(&ApplicationDescription::default()).is_none());
    }

    #[tokio::test]
    async fn fingerprints_scripted_server() {
        let addr = test_server::spawn("urn:fanuc:cnc", "urn:fanuc:product", "FANUC OPC UA", Script::Full, test_server::build_info_values()).await;
        let probe = OpcuaProbe::new(Duration::from_secs(2));
        let fp = probe.probe("127.0.0.1", addr.port()).await.unwrap().unwrap();
        assert_eq!(fp.protocol, Protocol::Opcua);
        assert!((fp.confidence - OPCUA_CONFIDENCE).abs() < f64::EPSILON);
        assert_eq!(fp.vendor.as_deref(), Some("FANUC"));
        assert_eq!(fp.model.as_deref(), Some("Series 31i-B"));
        assert_eq!(fp.controller_version.as_deref(), Some("G421/07"));
    }

    #[tokio::test]
    async fn falls_back_to_application_description() {
        let addr = test_server::spawn("urn:SINUMERIK:840D", "urn:siemens", "SINUMERIK 840D sl", Script::EndpointsOnly, Vec::new()).await;
        let probe = OpcuaProbe::new(Duration::from_secs(2));
        let fp = probe.probe("127.0.0.1", addr.port()).await.unwrap().unwrap();
        assert!((fp.confidence - OPCUA_CONFIDENCE).abs() < f64::EPSILON);
        assert_eq!(fp.vendor.as_deref(), Some("Siemens"));
        assert_eq!(fp.model.as_deref(), Some("SINUMERIK 840D sl"));
        assert!(fp.controller_version.is_none());
    }

    #[tokio::test]
    async fn ack_only_server_gets_lower_confidence() {
        let addr = test_server::spawn("", "", "", Script::AckOnly, Vec::new()).await;
        let probe = OpcuaProbe::new(Duration::from_secs(2));
        let fp = probe.probe("127.0.0.1", addr.port()).await.unwrap().unwrap();
        assert!((fp.confidence - OPCUA_ACK_ONLY_CONFIDENCE).abs() < f64::EPSILON);
    }
}
