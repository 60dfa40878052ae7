//! Domain data shapes shared across discovery, drivers, runtime and uplink.

use crate::idempotency::{compute_event_id, compute_record_id};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Industrial protocols the gateway can identify and drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Mtconnect,
    #[serde(alias = "opc_ua")]
    Opcua,
    Modbus,
    #[serde(alias = "focas")]
    FanucFocas,
}

impl Protocol {
    pub const ALL: [Protocol; 4] =
        [Protocol::Mtconnect, Protocol::Opcua, Protocol::Modbus, Protocol::FanucFocas];

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Mtconnect => "mtconnect",
            Protocol::Opcua => "opcua",
            Protocol::Modbus => "modbus",
            Protocol::FanucFocas => "fanuc_focas",
        }
    }

    /// Well-known TCP port for the protocol.
    pub fn default_port(&self) -> u16 {
        match self {
            Protocol::Mtconnect => 7878,
            Protocol::Opcua => 4840,
            Protocol::Modbus => 502,
            Protocol::FanucFocas => 8193,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mtconnect" => Ok(Protocol::Mtconnect),
            "opcua" | "opc_ua" | "opc-ua" => Ok(Protocol::Opcua),
            "modbus" | "modbus_tcp" => Ok(Protocol::Modbus),
            "fanuc_focas" | "focas" => Ok(Protocol::FanucFocas),
            other => Err(format!("unknown protocol '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateSource {
    Passive,
    Active,
}

impl fmt::Display for CandidateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CandidateSource::Passive => f.write_str("passive"),
            CandidateSource::Active => f.write_str("active"),
        }
    }
}

/// Protocols worth trying on one open port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolHint {
    pub port: u16,
    pub protocols: Vec<Protocol>,
}

/// An address observed during discovery, not yet protocol-identified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub ip: String,
    pub source: CandidateSource,
    pub open_ports: Vec<u16>,
    pub hints: Vec<ProtocolHint>,
    pub confidence: f64,
}

impl Candidate {
    pub fn passive(ip: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            source: CandidateSource::Passive,
            open_ports: Vec::new(),
            hints: Vec::new(),
            confidence: 0.5,
        }
    }
}

/// Result of a successful protocol handshake probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub ip: String,
    pub protocol: Protocol,
    pub vendor: Option<String>,
    pub model: Option<String>,
    pub serial: Option<String>,
    pub controller_version: Option<String>,
    pub endpoint: String,
    pub confidence: f64,
    #[serde(default)]
    pub evidence: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl Fingerprint {
    pub fn new(ip: impl Into<String>, protocol: Protocol, endpoint: impl Into<String>, confidence: f64) -> Self {
        Self {
            ip: ip.into(),
            protocol,
            vendor: None,
            model: None,
            serial: None,
            controller_version: None,
            endpoint: endpoint.into(),
            confidence: confidence.clamp(0.0, 1.0),
            evidence: Map::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_vendor(mut self, vendor: Option<String>) -> Self {
        self.vendor = non_empty(vendor);
        self
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = non_empty(model);
        self
    }

    pub fn with_serial(mut self, serial: Option<String>) -> Self {
        self.serial = non_empty(serial);
        self
    }

    pub fn with_controller_version(mut self, version: Option<String>) -> Self {
        self.controller_version = non_empty(version);
        self
    }

    pub fn with_evidence(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.evidence.insert(key.to_string(), value.into());
        self
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// One match rule: regexes over vendor / model / controller version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<String>,
}

impl MatchRule {
    pub fn vendor(pattern: impl Into<String>) -> Self {
        Self { vendor: Some(pattern.into()), ..Self::default() }
    }

    pub fn is_empty(&self) -> bool {
        self.vendor.is_none() && self.model.is_none() && self.controller.is_none()
    }
}

/// Declarative driver description used for selection and secure activation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverManifest {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    pub protocol: Protocol,
    #[serde(default)]
    pub match_rules: Vec<MatchRule>,
    /// Expected SHA-256 of the driver artifact.
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub signature: Option<String>,
}

impl DriverManifest {
    pub fn new(name: impl Into<String>, version: impl Into<String>, protocol: Protocol) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: String::new(),
            protocol,
            match_rules: Vec::new(),
            checksum: None,
            signature: None,
        }
    }

    pub fn with_rules(mut self, rules: Vec<MatchRule>) -> Self {
        self.match_rules = rules;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriverMatch {
    pub manifest: DriverManifest,
    pub score: f64,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MachineStatus {
    Discovered,
    Reachable,
    ReadyToEnroll,
    Enrolled,
    ManualEnrolled,
    Disabled,
}

impl MachineStatus {
    pub fn is_enrolled(&self) -> bool {
        matches!(self, MachineStatus::Enrolled | MachineStatus::ManualEnrolled)
    }
}

/// Where a registry entry came from. Manual entries keep their id forever.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    #[default]
    Discovered,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineEntry {
    pub machine_id: String,
    pub ip: String,
    #[serde(default = "unknown_vendor")]
    pub vendor: String,
    pub status: MachineStatus,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub provenance: Provenance,
    #[serde(default)]
    pub protocol: Option<Protocol>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub selected_driver_id: Option<String>,
    #[serde(default)]
    pub selected_driver_version: Option<String>,
    #[serde(default)]
    pub fingerprint: Option<Fingerprint>,
    pub last_seen: DateTime<Utc>,
}

fn unknown_vendor() -> String {
    "UNKNOWN".to_string()
}

impl MachineEntry {
    pub fn discovered(ip: &str, source: CandidateSource) -> Self {
        Self {
            machine_id: ip.to_string(),
            ip: ip.to_string(),
            vendor: unknown_vendor(),
            status: MachineStatus::Discovered,
            source: source.to_string(),
            provenance: Provenance::Discovered,
            protocol: None,
            endpoint: None,
            selected_driver_id: None,
            selected_driver_version: None,
            fingerprint: None,
            last_seen: Utc::now(),
        }
    }

    pub fn manual(machine_id: &str, ip: &str, vendor: Option<&str>, preferred_driver: Option<&str>) -> Self {
        Self {
            machine_id: machine_id.to_string(),
            ip: ip.to_string(),
            vendor: vendor.map(str::to_string).unwrap_or_else(unknown_vendor),
            status: MachineStatus::ManualEnrolled,
            source: "manual_portal".to_string(),
            provenance: Provenance::Manual,
            protocol: None,
            endpoint: None,
            selected_driver_id: preferred_driver.map(str::to_string),
            selected_driver_version: None,
            fingerprint: None,
            last_seen: Utc::now(),
        }
    }
}

/// Identity fields stamped onto every outbound record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordContext {
    pub tenant_id: String,
    pub site_id: String,
    pub device_id: String,
}

pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub record_id: String,
    pub tenant_id: String,
    pub site_id: String,
    pub device_id: String,
    pub machine_id: String,
    pub timestamp: String,
    pub metrics: BTreeMap<String, Value>,
    #[serde(default)]
    pub status: Option<String>,
}

impl TelemetryRecord {
    pub fn new(
        ctx: &RecordContext,
        machine_id: &str,
        timestamp: &str,
        metrics: BTreeMap<String, Value>,
        status: Option<String>,
    ) -> Self {
        let record_id = compute_record_id(&ctx.tenant_id, &ctx.site_id, machine_id, timestamp, &metrics);
        Self {
            record_id,
            tenant_id: ctx.tenant_id.clone(),
            site_id: ctx.site_id.clone(),
            device_id: ctx.device_id.clone(),
            machine_id: machine_id.to_string(),
            timestamp: timestamp.to_string(),
            metrics,
            status,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub record_id: String,
    pub tenant_id: String,
    pub site_id: String,
    pub machine_id: String,
    pub timestamp: String,
    pub event_type: String,
    pub severity: Severity,
    pub details: Value,
}

/// Machine id used for events raised by the gateway itself.
pub const GATEWAY_MACHINE_ID: &str = "EDGE_GATEWAY";

impl EventRecord {
    pub fn new(
        ctx: &RecordContext,
        machine_id: &str,
        timestamp: &str,
        event_type: &str,
        severity: Severity,
        details: Value,
    ) -> Self {
        let record_id = compute_event_id(&ctx.tenant_id, &ctx.site_id, machine_id, timestamp, event_type, &details);
        Self {
            record_id,
            tenant_id: ctx.tenant_id.clone(),
            site_id: ctx.site_id.clone(),
            machine_id: machine_id.to_string(),
            timestamp: timestamp.to_string(),
            event_type: event_type.to_string(),
            severity,
            details,
        }
    }
}

/// Everything that travels through the durable buffer to the collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutboundRecord {
    Telemetry(TelemetryRecord),
    Event(EventRecord),
}

impl OutboundRecord {
    pub fn idempotency_id(&self) -> &str {
        match self {
            OutboundRecord::Telemetry(r) => &r.record_id,
            OutboundRecord::Event(e) => &e.record_id,
        }
    }
}

impl From<TelemetryRecord> for OutboundRecord {
    fn from(r: TelemetryRecord) -> Self {
        OutboundRecord::Telemetry(r)
    }
}

impl From<EventRecord> for OutboundRecord {
    fn from(e: EventRecord) -> Self {
        OutboundRecord::Event(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn protocol_aliases_parse() {
        assert_eq!("opc_ua".parse::<Protocol>().unwrap(), Protocol::Opcua);
        assert_eq!("focas".parse::<Protocol>().unwrap(), Protocol::FanucFocas);
        let p: Protocol = serde_json::from_value(json!("opc_ua")).unwrap();
        assert_eq!(p, Protocol::Opcua);
        assert!("profibus".parse::<Protocol>().is_err());
    }

    #[test]
    fn machine_status_uses_upper_snake_case() {
        let v = serde_json::to_value(MachineStatus::ReadyToEnroll).unwrap();
        assert_eq!(v, json!("READY_TO_ENROLL"));
    }

    #[test]
    fn outbound_record_is_tagged() {
        let ctx = RecordContext {
            tenant_id: "t".into(),
            site_id: "s".into(),
            device_id: "d".into(),
        };
        let event = EventRecord::new(&ctx, GATEWAY_MACHINE_ID, "2026-01-01T00:00:00.000Z", "UPDATE_BLOCKED", Severity::Critical, json!({}));
        let v = serde_json::to_value(OutboundRecord::from(event)).unwrap();
        assert_eq!(v["kind"], "event");
        assert_eq!(v["severity"], "CRITICAL");
    }
}
