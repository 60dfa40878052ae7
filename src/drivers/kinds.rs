//! The compiled driver set and the data profiles that parameterize it.
//!
//! A driver artifact never carries code: its entrypoint is a JSON
//! [`DriverProfile`] naming one of the kinds below plus its parameters.

use crate::domain::Protocol;
use crate::protocols::modbus::{ModbusClient, FC_READ_HOLDING, FC_READ_INPUT};
use crate::protocols::mtconnect::{observation_value, parse_current_items};
use crate::protocols::opcua::{pick_anonymous_policy, NodeId, OpcuaClient};
use crate::protocols::{focas, ProtocolError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("invalid endpoint '{0}'")]
    Endpoint(String),

    #[error("invalid driver profile: {0}")]
    Profile(String),

    #[error("controller returned no usable data")]
    NoData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverKind {
    Mtconnect,
    Opcua,
    ModbusTcp,
    Focas,
}

impl DriverKind {
    pub fn for_protocol(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Mtconnect => DriverKind::Mtconnect,
            Protocol::Opcua => DriverKind::Opcua,
            Protocol::Modbus => DriverKind::ModbusTcp,
            Protocol::FanucFocas => DriverKind::Focas,
        }
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            DriverKind::Mtconnect => Protocol::Mtconnect,
            DriverKind::Opcua => Protocol::Opcua,
            DriverKind::ModbusTcp => Protocol::Modbus,
            DriverKind::Focas => Protocol::FanucFocas,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterType {
    #[default]
    Holding,
    Input,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterSpec {
    pub address: u16,
    #[serde(rename = "type", default)]
    pub register_type: RegisterType,
    /// Multiplier applied to the raw register value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<f64>,
}

impl RegisterSpec {
    fn holding(address: u16) -> Self {
        Self { address, register_type: RegisterType::Holding, scale: None }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DriverProfile {
    Mtconnect {
        #[serde(default = "default_current_path")]
        current_path: String,
    },
    Opcua {
        /// Metric name → node id string, e.g. `ns=2;s=Execution`.
        #[serde(default = "default_node_map")]
        node_map: BTreeMap<String, String>,
    },
    ModbusTcp {
        #[serde(default = "default_unit_id")]
        unit_id: u8,
        #[serde(default = "default_register_map")]
        register_map: BTreeMap<String, RegisterSpec>,
    },
    Focas,
}

fn default_current_path() -> String {
    "/current".to_string()
}

fn default_unit_id() -> u8 {
    1
}

fn default_node_map() -> BTreeMap<String, String> {
    [
        ("execution_state", "ns=2;s=Execution"),
        ("spindle_speed", "ns=2;s=SpindleSpeed"),
        ("availability", "ns=2;s=Availability"),
        ("part_count", "ns=2;s=PartCount"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

fn default_register_map() -> BTreeMap<String, RegisterSpec> {
    [("execution_state", 100), ("availability", 101), ("spindle_speed", 102)]
        .into_iter()
        .map(|(k, addr)| (k.to_string(), RegisterSpec::holding(addr)))
        .collect()
}

impl DriverProfile {
    /// Profile used by built-in drivers and artifacts without parameters.
    pub fn default_for(kind: DriverKind) -> Self {
        match kind {
            DriverKind::Mtconnect => DriverProfile::Mtconnect { current_path: default_current_path() },
            DriverKind::Opcua => DriverProfile::Opcua { node_map: default_node_map() },
            DriverKind::ModbusTcp => DriverProfile::ModbusTcp {
                unit_id: default_unit_id(),
                register_map: default_register_map(),
            },
            DriverKind::Focas => DriverProfile::Focas,
        }
    }

    pub fn kind(&self) -> DriverKind {
        match self {
            DriverProfile::Mtconnect { .. } => DriverKind::Mtconnect,
            DriverProfile::Opcua { .. } => DriverKind::Opcua,
            DriverProfile::ModbusTcp { .. } => DriverKind::ModbusTcp,
            DriverProfile::Focas => DriverKind::Focas,
        }
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, DriverError> {
        serde_json::from_slice(bytes).map_err(|e| DriverError::Profile(e.to_string()))
    }
}

/// Metrics from one successful sample, plus the normalized execution state
/// when the controller reported one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub metrics: BTreeMap<String, Value>,
    pub status: Option<String>,
}

impl Sample {
    fn from_metrics(metrics: BTreeMap<String, Value>) -> Result<Self, DriverError> {
        if metrics.is_empty() {
            return Err(DriverError::NoData);
        }
        let status = metrics.get("execution_state").and_then(Value::as_str).map(str::to_string);
        Ok(Self { metrics, status })
    }
}

/// Map vendor execution states onto ACTIVE, READY, STOPPED, INTERRUPTED,
/// FEED_HOLD, ERROR or UNKNOWN.
pub fn normalize_execution_state(raw: &str) -> &'static str {
    match raw.trim().to_ascii_uppercase().as_str() {
        "ACTIVE" | "RUNNING" | "EXECUTING" => "ACTIVE",
        "READY" | "IDLE" => "READY",
        "STOPPED" => "STOPPED",
        "PAUSED" | "FEED_HOLD" => "FEED_HOLD",
        "INTERRUPTED" => "INTERRUPTED",
        "EMERGENCY_STOP" | "ALARM" => "ERROR",
        _ => "UNKNOWN",
    }
}

/// `scheme://host:port/path` → `host:port`, filling in `default_port`.
pub fn host_port(endpoint: &str, default_port: u16) -> Result<String, DriverError> {
    let rest = endpoint.split_once("://").map_or(endpoint, |(_, r)| r);
    let authority = rest.split('/').next().unwrap_or_default();
    if authority.is_empty() {
        return Err(DriverError::Endpoint(endpoint.to_string()));
    }
    if authority.contains(':') {
        Ok(authority.to_string())
    } else {
        Ok(format!("{}:{}", authority, default_port))
    }
}

/// Take one sample from the controller at `endpoint`.
pub async fn sample(profile: &DriverProfile, endpoint: &str, timeout: Duration) -> Result<Sample, DriverError> {
    match profile {
        DriverProfile::Mtconnect { current_path } => sample_mtconnect(endpoint, current_path, timeout).await,
        DriverProfile::Opcua { node_map } => sample_opcua(endpoint, node_map, timeout).await,
        DriverProfile::ModbusTcp { unit_id, register_map } => {
            sample_modbus(endpoint, *unit_id, register_map, timeout).await
        }
        DriverProfile::Focas => sample_focas(endpoint, timeout).await,
    }
}

async fn sample_mtconnect(endpoint: &str, path: &str, timeout: Duration) -> Result<Sample, DriverError> {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(ProtocolError::from)?;
    let url = format!("{}{}", endpoint.trim_end_matches('/'), path);
    let response = client.get(&url).send().await.map_err(ProtocolError::from)?;
    if !response.status().is_success() {
        return Err(ProtocolError::Remote(format!("HTTP {} from {}", response.status(), url)).into());
    }
    let body = response.text().await.map_err(ProtocolError::from)?;
    let items = parse_current_items(&body)
        .ok_or_else(|| ProtocolError::Malformed("not an MTConnect streams document".into()))?;

    let mut metrics = BTreeMap::new();
    for obs in items {
        let kind = obs.data_type.as_deref().unwrap_or_default();
        let actual = obs.sub_type.as_deref().map_or(true, |s| s == "ACTUAL");
        let unavailable = obs.text == "UNAVAILABLE";
        let (name, value) = match (obs.tag.as_str(), kind) {
            ("Execution", _) | (_, "EXECUTION") => {
                ("execution_state", Value::from(normalize_execution_state(&obs.text)))
            }
            ("Availability", _) | (_, "AVAILABILITY") => ("availability", Value::from(obs.text.to_ascii_uppercase())),
            _ if unavailable => continue,
            ("ControllerMode", _) | (_, "CONTROLLER_MODE") => {
                ("controller_mode", Value::from(obs.text.to_ascii_uppercase()))
            }
            ("RotaryVelocity" | "SpindleSpeed", _) | (_, "ROTARY_VELOCITY") if actual => {
                match obs.text.parse::<f64>() {
                    Ok(v) => ("spindle_speed", Value::from(v)),
                    Err(_) => continue,
                }
            }
            ("PathFeedrate", _) | (_, "PATH_FEEDRATE") if actual => match obs.text.parse::<f64>() {
                Ok(v) => ("path_feedrate", Value::from(v)),
                Err(_) => continue,
            },
            ("PartCount", _) | (_, "PART_COUNT") => match obs.text.parse::<i64>() {
                Ok(v) => ("part_count", Value::from(v)),
                Err(_) => continue,
            },
            ("Program", _) | (_, "PROGRAM") => ("program_name", Value::from(obs.text.clone())),
            _ => match &obs.name {
                // keep named items that have no canonical mapping
                Some(name) => {
                    metrics.entry(name.clone()).or_insert_with(|| observation_value(&obs.text));
                    continue;
                }
                None => continue,
            },
        };
        // the first observation of each canonical signal wins
        metrics.entry(name.to_string()).or_insert(value);
    }
    Sample::from_metrics(metrics)
}

async fn sample_opcua(endpoint: &str, node_map: &BTreeMap<String, String>, timeout: Duration) -> Result<Sample, DriverError> {
    let mut names = Vec::new();
    let mut nodes = Vec::new();
    for (name, node) in node_map {
        match node.parse::<NodeId>() {
            Ok(id) => {
                names.push(name.clone());
                nodes.push(id);
            }
            Err(e) => debug!(metric = %name, "skipping node: {}", e),
        }
    }
    if nodes.is_empty() {
        return Err(DriverError::Profile("node_map has no valid node ids".into()));
    }

    let addr = host_port(endpoint, Protocol::Opcua.default_port())?;
    let run = async {
        let mut client = OpcuaClient::connect(&addr, endpoint, timeout).await?.map_err(|(_, e)| e)?;
        let values = async {
            let endpoints = client.get_endpoints().await?;
            client.open_session(&pick_anonymous_policy(&endpoints)).await?;
            client.read_values(&nodes).await
        }
        .await;
        client.close().await;
        values
    };
    let values = tokio::time::timeout(timeout, run).await.map_err(|_| ProtocolError::Timeout)??;

    let mut metrics = BTreeMap::new();
    for (name, value) in names.into_iter().zip(values) {
        let Some(value) = value else {
            continue;
        };
        let value = if name == "execution_state" {
            let raw = match &value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            Value::from(normalize_execution_state(&raw))
        } else {
            value
        };
        metrics.insert(name, value);
    }
    Sample::from_metrics(metrics)
}

async fn sample_modbus(
    endpoint: &str,
    unit_id: u8,
    register_map: &BTreeMap<String, RegisterSpec>,
    timeout: Duration,
) -> Result<Sample, DriverError> {
    let addr = host_port(endpoint, Protocol::Modbus.default_port())?;
    let mut client = ModbusClient::connect(&addr, unit_id, timeout).await?;

    let mut metrics = BTreeMap::new();
    for (name, spec) in register_map {
        let function = match spec.register_type {
            RegisterType::Holding => FC_READ_HOLDING,
            RegisterType::Input => FC_READ_INPUT,
        };
        let raw = match client.read_registers(function, spec.address, 1).await {
            Ok(regs) => match regs.first() {
                Some(v) => *v,
                None => continue,
            },
            // exception responses only affect this register
            Err(ProtocolError::Remote(e)) => {
                debug!(metric = %name, address = spec.address, "modbus exception: {}", e);
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        let value = match name.as_str() {
            "execution_state" => Value::from(match raw {
                1 => "ACTIVE",
                2 => "READY",
                0 => "STOPPED",
                _ => "UNKNOWN",
            }),
            "availability" => Value::from(if raw > 0 { "AVAILABLE" } else { "UNAVAILABLE" }),
            _ => match spec.scale {
                Some(scale) => Value::from(raw as f64 * scale),
                None => Value::from(raw),
            },
        };
        metrics.insert(name.clone(), value);
    }
    Sample::from_metrics(metrics)
}

async fn sample_focas(endpoint: &str, timeout: Duration) -> Result<Sample, DriverError> {
    let addr = host_port(endpoint, Protocol::FanucFocas.default_port())?;
    focas::check_session(&addr, timeout).await?;
    let mut metrics = BTreeMap::new();
    metrics.insert("availability".to_string(), Value::from("AVAILABLE"));
    Sample::from_metrics(metrics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn execution_states_normalize() {
        assert_eq!(normalize_execution_state("running"), "ACTIVE");
        assert_eq!(normalize_execution_state(" IDLE "), "READY");
        assert_eq!(normalize_execution_state("PAUSED"), "FEED_HOLD");
        assert_eq!(normalize_execution_state("ALARM"), "ERROR");
        assert_eq!(normalize_execution_state(""), "UNKNOWN");
        assert_eq!(normalize_execution_state("warming_up"), "UNKNOWN");
    }

    #[test]
    fn endpoint_host_port() {
        assert_eq!(host_port("http://10.0.0.5:7878", 80).unwrap(), "10.0.0.5:7878");
        assert_eq!(host_port("modbus-tcp://10.0.0.6", 502).unwrap(), "10.0.0.6:502");
        assert_eq!(host_port("opc.tcp://plc:4840/UA/Server", 4840).unwrap(), "plc:4840");
        assert!(host_port("http://", 80).is_err());
    }

    #[test]
    fn profile_json_fills_defaults() {
        let p = DriverProfile::from_json(br#"{"kind": "modbus_tcp", "register_map": {"temp": {"address": 7, "type": "input", "scale": 0.1}}}"#)
            .unwrap();
        match p {
            DriverProfile::ModbusTcp { unit_id, register_map } => {
                assert_eq!(unit_id, 1);
                assert_eq!(register_map["temp"].register_type, RegisterType::Input);
            }
            other => panic!("unexpected profile {:?}", other),
        }
        let p = DriverProfile::from_json(br#"{"kind": "opcua"}"#).unwrap();
        assert_eq!(p, DriverProfile::default_for(DriverKind::Opcua));
        assert!(DriverProfile::from_json(br#"{"kind": "python"}"#).is_err());
    }

    #[tokio::test]
    async fn modbus_sample_maps_registers() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut req = [0u8; 12];
            while sock.read_exact(&mut req).await.is_ok() {
                let address = u16::from_be_bytes([req[8], req[9]]);
                let value: u16 = match address {
                    100 => 1,
                    101 => 1,
                    _ => 1500,
                };
                let mut resp = vec![req[0], req[1], 0, 0, 0, 5, req[6], req[7], 2];
                resp.extend_from_slice(&value.to_be_bytes());
                sock.write_all(&resp).await.unwrap();
            }
        });

        let profile = DriverProfile::default_for(DriverKind::ModbusTcp);
        let sample = sample(&profile, &format!("modbus-tcp://{}", addr), Duration::from_secs(1)).await.unwrap();
        assert_eq!(sample.metrics["execution_state"], json!("ACTIVE"));
        assert_eq!(sample.metrics["availability"], json!("AVAILABLE"));
        assert_eq!(sample.metrics["spindle_speed"], json!(1500));
        assert_eq!(sample.status.as_deref(), Some("ACTIVE"));
    }

    #[tokio::test]
    async fn opcua_sample_reads_node_map() {
        use crate::protocols::opcua::test_server::{spawn, Script};

        // node_map is ordered by metric name: availability, execution_state, part_count, spindle_speed
        let values = vec![json!("AVAILABLE"), json!("RUNNING"), json!(12), Value::Null];
        let addr = spawn("urn:x", "urn:y", "Sim", Script::Full, values).await;
        let profile = DriverProfile::default_for(DriverKind::Opcua);
        let sample = sample(&profile, &format!("opc.tcp://{}", addr), Duration::from_secs(2)).await.unwrap();
        assert_eq!(sample.metrics["execution_state"], json!("ACTIVE"));
        assert_eq!(sample.metrics["part_count"], json!(12));
        assert!(!sample.metrics.contains_key("spindle_speed"));
    }

    #[tokio::test]
    async fn focas_sample_reports_availability() {
        let addr = crate::protocols::focas::test_server::spawn().await;
        let sample = sample(&DriverProfile::Focas, &format!("focas://{}", addr), Duration::from_secs(1)).await.unwrap();
        assert_eq!(sample.metrics["availability"], json!("AVAILABLE"));
        assert!(sample.status.is_none());
    }
}
