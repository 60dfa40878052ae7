//! Remote configuration: discovery policy, manual enrollments and
//! enrollment decisions pushed from the management service.

use crate::app::ports::HttpClientPort;
use crate::discovery::policy::DiscoveryPolicy;
use crate::domain::{now_timestamp, EventRecord, RecordContext, Severity, GATEWAY_MACHINE_ID};
use crate::error::{GatewayError, Result};
use crate::registry::MachineRegistry;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ManualEnrollment {
    #[serde(default)]
    pub machine_id: Option<String>,
    #[serde(alias = "ip")]
    pub machine_ip: String,
    #[serde(default)]
    pub vendor: Option<String>,
    #[serde(default, alias = "preferred_driver")]
    pub preferred_driver_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub discovery_policy: Option<DiscoveryPolicy>,
    pub pending_manual_enrollments: Vec<ManualEnrollment>,
    pub enrolled_machines: Vec<String>,
    pub disabled_machines: Vec<String>,
}

impl RemoteConfig {
    fn keys(&self) -> Vec<&'static str> {
        let mut keys = Vec::new();
        if self.discovery_policy.is_some() {
            keys.push("discovery_policy");
        }
        if !self.pending_manual_enrollments.is_empty() {
            keys.push("pending_manual_enrollments");
        }
        if !self.enrolled_machines.is_empty() {
            keys.push("enrolled_machines");
        }
        if !self.disabled_machines.is_empty() {
            keys.push("disabled_machines");
        }
        keys
    }
}

#[derive(Debug, Deserialize)]
struct ConfigResponse {
    #[serde(default)]
    changed: bool,
    #[serde(default)]
    config_version: u64,
    #[serde(default)]
    config: RemoteConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppliedConfig {
    pub policy_changed: bool,
    pub manual_added: usize,
    pub enrolled: usize,
    pub disabled: usize,
}

/// Apply a remote config to the registry and the live policy.
pub fn apply_config(config: &RemoteConfig, registry: &mut MachineRegistry, policy: &mut DiscoveryPolicy) -> AppliedConfig {
    let mut applied = AppliedConfig::default();

    if let Some(new_policy) = &config.discovery_policy {
        if new_policy != policy {
            *policy = new_policy.clone();
            policy.log_decision();
            applied.policy_changed = true;
        }
    }

    for manual in &config.pending_manual_enrollments {
        let ip = manual.machine_ip.trim();
        if ip.is_empty() {
            warn!("Config: manual enrollment without an ip, skipping");
            continue;
        }
        let machine_id = manual.machine_id.as_deref().unwrap_or(ip);
        let already = registry
            .get(machine_id)
            .is_some_and(|e| e.ip == ip && e.status.is_enrolled());
        if already {
            continue;
        }
        registry.add_manual(machine_id, ip, manual.vendor.as_deref(), manual.preferred_driver_id.as_deref());
        applied.manual_added += 1;
    }

    for id in &config.enrolled_machines {
        if registry.get(id).is_some_and(|e| !e.status.is_enrolled()) && registry.enroll(id) {
            applied.enrolled += 1;
        }
    }
    for id in &config.disabled_machines {
        if registry.disable(id) {
            applied.disabled += 1;
        }
    }
    applied
}

pub fn config_changed_event(ctx: &RecordContext, version: u64, config: &RemoteConfig) -> EventRecord {
    EventRecord::new(
        ctx,
        GATEWAY_MACHINE_ID,
        &now_timestamp(),
        "CONFIG_CHANGED",
        Severity::Info,
        json!({ "new_version": version, "config_keys": config.keys() }),
    )
}

/// Polls `{mgmt}/get_config` for versioned config changes.
pub struct ConfigPoller {
    http: Arc<dyn HttpClientPort>,
    url: String,
    device_id: String,
    version: u64,
}

impl ConfigPoller {
    pub fn new(http: Arc<dyn HttpClientPort>, mgmt_base_url: &str, device_id: impl Into<String>) -> Self {
        Self {
            http,
            url: format!("{}/get_config", mgmt_base_url.trim_end_matches('/')),
            device_id: device_id.into(),
            version: 0,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Ask for changes since the last applied version. `Ok(None)` when
    /// nothing changed.
    pub async fn poll(&mut self) -> Result<Option<(u64, RemoteConfig)>> {
        let body = json!({ "device_id": self.device_id, "current_config_version": self.version });
        let res = self
            .http
            .post_json(&self.url, &[], &body)
            .await
            .map_err(|message| GatewayError::Remote { status: 0, message })?;
        if !res.is_success() {
            debug!(status = res.status, "Config: no update");
            return Err(GatewayError::Remote { status: res.status, message: format!("POST {}", self.url) });
        }
        let parsed: ConfigResponse = serde_json::from_slice(&res.bytes)?;
        if !parsed.changed {
            return Ok(None);
        }
        info!(version = parsed.config_version, "Config: update received");
        self.version = parsed.config_version;
        Ok(Some((parsed.config_version, parsed.config)))
    }
}
