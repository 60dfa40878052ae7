use crate::discovery::policy::DiscoveryPolicy;
use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "edge-gateway.toml";
pub const CONFIG_PATH_ENV: &str = "EDGE_GATEWAY_CONFIG";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AgentConfig {
    pub gateway: GatewayConfig,
    pub paths: PathsConfig,
    pub discovery: DiscoveryConfig,
    pub poller: PollerConfig,
    pub uplink: UplinkConfig,
    pub drivers: DriversConfig,
    pub control: ControlConfig,
    pub status: StatusConfig,
}

/// Identity of this gateway as issued by the enrollment service.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub tenant_id: String,
    pub site_id: String,
    pub device_id: String,
    /// Opaque credential attached as a bearer token to cloud requests.
    pub bearer_token: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            tenant_id: "unknown_tenant".to_string(),
            site_id: "unknown_site".to_string(),
            device_id: "edge-gateway".to_string(),
            bearer_token: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PathsConfig {
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self { data_dir: PathBuf::from("data"), log_dir: PathBuf::from("logs") }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub interval_secs: u64,
    /// Scanned when the policy carries no allowed subnets.
    pub default_subnet: String,
    pub probe_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub scan_concurrency: u32,
    /// Promote machines to ENROLLED once their driver is verified and active.
    pub auto_enroll: bool,
    pub policy: DiscoveryPolicy,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            default_subnet: "192.168.1.0/24".to_string(),
            probe_timeout_ms: 2_000,
            connect_timeout_ms: 500,
            scan_concurrency: 64,
            auto_enroll: false,
            policy: DiscoveryPolicy::default(),
        }
    }
}

impl DiscoveryConfig {
    /// Probe timeout clamped to the 1-3s handshake window.
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms.clamp(1_000, 3_000))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.max(50))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PollerConfig {
    pub interval_secs: u64,
    pub timeout_ms: u64,
    pub backoff_cap_secs: u64,
    pub circuit_breaker_threshold: u32,
    pub max_concurrent_workers: usize,
    /// Program spawned for isolated driver calls; defaults to this executable.
    pub worker_program: Option<PathBuf>,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            timeout_ms: 5_000,
            backoff_cap_secs: 300,
            circuit_breaker_threshold: 5,
            max_concurrent_workers: 16,
            worker_program: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UplinkConfig {
    pub ingest_url: String,
    pub batch_size: usize,
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub backoff_cap_secs: u64,
}

impl Default for UplinkConfig {
    fn default() -> Self {
        Self {
            ingest_url: "http://localhost:8080/ingest".to_string(),
            batch_size: 50,
            interval_secs: 5,
            timeout_secs: 10,
            backoff_cap_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DriversConfig {
    pub hub_manifest_url: Option<String>,
    pub public_key_path: PathBuf,
    pub channel: String,
    pub download_timeout_secs: u64,
}

impl Default for DriversConfig {
    fn default() -> Self {
        Self {
            hub_manifest_url: None,
            public_key_path: PathBuf::from("keys/driver_hub.pub"),
            channel: "stable".to_string(),
            download_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ControlConfig {
    pub mgmt_base_url: Option<String>,
    pub config_poll_interval_secs: u64,
    pub heartbeat_interval_secs: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self { mgmt_base_url: None, config_poll_interval_secs: 300, heartbeat_interval_secs: 30 }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StatusConfig {
    pub enabled: bool,
    pub bind: String,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self { enabled: true, bind: "127.0.0.1:9898".to_string() }
    }
}

impl AgentConfig {
    /// Load configuration from `path`, `$EDGE_GATEWAY_CONFIG`, or
    /// `edge-gateway.toml`, in that order. A missing default file yields the
    /// built-in defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let explicit = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from));
        let config_path = explicit.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

        let mut config = if config_path.exists() {
            let content = fs::read_to_string(&config_path).map_err(|e| {
                GatewayError::Config(format!(
                    "Failed to read config file '{}': {}",
                    config_path.display(),
                    e
                ))
            })?;
            Self::from_toml_str(&content)?
        } else if explicit.is_some() {
            return Err(GatewayError::Config(format!(
                "Config file '{}' does not exist",
                config_path.display()
            )));
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: AgentConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.uplink.batch_size == 0 {
            return Err(GatewayError::Config("uplink.batch_size must be > 0".to_string()));
        }
        if self.poller.timeout_ms == 0 {
            return Err(GatewayError::Config("poller.timeout_ms must be > 0".to_string()));
        }
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("EDGE_INGEST_URL") {
            self.uplink.ingest_url = v;
        }
        if let Ok(v) = std::env::var("EDGE_DRIVER_HUB_URL") {
            self.drivers.hub_manifest_url = Some(v);
        }
        if let Ok(v) = std::env::var("EDGE_MGMT_URL") {
            self.control.mgmt_base_url = Some(v);
        }
        if let Ok(v) = std::env::var("EDGE_BEARER_TOKEN") {
            self.gateway.bearer_token = Some(v);
        }
        if let Ok(v) = std::env::var("EDGE_TENANT_ID") {
            self.gateway.tenant_id = v;
        }
        if let Ok(v) = std::env::var("EDGE_SITE_ID") {
            self.gateway.site_id = v;
        }
        if let Ok(v) = std::env::var("EDGE_DEVICE_ID") {
            self.gateway.device_id = v;
        }
    }

    pub fn registry_path(&self) -> PathBuf {
        self.paths.data_dir.join("machine_registry.json")
    }

    pub fn buffer_path(&self) -> PathBuf {
        self.paths.data_dir.join("buffer.db")
    }

    pub fn drivers_active_dir(&self) -> PathBuf {
        self.paths.data_dir.join("drivers").join("active")
    }

    pub fn drivers_cache_dir(&self) -> PathBuf {
        self.paths.data_dir.join("drivers").join("cache")
    }

    pub fn drivers_backup_dir(&self) -> PathBuf {
        self.paths.data_dir.join("drivers").join("backup")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = AgentConfig::from_toml_str("").unwrap();
        assert_eq!(config.uplink.batch_size, 50);
        assert_eq!(config.poller.circuit_breaker_threshold, 5);
        assert_eq!(config.discovery.policy.active_rate_limit_pps, 10);
    }

    #[test]
    fn sections_override_defaults() {
        let config = AgentConfig::from_toml_str(
            r#"
            [gateway]
            tenant_id = "t1"
            site_id = "s1"

            [uplink]
            ingest_url = "https://collector.example/ingest"
            batch_size = 10

            [discovery.policy]
            mode = "passive"
            allowed_subnets = ["10.0.0.0/24"]
            "#,
        )
        .unwrap();
        assert_eq!(config.gateway.tenant_id, "t1");
        assert_eq!(config.uplink.batch_size, 10);
        assert!(!config.discovery.policy.is_active_allowed());
        assert_eq!(config.discovery.policy.allowed_subnets, vec!["10.0.0.0/24".to_string()]);
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let err = AgentConfig::from_toml_str("[uplink]\nbatch_size = 0\n").unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
    }

    #[test]
    fn probe_timeout_is_clamped() {
        let mut config = DiscoveryConfig::default();
        config.probe_timeout_ms = 10_000;
        assert_eq!(config.probe_timeout(), Duration::from_secs(3));
        config.probe_timeout_ms = 10;
        assert_eq!(config.probe_timeout(), Duration::from_secs(1));
    }
}
