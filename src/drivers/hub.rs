//! Driver hub manifest: fetching, parsing and entry lookup.

use crate::app::ports::HttpClientPort;
use crate::domain::{MachineEntry, MachineStatus, MatchRule, Protocol};
use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

fn default_channel() -> String {
    "stable".to_string()
}

fn default_entrypoint() -> String {
    "profile.json".to_string()
}

/// One published driver artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubEntry {
    pub driver_id: String,
    pub version: String,
    #[serde(default = "default_channel")]
    pub channel: String,
    pub sha256: String,
    pub url: String,
    /// Profile file inside the artifact archive.
    #[serde(default = "default_entrypoint")]
    pub entrypoint: String,
    #[serde(default)]
    pub supported_vendors: Vec<String>,
    #[serde(default)]
    pub protocol: Option<Protocol>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_rules: Vec<MatchRule>,
}

impl HubEntry {
    pub fn signature_url(&self) -> String {
        format!("{}.sig", self.url)
    }

    /// Case-insensitive: does any supported vendor contain `vendor`?
    pub fn supports_vendor(&self, vendor: &str) -> bool {
        let vendor = vendor.trim().to_lowercase();
        if vendor.is_empty() || vendor == "unknown" {
            return false;
        }
        self.supported_vendors.iter().any(|v| v.to_lowercase().contains(&vendor))
    }
}

/// Parse a hub manifest: `{"drivers": [...]}` or a bare array. Entries that
/// do not deserialize are skipped with a warning.
pub fn parse_manifest(bytes: &[u8]) -> Result<Vec<HubEntry>> {
    let doc: Value = serde_json::from_slice(bytes)?;
    let items = match doc {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("drivers") {
            Some(Value::Array(items)) => items,
            _ => return Err(GatewayError::Config("hub manifest has no 'drivers' array".into())),
        },
        _ => return Err(GatewayError::Config("hub manifest must be an object or array".into())),
    };

    let mut entries = Vec::with_capacity(items.len());
    for item in items {
        match serde_json::from_value::<HubEntry>(item) {
            Ok(entry) => entries.push(entry),
            Err(e) => warn!("HubClient: skipping malformed manifest entry: {}", e),
        }
    }
    Ok(entries)
}

/// Pick the entry to install for `driver_id`. An exact version wins, then the
/// configured channel; among equals the first listed entry wins.
pub fn find_entry<'a>(entries: &'a [HubEntry], driver_id: &str, channel: &str, version: Option<&str>) -> Option<&'a HubEntry> {
    let candidates: Vec<&HubEntry> = entries.iter().filter(|e| e.driver_id == driver_id).collect();
    if let Some(version) = version {
        let exact = candidates.iter().filter(|e| e.version == version);
        if let Some(found) = exact.clone().find(|e| e.channel == channel).or_else(|| exact.clone().next()) {
            return Some(found);
        }
    }
    candidates
        .iter()
        .find(|e| e.channel == channel)
        .or_else(|| candidates.first())
        .copied()
}

/// Drivers the registry needs: each machine's selected driver, or for
/// machines without one, the first entry that supports its vendor. Disabled
/// machines need nothing.
pub fn required_entries<'a>(entries: &'a [HubEntry], machines: &[MachineEntry], channel: &str) -> Vec<&'a HubEntry> {
    let mut wanted: Vec<(String, Option<String>)> = Vec::new();
    let mut seen = BTreeSet::new();

    for machine in machines.iter().filter(|m| m.status != MachineStatus::Disabled) {
        let want = match &machine.selected_driver_id {
            Some(id) => Some((id.clone(), machine.selected_driver_version.clone())),
            None => entries
                .iter()
                .find(|e| e.supports_vendor(&machine.vendor))
                .map(|e| (e.driver_id.clone(), None)),
        };
        if let Some(want) = want {
            if seen.insert(want.clone()) {
                wanted.push(want);
            }
        }
    }

    let mut out: Vec<&HubEntry> = Vec::new();
    for (id, version) in wanted {
        if let Some(entry) = find_entry(entries, &id, channel, version.as_deref()) {
            if !out.iter().any(|e| std::ptr::eq(*e, entry)) {
                out.push(entry);
            }
        }
    }
    out
}

/// Fetches the manifest and artifact bytes over an injected HTTP port.
#[derive(Clone)]
pub struct HubClient {
    http: Arc<dyn HttpClientPort>,
    manifest_url: String,
}

impl HubClient {
    pub fn new(http: Arc<dyn HttpClientPort>, manifest_url: impl Into<String>) -> Self {
        Self { http, manifest_url: manifest_url.into() }
    }

    pub async fn fetch_manifest(&self) -> Result<Vec<HubEntry>> {
        info!("HubClient: fetching manifest from {}", self.manifest_url);
        let bytes = self.get(&self.manifest_url).await?;
        let entries = parse_manifest(&bytes)?;
        info!("HubClient: manifest lists {} drivers", entries.len());
        Ok(entries)
    }

    /// GET `url`, failing on transport errors and non-2xx statuses.
    pub async fn get(&self, url: &str) -> Result<Vec<u8>> {
        let res = self
            .http
            .get(url)
            .await
            .map_err(|message| GatewayError::Remote { status: 0, message })?;
        if !(200..300).contains(&res.status) {
            return Err(GatewayError::Remote {
                status: res.status,
                message: format!("GET {}", url),
            });
        }
        Ok(res.bytes)
    }
}
