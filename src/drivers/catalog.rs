//! Driver catalog: built-in manifests plus entries merged from the hub.

use crate::domain::{DriverManifest, MatchRule, Protocol};
use crate::drivers::hub::HubEntry;
use crate::drivers::kinds::{DriverKind, DriverProfile};
use regex::{Regex, RegexBuilder};
use std::collections::BTreeMap;
use tracing::{info, warn};

/// A match rule with its patterns compiled case-insensitively.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub vendor: Option<Regex>,
    pub model: Option<Regex>,
    pub controller: Option<Regex>,
}

fn compile(driver: &str, field: &str, pattern: Option<&String>) -> (Option<Regex>, bool) {
    let Some(pattern) = pattern else {
        return (None, true);
    };
    match RegexBuilder::new(pattern).case_insensitive(true).build() {
        Ok(re) => (Some(re), true),
        Err(e) => {
            warn!(driver, field, pattern = %pattern, "Catalog: skipping invalid match pattern: {}", e);
            (None, false)
        }
    }
}

impl CompiledRule {
    /// Compile one rule. A rule with any invalid pattern is dropped whole so
    /// it cannot match more broadly than written.
    fn from_rule(driver: &str, rule: &MatchRule) -> Option<Self> {
        let (vendor, ok_v) = compile(driver, "vendor", rule.vendor.as_ref());
        let (model, ok_m) = compile(driver, "model", rule.model.as_ref());
        let (controller, ok_c) = compile(driver, "controller", rule.controller.as_ref());
        (ok_v && ok_m && ok_c).then_some(Self { vendor, model, controller })
    }
}

#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub manifest: DriverManifest,
    pub profile: DriverProfile,
    pub rules: Vec<CompiledRule>,
    /// True when the manifest declared criteria. Such an entry never falls
    /// back to protocol-only matching, even if all its rules were invalid.
    pub has_rules: bool,
    pub builtin: bool,
}

impl CatalogEntry {
    fn new(manifest: DriverManifest, profile: DriverProfile, builtin: bool) -> Self {
        // `{}` rules carry no criteria
        let declared: Vec<&MatchRule> = manifest.match_rules.iter().filter(|r| !r.is_empty()).collect();
        let rules = declared
            .iter()
            .filter_map(|r| CompiledRule::from_rule(&manifest.name, r))
            .collect();
        Self { has_rules: !declared.is_empty(), rules, manifest, profile, builtin }
    }
}

/// Ordered driver catalog. Registration order is the selector's tie-break.
#[derive(Debug, Clone, Default)]
pub struct DriverCatalog {
    entries: Vec<CatalogEntry>,
}

impl DriverCatalog {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Drivers shipped with the gateway.
    pub fn builtin() -> Self {
        let mut catalog = Self::empty();
        let builtins = [
            (
                DriverManifest::new("haas_mtconnect", "1.0.0", Protocol::Mtconnect)
                    .with_description("Haas NGC machines via MTConnect")
                    .with_rules(vec![MatchRule::vendor("HAAS.*")]),
                DriverKind::Mtconnect,
            ),
            (
                DriverManifest::new("mazak-mtconnect", "1.0.0", Protocol::Mtconnect)
                    .with_description("Mazak machines via MTConnect")
                    .with_rules(vec![MatchRule::vendor("MAZAK.*")]),
                DriverKind::Mtconnect,
            ),
            (
                DriverManifest::new("siemens_opcua", "1.0.0", Protocol::Opcua)
                    .with_description("Siemens 840D sl / 828D via OPC UA")
                    .with_rules(vec![MatchRule::vendor("SIEMENS.*")]),
                DriverKind::Opcua,
            ),
            (
                DriverManifest::new("fanuc-focas", "1.0.0", Protocol::FanucFocas)
                    .with_description("FANUC i-Series via FOCAS2")
                    .with_rules(vec![MatchRule::vendor("FANUC.*")]),
                DriverKind::Focas,
            ),
            (
                DriverManifest::new("generic-mtconnect", "1.0.0", Protocol::Mtconnect)
                    .with_description("Generic MTConnect agent"),
                DriverKind::Mtconnect,
            ),
            (
                DriverManifest::new("generic-opcua", "1.0.0", Protocol::Opcua)
                    .with_description("Generic OPC UA server"),
                DriverKind::Opcua,
            ),
            (
                DriverManifest::new("generic-modbus", "1.0.0", Protocol::Modbus)
                    .with_description("Generic Modbus/TCP register map"),
                DriverKind::ModbusTcp,
            ),
        ];
        for (manifest, kind) in builtins {
            catalog.entries.push(CatalogEntry::new(manifest, DriverProfile::default_for(kind), true));
        }
        catalog
    }

    /// Append a driver. A later registration under an existing name replaces
    /// it in place, keeping its position.
    pub fn register(&mut self, manifest: DriverManifest, profile: DriverProfile) {
        let entry = CatalogEntry::new(manifest, profile, false);
        match self.entries.iter_mut().find(|e| e.manifest.name == entry.manifest.name) {
            Some(existing) => {
                let builtin = existing.builtin;
                *existing = CatalogEntry { builtin, ..entry };
            }
            None => self.entries.push(entry),
        }
    }

    /// Merge hub manifest entries. Known drivers take the hub's version and
    /// digest; `supported_vendors` become vendor rules. Unknown drivers need a
    /// protocol to be registered.
    pub fn merge_hub_entries(&mut self, entries: &[HubEntry]) {
        let mut merged = 0;
        for hub in entries {
            let existing = self.get(&hub.driver_id).map(|e| (e.manifest.clone(), e.profile.clone()));
            let (mut manifest, profile) = match (existing, hub.protocol) {
                (Some(found), _) => found,
                (None, Some(protocol)) => (
                    DriverManifest::new(&hub.driver_id, &hub.version, protocol),
                    DriverProfile::default_for(DriverKind::for_protocol(protocol)),
                ),
                (None, None) => {
                    warn!(driver = %hub.driver_id, "Catalog: hub entry has no protocol, skipping");
                    continue;
                }
            };
            if hub.protocol.is_some_and(|p| p != manifest.protocol) {
                warn!(driver = %hub.driver_id, "Catalog: hub protocol disagrees with catalog, skipping");
                continue;
            }

            manifest.version = hub.version.clone();
            manifest.checksum = Some(hub.sha256.clone());
            if let Some(description) = &hub.description {
                manifest.description = description.clone();
            }
            let mut rules: Vec<MatchRule> = hub
                .supported_vendors
                .iter()
                .map(|v| MatchRule::vendor(regex::escape(v)))
                .collect();
            rules.extend(hub.match_rules.iter().cloned());
            if !rules.is_empty() {
                manifest.match_rules = rules;
            }
            self.register(manifest, profile);
            merged += 1;
        }
        info!("Catalog: merged {} hub entries ({} drivers total)", merged, self.entries.len());
    }

    pub fn get(&self, name: &str) -> Option<&CatalogEntry> {
        self.entries.iter().find(|e| e.manifest.name == name)
    }

    /// Published checksums by driver name, for use after the lock is released.
    pub fn checksums(&self) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .filter_map(|e| e.manifest.checksum.clone().map(|c| (e.manifest.name.clone(), c)))
            .collect()
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn manifests(&self) -> impl Iterator<Item = &DriverManifest> {
        self.entries.iter().map(|e| &e.manifest)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
