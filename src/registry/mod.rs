//! Machine registry: the JSON file shared by discovery, sync and polling.
//!
//! The file is a JSON array of [`MachineEntry`]. Writes go to a temp file in
//! the same directory which is then renamed over the original.

use crate::domain::{Candidate, DriverMatch, Fingerprint, MachineEntry, MachineStatus, Provenance};
use crate::error::{GatewayError, Result};
use crate::idempotency::compute_machine_id;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistrySummary {
    pub total: usize,
    pub by_status: BTreeMap<String, usize>,
}

#[derive(Debug, Clone)]
pub struct MachineRegistry {
    path: PathBuf,
    entries: Vec<MachineEntry>,
}

fn status_name(status: MachineStatus) -> String {
    serde_json::to_value(status)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| format!("{:?}", status))
}

/// Parse registry JSON. Accepts the current array form and the legacy object
/// form keyed by ip. Entries that do not deserialize are skipped.
fn parse_entries(doc: Value) -> Vec<MachineEntry> {
    let items: Vec<Value> = match doc {
        Value::Array(items) => items,
        Value::Object(map) => {
            info!("Registry: migrating legacy ip-keyed registry");
            map.into_iter()
                .filter_map(|(ip, mut entry)| {
                    let obj = entry.as_object_mut()?;
                    obj.entry("ip").or_insert_with(|| Value::from(ip.clone()));
                    obj.entry("machine_id").or_insert_with(|| Value::from(ip));
                    obj.entry("status").or_insert_with(|| Value::from("DISCOVERED"));
                    obj.entry("last_seen").or_insert_with(|| Value::from(Utc::now().to_rfc3339()));
                    Some(entry)
                })
                .collect()
        }
        _ => Vec::new(),
    };

    let mut entries: Vec<MachineEntry> = Vec::with_capacity(items.len());
    for item in items {
        match serde_json::from_value::<MachineEntry>(item) {
            Ok(entry) if entries.iter().any(|e| e.ip == entry.ip) => {
                warn!(ip = %entry.ip, "Registry: dropping duplicate entry");
            }
            Ok(entry) => entries.push(entry),
            Err(e) => warn!("Registry: skipping malformed entry: {}", e),
        }
    }
    entries
}

impl MachineRegistry {
    /// Load the registry at `path`. A missing or unreadable file yields an
    /// empty registry.
    pub fn load<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let entries = match fs::read(&path) {
            Ok(raw) => match serde_json::from_slice::<Value>(&raw) {
                Ok(doc) => parse_entries(doc),
                Err(e) => {
                    warn!("Registry: {} is not valid JSON, starting empty: {}", path.display(), e);
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        };
        debug!("Registry: loaded {} machines from {}", entries.len(), path.display());
        Self { path, entries }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically replace the registry file.
    pub fn save(&self) -> Result<()> {
        let dir = self.path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
        fs::create_dir_all(dir)?;
        let file_name = self
            .path
            .file_name()
            .ok_or_else(|| GatewayError::Config(format!("invalid registry path {}", self.path.display())))?;
        let tmp = dir.join(format!(".{}.{}.tmp", file_name.to_string_lossy(), uuid::Uuid::new_v4()));
        fs::write(&tmp, serde_json::to_vec_pretty(&self.entries)?)?;
        if let Err(e) = fs::rename(&tmp, &self.path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    pub fn entries(&self) -> &[MachineEntry] {
        &self.entries
    }

    pub fn get(&self, machine_id: &str) -> Option<&MachineEntry> {
        self.entries.iter().find(|e| e.machine_id == machine_id)
    }

    pub fn get_by_ip(&self, ip: &str) -> Option<&MachineEntry> {
        self.entries.iter().find(|e| e.ip == ip)
    }

    /// Machines eligible for polling: enrolled with a selected driver.
    pub fn pollable(&self) -> impl Iterator<Item = &MachineEntry> {
        self.entries
            .iter()
            .filter(|e| e.status.is_enrolled() && e.selected_driver_id.is_some())
    }

    /// Record a network sighting. Unknown ips become DISCOVERED entries.
    pub fn observe_candidate(&mut self, candidate: &Candidate) {
        match self.entries.iter_mut().find(|e| e.ip == candidate.ip) {
            Some(entry) => entry.last_seen = Utc::now(),
            None => {
                info!(ip = %candidate.ip, source = %candidate.source, "Registry: new machine discovered");
                self.entries.push(MachineEntry::discovered(&candidate.ip, candidate.source));
            }
        }
    }

    /// Fold a fingerprint (and the selector's choice) into the entry for its
    /// ip. Discovered entries are re-keyed to a content hash once the
    /// fingerprint identifies the machine; manual entries keep their id and
    /// their pinned driver.
    pub fn apply_fingerprint(&mut self, fp: &Fingerprint, selection: Option<&DriverMatch>) -> &MachineEntry {
        let strong_id = compute_machine_id(&fp.ip, fp.serial.as_deref(), fp.vendor.as_deref(), fp.model.as_deref());

        // the same physical machine may have been seen at another ip
        if let Some(id) = &strong_id {
            if let Some(moved) = self.entries.iter().position(|e| &e.machine_id == id && e.ip != fp.ip) {
                info!(machine_id = %id, from = %self.entries[moved].ip, to = %fp.ip, "Registry: machine changed ip");
                let stale = self.entries.iter().position(|e| e.ip == fp.ip && e.provenance != Provenance::Manual);
                if let Some(stale) = stale {
                    self.entries.remove(stale);
                }
                if self.entries.iter().all(|e| e.ip != fp.ip) {
                    if let Some(entry) = self.entries.iter_mut().find(|e| &e.machine_id == id) {
                        entry.ip = fp.ip.clone();
                    }
                }
            }
        }

        let idx = match self.entries.iter().position(|e| e.ip == fp.ip) {
            Some(idx) => idx,
            None => {
                self.entries.push(MachineEntry::discovered(&fp.ip, crate::domain::CandidateSource::Active));
                self.entries.len() - 1
            }
        };
        let entry = &mut self.entries[idx];

        if entry.provenance == Provenance::Discovered {
            if let Some(id) = &strong_id {
                if &entry.machine_id != id {
                    info!(ip = %fp.ip, old = %entry.machine_id, new = %id, "Registry: promoted machine identity");
                    entry.machine_id = id.clone();
                }
            }
        }

        if let Some(vendor) = &fp.vendor {
            entry.vendor = vendor.clone();
        }
        entry.protocol = Some(fp.protocol);
        entry.endpoint = Some(fp.endpoint.clone());
        entry.fingerprint = Some(fp.clone());
        entry.last_seen = Utc::now();

        let pinned = entry.provenance == Provenance::Manual && entry.selected_driver_id.is_some();
        if let Some(selection) = selection {
            if !pinned {
                entry.selected_driver_id = Some(selection.manifest.name.clone());
                entry.selected_driver_version = Some(selection.manifest.version.clone());
            }
        }

        if matches!(entry.status, MachineStatus::Discovered | MachineStatus::Reachable) {
            entry.status = if entry.selected_driver_id.is_some() {
                MachineStatus::ReadyToEnroll
            } else {
                MachineStatus::Reachable
            };
        }
        &self.entries[idx]
    }

    /// Add or replace a manually enrolled machine. Any discovered entry at the
    /// same ip is absorbed.
    pub fn add_manual(&mut self, machine_id: &str, ip: &str, vendor: Option<&str>, driver_id: Option<&str>) -> &MachineEntry {
        let mut entry = MachineEntry::manual(machine_id, ip, vendor, driver_id);
        if let Some(prev) = self.entries.iter().find(|e| e.ip == ip) {
            entry.fingerprint = prev.fingerprint.clone();
            entry.protocol = prev.protocol;
            entry.endpoint = prev.endpoint.clone();
            if vendor.is_none() {
                entry.vendor = prev.vendor.clone();
            }
            if driver_id.is_none() {
                entry.selected_driver_id = prev.selected_driver_id.clone();
                entry.selected_driver_version = prev.selected_driver_version.clone();
            }
        }
        self.entries.retain(|e| e.ip != ip && e.machine_id != machine_id);
        info!(machine_id, ip, "Registry: manual enrollment");
        self.entries.push(entry);
        let last = self.entries.len() - 1;
        &self.entries[last]
    }

    fn set_status(&mut self, machine_id: &str, status: MachineStatus) -> bool {
        match self.entries.iter_mut().find(|e| e.machine_id == machine_id) {
            Some(entry) => {
                if entry.status != status {
                    info!(machine_id, from = %status_name(entry.status), to = %status_name(status), "Registry: status change");
                    entry.status = status;
                }
                true
            }
            None => false,
        }
    }

    /// Mark a machine ENROLLED. Manual entries stay MANUAL_ENROLLED.
    pub fn enroll(&mut self, machine_id: &str) -> bool {
        let manual = self.get(machine_id).is_some_and(|e| e.provenance == Provenance::Manual);
        let status = if manual { MachineStatus::ManualEnrolled } else { MachineStatus::Enrolled };
        self.set_status(machine_id, status)
    }

    pub fn disable(&mut self, machine_id: &str) -> bool {
        self.set_status(machine_id, MachineStatus::Disabled)
    }

    /// Enroll every READY_TO_ENROLL machine whose driver is usable. Returns
    /// the enrolled ids.
    pub fn enroll_ready(&mut self, driver_usable: impl Fn(&str) -> bool) -> Vec<String> {
        let ready: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.status == MachineStatus::ReadyToEnroll)
            .filter(|e| e.selected_driver_id.as_deref().is_some_and(&driver_usable))
            .map(|e| e.machine_id.clone())
            .collect();
        for id in &ready {
            self.enroll(id);
        }
        ready
    }

    pub fn summary(&self) -> RegistrySummary {
        let mut by_status = BTreeMap::new();
        for entry in &self.entries {
            *by_status.entry(status_name(entry.status)).or_insert(0) += 1;
        }
        RegistrySummary { total: self.entries.len(), by_status }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CandidateSource, DriverManifest, Protocol};

    fn fp(ip: &str, serial: Option<&str>) -> Fingerprint {
        Fingerprint::new(ip, Protocol::Mtconnect, format!("http://{}:7878", ip), 0.95)
            .with_vendor(Some("Haas".into()))
            .with_model(Some("VF-2".into()))
            .with_serial(serial.map(str::to_string))
    }

    fn selection() -> DriverMatch {
        DriverMatch {
            manifest: DriverManifest::new("haas_mtconnect", "1.0.0", Protocol::Mtconnect),
            score: 1.0,
            reasons: vec![],
        }
    }

    #[test]
    fn fingerprint_promotes_identity_and_status() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = MachineRegistry::load(dir.path().join("reg.json"));
        reg.observe_candidate(&Candidate::passive("10.0.0.5"));
        assert_eq!(reg.get("10.0.0.5").unwrap().status, MachineStatus::Discovered);

        let entry = reg.apply_fingerprint(&fp("10.0.0.5", Some("SN-1")), Some(&selection())).clone();
        assert_ne!(entry.machine_id, "10.0.0.5");
        assert_eq!(Some(entry.machine_id.clone()), compute_machine_id("10.0.0.5", Some("SN-1"), None, None));
        assert_eq!(entry.status, MachineStatus::ReadyToEnroll);
        assert_eq!(entry.selected_driver_id.as_deref(), Some("haas_mtconnect"));
        assert_eq!(entry.vendor, "Haas");
        assert_eq!(reg.entries().len(), 1);
    }

    #[test]
    fn machine_moving_ip_keeps_one_entry() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = MachineRegistry::load(dir.path().join("reg.json"));
        let id = reg.apply_fingerprint(&fp("10.0.0.5", Some("SN-1")), None).machine_id.clone();
        reg.observe_candidate(&Candidate::passive("10.0.0.9"));
        reg.apply_fingerprint(&fp("10.0.0.9", Some("SN-1")), None);
        assert_eq!(reg.entries().len(), 1);
        assert_eq!(reg.get(&id).unwrap().ip, "10.0.0.9");
    }

    #[test]
    fn manual_entries_keep_id_and_driver() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = MachineRegistry::load(dir.path().join("reg.json"));
        reg.observe_candidate(&Candidate::passive("10.0.0.7"));
        reg.add_manual("CNC-07", "10.0.0.7", None, Some("generic-mtconnect"));
        assert_eq!(reg.entries().len(), 1);

        let entry = reg.apply_fingerprint(&fp("10.0.0.7", Some("SN-7")), Some(&selection())).clone();
        assert_eq!(entry.machine_id, "CNC-07");
        assert_eq!(entry.selected_driver_id.as_deref(), Some("generic-mtconnect"));
        assert_eq!(entry.status, MachineStatus::ManualEnrolled);
        assert_eq!(reg.pollable().count(), 1);
    }

    #[test]
    fn save_and_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("reg.json");
        let mut reg = MachineRegistry::load(&path);
        reg.apply_fingerprint(&fp("10.0.0.5", None), Some(&selection()));
        let id = reg.entries()[0].machine_id.clone();
        assert!(reg.enroll(&id));
        reg.save().unwrap();

        let again = MachineRegistry::load(&path);
        assert_eq!(again.entries(), reg.entries());
        assert_eq!(again.summary().by_status.get("ENROLLED"), Some(&1));
        let leftovers = fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn legacy_and_malformed_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reg.json");
        fs::write(&path, r#"{"10.0.0.1": {"vendor": "Mazak"}, "10.0.0.2": "junk"}"#).unwrap();
        let reg = MachineRegistry::load(&path);
        assert_eq!(reg.entries().len(), 1);
        assert_eq!(reg.get("10.0.0.1").unwrap().vendor, "Mazak");

        fs::write(&path, "not json").unwrap();
        assert!(MachineRegistry::load(&path).entries().is_empty());
    }

    #[test]
    fn enroll_ready_respects_driver_availability() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = MachineRegistry::load(dir.path().join("reg.json"));
        reg.apply_fingerprint(&fp("10.0.0.5", Some("A")), Some(&selection()));
        reg.observe_candidate(&Candidate { ip: "10.0.0.6".into(), ..Candidate::passive("10.0.0.6") });
        assert!(reg.enroll_ready(|_| false).is_empty());
        let enrolled = reg.enroll_ready(|id| id == "haas_mtconnect");
        assert_eq!(enrolled.len(), 1);
        assert_eq!(reg.get(&enrolled[0]).unwrap().status, MachineStatus::Enrolled);
        assert_eq!(reg.get("10.0.0.6").unwrap().source, CandidateSource::Passive.to_string());
    }
}
