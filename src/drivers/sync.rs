//! Secure driver sync: download, verify, stage and activate driver artifacts.
//!
//! Activation is fail-closed. An artifact becomes `current` only after its
//! Ed25519 signature and SHA-256 digest both verify; any verification failure
//! leaves the previously active version in place and raises a CRITICAL
//! `UPDATE_BLOCKED` event through the durable buffer.

use crate::buffer::DurableBuffer;
use crate::domain::{now_timestamp, EventRecord, MachineEntry, RecordContext, Severity, GATEWAY_MACHINE_ID};
use crate::drivers::catalog::DriverCatalog;
use crate::drivers::hub::{find_entry, required_entries, HubClient, HubEntry};
use crate::drivers::kinds::DriverProfile;
use crate::drivers::verify::{sha256_hex, verify_checksum, ArtifactVerifier, VerifyError};
use crate::error::{GatewayError, Result};
use crate::metrics::DriverMetrics;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

const METADATA_FILE: &str = "metadata.json";
const CURRENT_DIR: &str = "current";

const MAX_ARCHIVE_FILES: usize = 256;
const MAX_FILE_BYTES: u64 = 16 * 1024 * 1024;
const MAX_TOTAL_BYTES: u64 = 64 * 1024 * 1024;

/// Result of syncing one driver. Never an error: callers log and move on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncOutcome {
    AlreadyActive { version: String },
    Activated { version: String },
    Rejected { reason: String },
    Unavailable { error: String },
    Failed { error: String },
}

/// Persisted next to an active driver's files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveMetadata {
    pub driver_id: String,
    pub version: String,
    pub sha256: String,
    pub channel: String,
    pub entrypoint: String,
    pub activated_at: String,
}

fn current_dir(active_dir: &Path, driver_id: &str) -> PathBuf {
    active_dir.join(driver_id).join(CURRENT_DIR)
}

/// Metadata of the active version of `driver_id`, if any.
pub fn read_active(active_dir: &Path, driver_id: &str) -> Option<ActiveMetadata> {
    let path = current_dir(active_dir, driver_id).join(METADATA_FILE);
    let raw = fs::read(&path).ok()?;
    match serde_json::from_slice(&raw) {
        Ok(meta) => Some(meta),
        Err(e) => {
            warn!(driver = driver_id, "DriverSync: unreadable {}: {}", path.display(), e);
            None
        }
    }
}

/// Profile of the active version of `driver_id`. `Ok(None)` when nothing is
/// installed.
pub fn load_active_profile(active_dir: &Path, driver_id: &str) -> Result<Option<DriverProfile>> {
    let Some(meta) = read_active(active_dir, driver_id) else {
        return Ok(None);
    };
    let raw = fs::read(current_dir(active_dir, driver_id).join(&meta.entrypoint))?;
    DriverProfile::from_json(&raw)
        .map(Some)
        .map_err(|e| GatewayError::Config(format!("driver {}: {}", driver_id, e)))
}

#[derive(Debug, Clone)]
pub struct SyncDirs {
    pub active_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub backup_dir: PathBuf,
}

pub struct DriverSync {
    hub: HubClient,
    dirs: SyncDirs,
    public_key_path: PathBuf,
    channel: String,
    buffer: Arc<DurableBuffer>,
    ctx: RecordContext,
}

enum Rejection {
    Verify(VerifyError),
    InvalidArtifact(String),
}

impl Rejection {
    fn reason(&self) -> &'static str {
        match self {
            Rejection::Verify(e) => e.reason(),
            Rejection::InvalidArtifact(_) => "invalid_artifact",
        }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::Verify(e) => write!(f, "{}", e),
            Rejection::InvalidArtifact(msg) => write!(f, "{}", msg),
        }
    }
}

impl DriverSync {
    pub fn new(
        hub: HubClient,
        dirs: SyncDirs,
        public_key_path: PathBuf,
        channel: impl Into<String>,
        buffer: Arc<DurableBuffer>,
        ctx: RecordContext,
    ) -> Result<Self> {
        fs::create_dir_all(&dirs.active_dir)?;
        fs::create_dir_all(&dirs.cache_dir)?;
        fs::create_dir_all(&dirs.backup_dir)?;
        Ok(Self { hub, dirs, public_key_path, channel: channel.into(), buffer, ctx })
    }

    pub fn active_dir(&self) -> &Path {
        &self.dirs.active_dir
    }

    /// Sync every driver the registry needs from an already fetched
    /// manifest. Returns one outcome per driver.
    pub async fn sync_required(
        &self,
        entries: &[HubEntry],
        machines: &[MachineEntry],
        checksums: &BTreeMap<String, String>,
    ) -> Vec<(String, SyncOutcome)> {
        let mut outcomes = Vec::new();
        for entry in required_entries(entries, machines, &self.channel) {
            let checksum = checksums.get(&entry.driver_id).map(String::as_str);
            let outcome = self.sync_entry(entry, checksum).await;
            outcomes.push((entry.driver_id.clone(), outcome));
        }
        outcomes
    }

    /// Fetch the manifest and sync a single driver.
    pub async fn sync_driver(&self, driver_id: &str, version: Option<&str>, catalog: &DriverCatalog) -> SyncOutcome {
        let entries = match self.hub.fetch_manifest().await {
            Ok(entries) => entries,
            Err(e) => return self.unavailable(driver_id, e.to_string()),
        };
        let Some(entry) = find_entry(&entries, driver_id, &self.channel, version) else {
            return self.unavailable(driver_id, format!("{} is not listed in the hub manifest", driver_id));
        };
        let checksum = catalog.get(driver_id).and_then(|e| e.manifest.checksum.clone());
        self.sync_entry(entry, checksum.as_deref()).await
    }

    /// Bring `entry` to the active slot. `catalog_checksum`, when known, must
    /// agree with the artifact as well.
    pub async fn sync_entry(&self, entry: &HubEntry, catalog_checksum: Option<&str>) -> SyncOutcome {
        let driver_id = entry.driver_id.as_str();

        if let Some(active) = read_active(&self.dirs.active_dir, driver_id) {
            if active.version == entry.version && active.sha256.eq_ignore_ascii_case(&entry.sha256) {
                return SyncOutcome::AlreadyActive { version: active.version };
            }
        }

        let (artifact, signature) = match self.download(entry).await {
            Ok(pair) => pair,
            Err(e) => return self.unavailable(driver_id, e.to_string()),
        };

        if let Err(rejection) = self.verify(entry, &artifact, &signature, catalog_checksum) {
            return self.reject(entry, rejection);
        }

        match self.activate(entry, &artifact) {
            Ok(()) => {
                info!(driver = driver_id, version = %entry.version, "DriverSync: activated");
                DriverMetrics::record_activation();
                SyncOutcome::Activated { version: entry.version.clone() }
            }
            Err(ActivateError::Invalid(msg)) => self.reject(entry, Rejection::InvalidArtifact(msg)),
            Err(ActivateError::Io(e)) => {
                error!(driver = driver_id, "DriverSync: activation failed: {}", e);
                SyncOutcome::Failed { error: e.to_string() }
            }
        }
    }

    async fn download(&self, entry: &HubEntry) -> Result<(Vec<u8>, Vec<u8>)> {
        let cached = self.dirs.cache_dir.join(format!("{}_{}.zip", entry.driver_id, entry.version));
        let artifact = match fs::read(&cached) {
            Ok(bytes) if sha256_hex(&bytes).eq_ignore_ascii_case(entry.sha256.trim()) => {
                info!(driver = %entry.driver_id, "DriverSync: using cached artifact");
                bytes
            }
            _ => {
                info!(driver = %entry.driver_id, version = %entry.version, "DriverSync: downloading artifact");
                let bytes = self.hub.get(&entry.url).await?;
                fs::write(&cached, &bytes)?;
                bytes
            }
        };
        let signature = self.hub.get(&entry.signature_url()).await?;
        fs::write(cached.with_extension("zip.sig"), &signature)?;
        Ok((artifact, signature))
    }

    fn verify(&self, entry: &HubEntry, artifact: &[u8], signature: &[u8], catalog_checksum: Option<&str>) -> std::result::Result<(), Rejection> {
        let verifier = ArtifactVerifier::from_file(&self.public_key_path).map_err(Rejection::Verify)?;
        verifier.verify_signature(artifact, signature).map_err(Rejection::Verify)?;
        verify_checksum(artifact, &entry.sha256).map_err(Rejection::Verify)?;
        if let Some(expected) = catalog_checksum {
            verify_checksum(artifact, expected).map_err(Rejection::Verify)?;
        }
        Ok(())
    }

    fn reject(&self, entry: &HubEntry, rejection: Rejection) -> SyncOutcome {
        let reason = rejection.reason();
        error!(
            driver = %entry.driver_id,
            version = %entry.version,
            reason,
            "DriverSync: activation blocked: {}",
            rejection
        );
        DriverMetrics::record_rejection();

        let event = EventRecord::new(
            &self.ctx,
            GATEWAY_MACHINE_ID,
            &now_timestamp(),
            "UPDATE_BLOCKED",
            Severity::Critical,
            json!({ "driver_id": entry.driver_id, "version": entry.version, "reason": reason }),
        );
        if let Err(e) = self.buffer.enqueue(&event.into()) {
            error!(driver = %entry.driver_id, "DriverSync: failed to enqueue UPDATE_BLOCKED: {}", e);
        }
        SyncOutcome::Rejected { reason: reason.to_string() }
    }

    fn unavailable(&self, driver_id: &str, error: String) -> SyncOutcome {
        warn!(driver = driver_id, "DriverSync: unavailable: {}", error);
        DriverMetrics::record_sync_unavailable();
        SyncOutcome::Unavailable { error }
    }

    /// Stage the verified artifact and swap it into `current`, moving the
    /// previous version to the backup dir.
    fn activate(&self, entry: &HubEntry, artifact: &[u8]) -> std::result::Result<(), ActivateError> {
        let driver_dir = self.dirs.active_dir.join(&entry.driver_id);
        fs::create_dir_all(&driver_dir)?;
        let staging = driver_dir.join(format!(".staging-{}", uuid::Uuid::new_v4()));

        let staged = stage(&staging, entry, artifact);
        if staged.is_err() {
            let _ = fs::remove_dir_all(&staging);
            return staged;
        }

        let current = driver_dir.join(CURRENT_DIR);
        let backup = if current.exists() {
            let target = self.backup_path(&entry.driver_id);
            fs::rename(&current, &target)?;
            info!(driver = %entry.driver_id, "DriverSync: previous version moved to {}", target.display());
            Some(target)
        } else {
            None
        };

        if let Err(e) = fs::rename(&staging, &current) {
            if let Some(backup) = backup {
                let _ = fs::rename(&backup, &current);
            }
            let _ = fs::remove_dir_all(&staging);
            return Err(e.into());
        }
        Ok(())
    }

    fn backup_path(&self, driver_id: &str) -> PathBuf {
        let stamp = chrono::Local::now().format("%Y%m%d%H%M%S");
        let base = self.dirs.backup_dir.join(format!("{}_{}", driver_id, stamp));
        let mut candidate = base.clone();
        let mut n = 1;
        while candidate.exists() {
            candidate = PathBuf::from(format!("{}_{}", base.display(), n));
            n += 1;
        }
        candidate
    }
}

enum ActivateError {
    Invalid(String),
    Io(std::io::Error),
}

impl From<std::io::Error> for ActivateError {
    fn from(e: std::io::Error) -> Self {
        ActivateError::Io(e)
    }
}

/// Extract `artifact` into `staging`, check the entrypoint parses as a
/// profile and write `metadata.json`.
fn stage(staging: &Path, entry: &HubEntry, artifact: &[u8]) -> std::result::Result<(), ActivateError> {
    let invalid = |msg: String| ActivateError::Invalid(msg);
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(artifact))
        .map_err(|e| invalid(format!("invalid zip archive: {}", e)))?;
    if archive.len() > MAX_ARCHIVE_FILES {
        return Err(invalid(format!("archive has {} entries (max {})", archive.len(), MAX_ARCHIVE_FILES)));
    }
    fs::create_dir_all(staging)?;

    let mut total = 0u64;
    for i in 0..archive.len() {
        let mut file = archive
            .by_index(i)
            .map_err(|e| invalid(format!("unreadable entry {}: {}", i, e)))?;
        let name = file.name().to_string();
        let relative = match file.enclosed_name() {
            Some(path) if is_plain_relative(path) => path.to_path_buf(),
            _ => return Err(invalid(format!("unsafe path in archive: {}", name))),
        };
        if file.size() > MAX_FILE_BYTES {
            return Err(invalid(format!("{} is too large ({} bytes)", name, file.size())));
        }
        total += file.size();
        if total > MAX_TOTAL_BYTES {
            return Err(invalid("archive expands beyond the size limit".to_string()));
        }

        let target = staging.join(&relative);
        if file.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut bytes = Vec::with_capacity(file.size() as usize);
        (&mut file).take(MAX_FILE_BYTES + 1).read_to_end(&mut bytes)?;
        if bytes.len() as u64 > MAX_FILE_BYTES {
            return Err(invalid(format!("{} is too large", name)));
        }
        fs::write(&target, &bytes)?;
    }

    let entrypoint = staging.join(&entry.entrypoint);
    let raw = fs::read(&entrypoint).map_err(|_| invalid(format!("entrypoint {} missing", entry.entrypoint)))?;
    DriverProfile::from_json(&raw).map_err(|e| invalid(format!("entrypoint {}: {}", entry.entrypoint, e)))?;

    let meta = ActiveMetadata {
        driver_id: entry.driver_id.clone(),
        version: entry.version.clone(),
        sha256: entry.sha256.to_lowercase(),
        channel: entry.channel.clone(),
        entrypoint: entry.entrypoint.clone(),
        activated_at: now_timestamp(),
    };
    let json = serde_json::to_vec_pretty(&meta).map_err(|e| invalid(e.to_string()))?;
    fs::write(staging.join(METADATA_FILE), json)?;
    Ok(())
}

fn is_plain_relative(path: &Path) -> bool {
    path.components().all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::ports::{HttpClientPort, HttpResponse};
    use crate::domain::OutboundRecord;
    use async_trait::async_trait;
    use ed25519_dalek::{Signer, SigningKey};
    use serde_json::Value;
    use std::collections::HashMap;
    use std::io::Write;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeHub {
        files: Mutex<HashMap<String, Vec<u8>>>,
    }

    impl FakeHub {
        fn put(&self, url: &str, bytes: Vec<u8>) {
            self.files.lock().unwrap().insert(url.to_string(), bytes);
        }
    }

    #[async_trait]
    impl HttpClientPort for FakeHub {
        async fn get(&self, url: &str) -> std::result::Result<HttpResponse, String> {
            let files = self.files.lock().unwrap();
            let (status, bytes) = match files.get(url) {
                Some(bytes) => (200, bytes.clone()),
                None => (404, Vec::new()),
            };
            Ok(HttpResponse {
                status,
                content_length: bytes.len() as u64,
                bytes,
                content_type: "application/octet-stream".into(),
                etag: None,
                last_modified: None,
            })
        }

        async fn post_json(&self, _url: &str, _headers: &[(&str, String)], _body: &Value) -> std::result::Result<HttpResponse, String> {
            Err("not supported".into())
        }
    }

    const MANIFEST_URL: &str = "http://hub/manifest.json";

    fn zip_of(files: &[(&str, &str)]) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
            let options = zip::write::FileOptions::default();
            for (name, content) in files {
                zip.start_file(*name, options).unwrap();
                zip.write_all(content.as_bytes()).unwrap();
            }
            zip.finish().unwrap();
        }
        buf
    }

    fn profile_zip() -> Vec<u8> {
        zip_of(&[("profile.json", r#"{"kind": "mtconnect", "current_path": "/current"}"#)])
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        hub: Arc<FakeHub>,
        key: SigningKey,
        sync: DriverSync,
        buffer: Arc<DurableBuffer>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let key = SigningKey::from_bytes(&[9u8; 32]);
        let key_path = dir.path().join("hub.pub");
        fs::write(&key_path, hex::encode(key.verifying_key().as_bytes())).unwrap();

        let hub = Arc::new(FakeHub::default());
        let buffer = Arc::new(DurableBuffer::open(dir.path().join("buffer.db")).unwrap());
        let dirs = SyncDirs {
            active_dir: dir.path().join("active"),
            cache_dir: dir.path().join("cache"),
            backup_dir: dir.path().join("backup"),
        };
        let ctx = RecordContext { tenant_id: "t".into(), site_id: "s".into(), device_id: "gw".into() };
        let sync = DriverSync::new(
            HubClient::new(hub.clone(), MANIFEST_URL),
            dirs,
            key_path,
            "stable",
            buffer.clone(),
            ctx,
        )
        .unwrap();
        Fixture { _dir: dir, hub, key, sync, buffer }
    }

    /// Publish `served` under version `version`, signed over `signed`, with
    /// `sha256` in the manifest.
    fn publish(f: &Fixture, version: &str, served: &[u8], signed: &[u8], sha256: &str) -> HubEntry {
        let url = format!("http://hub/haas-{}.zip", version);
        f.hub.put(&url, served.to_vec());
        f.hub.put(&format!("{}.sig", url), f.key.sign(signed).to_bytes().to_vec());
        let entry = HubEntry {
            driver_id: "haas".into(),
            version: version.into(),
            channel: "stable".into(),
            sha256: sha256.into(),
            url,
            entrypoint: "profile.json".into(),
            supported_vendors: vec!["Haas".into()],
            protocol: None,
            description: None,
            match_rules: Vec::new(),
        };
        f.hub.put(MANIFEST_URL, serde_json::to_vec(&json!({ "drivers": [entry] })).unwrap());
        entry
    }

    fn blocked_reasons(buffer: &DurableBuffer) -> Vec<String> {
        buffer
            .reserve_batch(100)
            .unwrap()
            .into_iter()
            .filter_map(|r| serde_json::from_value::<OutboundRecord>(r.payload).ok())
            .filter_map(|r| match r {
                OutboundRecord::Event(e) if e.event_type == "UPDATE_BLOCKED" && e.severity == Severity::Critical => {
                    e.details["reason"].as_str().map(str::to_string)
                }
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn activates_verified_artifact_once() {
        let f = fixture();
        let artifact = profile_zip();
        let entry = publish(&f, "1.0.0", &artifact, &artifact, &sha256_hex(&artifact));

        let outcome = f.sync.sync_driver("haas", None, &DriverCatalog::empty()).await;
        assert_eq!(outcome, SyncOutcome::Activated { version: "1.0.0".into() });

        let meta = read_active(f.sync.active_dir(), "haas").unwrap();
        assert_eq!(meta.version, "1.0.0");
        assert_eq!(meta.sha256, entry.sha256);
        let profile = load_active_profile(f.sync.active_dir(), "haas").unwrap().unwrap();
        assert_eq!(profile, DriverProfile::Mtconnect { current_path: "/current".into() });

        let again = f.sync.sync_entry(&entry, None).await;
        assert_eq!(again, SyncOutcome::AlreadyActive { version: "1.0.0".into() });
    }

    #[tokio::test]
    async fn upgrade_moves_previous_version_to_backup() {
        let f = fixture();
        let v1 = profile_zip();
        let e1 = publish(&f, "1.0.0", &v1, &v1, &sha256_hex(&v1));
        f.sync.sync_entry(&e1, None).await;

        let v2 = zip_of(&[("profile.json", r#"{"kind": "mtconnect", "current_path": "/mill/current"}"#)]);
        let e2 = publish(&f, "2.0.0", &v2, &v2, &sha256_hex(&v2));
        assert_eq!(f.sync.sync_entry(&e2, None).await, SyncOutcome::Activated { version: "2.0.0".into() });

        assert_eq!(read_active(f.sync.active_dir(), "haas").unwrap().version, "2.0.0");
        let backups: Vec<_> = fs::read_dir(&f.sync.dirs.backup_dir).unwrap().collect();
        assert_eq!(backups.len(), 1);
    }

    #[tokio::test]
    async fn tampered_artifact_is_blocked_and_previous_stays_active() {
        let f = fixture();
        let good = profile_zip();
        let e1 = publish(&f, "1.0.0", &good, &good, &sha256_hex(&good));
        f.sync.sync_entry(&e1, None).await;

        let tampered = zip_of(&[("profile.json", r#"{"kind": "focas"}"#)]);
        let e2 = publish(&f, "1.1.0", &tampered, &good, &sha256_hex(&tampered));
        let outcome = f.sync.sync_entry(&e2, None).await;
        assert_eq!(outcome, SyncOutcome::Rejected { reason: "signature_mismatch".into() });

        assert_eq!(read_active(f.sync.active_dir(), "haas").unwrap().version, "1.0.0");
        assert_eq!(blocked_reasons(&f.buffer), vec!["signature_mismatch".to_string()]);
    }

    #[tokio::test]
    async fn digest_mismatch_is_blocked() {
        let f = fixture();
        let artifact = profile_zip();
        let entry = publish(&f, "1.0.0", &artifact, &artifact, &"0".repeat(64));
        assert_eq!(
            f.sync.sync_entry(&entry, None).await,
            SyncOutcome::Rejected { reason: "checksum_mismatch".into() }
        );

        let entry = publish(&f, "1.0.1", &artifact, &artifact, &sha256_hex(&artifact));
        assert_eq!(
            f.sync.sync_entry(&entry, Some("deadbeef")).await,
            SyncOutcome::Rejected { reason: "checksum_mismatch".into() }
        );
        assert!(read_active(f.sync.active_dir(), "haas").is_none());
        assert_eq!(blocked_reasons(&f.buffer).len(), 2);
    }

    #[tokio::test]
    async fn required_drivers_sync_from_supplied_entries() {
        let f = fixture();
        let artifact = profile_zip();
        let entry = publish(&f, "1.0.0", &artifact, &artifact, &sha256_hex(&artifact));
        // only the artifacts remain on the hub
        f.hub.files.lock().unwrap().remove(MANIFEST_URL);

        let mut machine = MachineEntry::discovered("10.0.0.1", crate::domain::CandidateSource::Active);
        machine.selected_driver_id = Some("haas".into());
        let machines = vec![machine];

        let mut checksums = BTreeMap::new();
        checksums.insert("haas".to_string(), "deadbeef".to_string());
        let outcomes = f.sync.sync_required(std::slice::from_ref(&entry), &machines, &checksums).await;
        assert_eq!(outcomes, vec![("haas".to_string(), SyncOutcome::Rejected { reason: "checksum_mismatch".into() })]);

        let outcomes = f.sync.sync_required(&[entry], &machines, &BTreeMap::new()).await;
        assert_eq!(outcomes, vec![("haas".to_string(), SyncOutcome::Activated { version: "1.0.0".into() })]);
    }

    #[tokio::test]
    async fn traversal_and_missing_entrypoint_are_invalid() {
        let f = fixture();
        let evil = zip_of(&[("../escape.json", "{}"), ("profile.json", r#"{"kind": "focas"}"#)]);
        let entry = publish(&f, "1.0.0", &evil, &evil, &sha256_hex(&evil));
        assert_eq!(f.sync.sync_entry(&entry, None).await, SyncOutcome::Rejected { reason: "invalid_artifact".into() });

        let empty = zip_of(&[("readme.txt", "no profile")]);
        let entry = publish(&f, "1.0.1", &empty, &empty, &sha256_hex(&empty));
        assert_eq!(f.sync.sync_entry(&entry, None).await, SyncOutcome::Rejected { reason: "invalid_artifact".into() });
        assert!(read_active(f.sync.active_dir(), "haas").is_none());
    }

    #[tokio::test]
    async fn missing_downloads_are_unavailable() {
        let f = fixture();
        let artifact = profile_zip();
        let mut entry = publish(&f, "1.0.0", &artifact, &artifact, &sha256_hex(&artifact));
        entry.url = "http://hub/missing.zip".into();
        assert!(matches!(f.sync.sync_entry(&entry, None).await, SyncOutcome::Unavailable { .. }));
        assert!(matches!(
            f.sync.sync_driver("unknown", None, &DriverCatalog::empty()).await,
            SyncOutcome::Unavailable { .. }
        ));
        assert!(blocked_reasons(&f.buffer).is_empty());
    }
}
