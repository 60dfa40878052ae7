//! Driver catalog, selection, secure sync and the compiled driver kinds.

pub mod catalog;
pub mod hub;
pub mod kinds;
pub mod selector;
pub mod sync;
pub mod verify;

pub use catalog::DriverCatalog;
pub use kinds::{DriverKind, DriverProfile, Sample};
pub use selector::select_driver;
pub use sync::{DriverSync, SyncOutcome};

use std::path::Path;
use tracing::warn;

/// Profile to run for `driver_id`: the verified active artifact when one is
/// installed, else the built-in default. Hub-only drivers without a verified
/// artifact resolve to `None` and are not polled.
pub fn resolve_profile(active_dir: &Path, catalog: &DriverCatalog, driver_id: &str) -> Option<DriverProfile> {
    match sync::load_active_profile(active_dir, driver_id) {
        Ok(Some(profile)) => return Some(profile),
        Ok(None) => {}
        Err(e) => warn!(driver = driver_id, "Drivers: active profile unusable: {}", e),
    }
    catalog.get(driver_id).filter(|e| e.builtin).map(|e| e.profile.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DriverManifest, Protocol};

    #[test]
    fn builtins_resolve_without_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let mut catalog = DriverCatalog::builtin();
        catalog.register(
            DriverManifest::new("hub-only", "1.0.0", Protocol::Modbus),
            DriverProfile::default_for(DriverKind::ModbusTcp),
        );

        let profile = resolve_profile(dir.path(), &catalog, "generic-opcua").unwrap();
        assert_eq!(profile.kind(), DriverKind::Opcua);
        assert!(resolve_profile(dir.path(), &catalog, "hub-only").is_none());
        assert!(resolve_profile(dir.path(), &catalog, "nonexistent").is_none());
    }

    #[test]
    fn installed_profile_overrides_builtin() {
        let dir = tempfile::tempdir().unwrap();
        let current = dir.path().join("generic-modbus").join("current");
        std::fs::create_dir_all(&current).unwrap();
        std::fs::write(
            current.join("metadata.json"),
            r#"{"driver_id":"generic-modbus","version":"2.0.0","sha256":"ab","channel":"stable","entrypoint":"profile.json","activated_at":"2026-01-01T00:00:00.000Z"}"#,
        )
        .unwrap();
        std::fs::write(
            current.join("profile.json"),
            r#"{"kind":"modbus_tcp","unit_id":7,"register_map":{"spindle_speed":{"address":10,"type":"input"}}}"#,
        )
        .unwrap();

        match resolve_profile(dir.path(), &DriverCatalog::builtin(), "generic-modbus").unwrap() {
            DriverProfile::ModbusTcp { unit_id, register_map } => {
                assert_eq!(unit_id, 7);
                assert_eq!(register_map.len(), 1);
            }
            other => panic!("unexpected profile {:?}", other),
        }
    }
}
