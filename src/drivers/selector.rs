//! Scores catalog drivers against a fingerprint and picks the best one.

use crate::domain::{DriverMatch, Fingerprint};
use crate::drivers::catalog::{CatalogEntry, CompiledRule, DriverCatalog};
use crate::metrics::DriverMetrics;
use tracing::{debug, info};

pub const PROTOCOL_SCORE: f64 = 0.4;
pub const VENDOR_SCORE: f64 = 0.3;
pub const MODEL_SCORE: f64 = 0.3;
pub const CONTROLLER_SCORE: f64 = 0.1;

fn criterion(re: &Option<regex::Regex>, value: &Option<String>) -> bool {
    matches!((re, value), (Some(re), Some(v)) if re.is_match(v))
}

fn rule_score(rule: &CompiledRule, fp: &Fingerprint) -> (f64, Vec<String>) {
    let mut score = 0.0;
    let mut reasons = Vec::new();
    if criterion(&rule.vendor, &fp.vendor) {
        score += VENDOR_SCORE;
        reasons.push(format!("vendor '{}' matched", fp.vendor.as_deref().unwrap_or_default()));
    }
    if criterion(&rule.model, &fp.model) {
        score += MODEL_SCORE;
        reasons.push(format!("model '{}' matched", fp.model.as_deref().unwrap_or_default()));
    }
    if criterion(&rule.controller, &fp.controller_version) {
        score += CONTROLLER_SCORE;
        reasons.push(format!(
            "controller '{}' matched",
            fp.controller_version.as_deref().unwrap_or_default()
        ));
    }
    (score, reasons)
}

/// Score one catalog entry. `None` means the entry cannot serve this
/// fingerprint: wrong protocol, or rules present and none matched.
pub fn score_entry(entry: &CatalogEntry, fp: &Fingerprint) -> Option<(f64, Vec<String>)> {
    if entry.manifest.protocol != fp.protocol {
        return None;
    }
    let mut reasons = vec![format!("protocol {} matched", fp.protocol)];
    if !entry.has_rules {
        reasons.push("generic driver".to_string());
        return Some((PROTOCOL_SCORE, reasons));
    }

    // best rule wins; ties go to the earlier rule
    let best = entry
        .rules
        .iter()
        .map(|rule| rule_score(rule, fp))
        .fold(None::<(f64, Vec<String>)>, |best, cur| match best {
            Some(b) if b.0 >= cur.0 => Some(b),
            _ => Some(cur),
        });
    match best {
        Some((score, rule_reasons)) if score > 0.0 => {
            reasons.extend(rule_reasons);
            Some(((PROTOCOL_SCORE + score).min(1.0), reasons))
        }
        _ => {
            debug!(driver = %entry.manifest.name, ip = %fp.ip, "Selector: specific rules failed");
            None
        }
    }
}

/// Select the highest scoring driver for `fp`. Among equal scores the
/// first registered driver wins.
pub fn select_driver(catalog: &DriverCatalog, fp: &Fingerprint) -> Option<DriverMatch> {
    let mut best: Option<DriverMatch> = None;
    for entry in catalog.entries() {
        let Some((score, reasons)) = score_entry(entry, fp) else {
            continue;
        };
        if best.as_ref().map_or(true, |b| score > b.score) {
            best = Some(DriverMatch { manifest: entry.manifest.clone(), score, reasons });
        }
    }

    match &best {
        Some(m) => info!(ip = %fp.ip, driver = %m.manifest.name, score = m.score, "Selector: driver selected"),
        None => info!(ip = %fp.ip, protocol = %fp.protocol, "Selector: no driver matched"),
    }
    DriverMetrics::record_selection(best.is_some());
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DriverManifest, MatchRule, Protocol};
    use crate::drivers::kinds::{DriverKind, DriverProfile};

    fn fp(protocol: Protocol, vendor: Option<&str>, model: Option<&str>) -> Fingerprint {
        Fingerprint::new("10.0.0.5", protocol, "http://10.0.0.5:7878", 0.95)
            .with_vendor(vendor.map(str::to_string))
            .with_model(model.map(str::to_string))
    }

    fn catalog(manifests: Vec<DriverManifest>) -> DriverCatalog {
        let mut c = DriverCatalog::empty();
        for m in manifests {
            let kind = DriverKind::for_protocol(m.protocol);
            c.register(m, DriverProfile::default_for(kind));
        }
        c
    }

    #[test]
    fn specific_rules_beat_generic() {
        let c = catalog(vec![
            DriverManifest::new("generic", "1.0.0", Protocol::Mtconnect),
            DriverManifest::new("haas", "1.0.0", Protocol::Mtconnect).with_rules(vec![MatchRule {
                vendor: Some("Haas.*".into()),
                model: Some("VF.*".into()),
                controller: None,
            }]),
        ]);
        let fp = fp(Protocol::Mtconnect, Some("Haas Automation"), Some("VF-2"));
        let generic = score_entry(&c.entries()[0], &fp).unwrap().0;
        let haas = score_entry(&c.entries()[1], &fp).unwrap().0;
        assert!(haas > generic);
        assert!((generic - 0.4).abs() < 1e-9);
        assert!((haas - 1.0).abs() < 1e-9);
        assert_eq!(select_driver(&c, &fp).unwrap().manifest.name, "haas");
    }

    #[test]
    fn protocol_mismatch_never_matches() {
        let c = catalog(vec![DriverManifest::new("ua", "1.0.0", Protocol::Opcua)]);
        assert!(select_driver(&c, &fp(Protocol::Mtconnect, Some("Siemens"), None)).is_none());
    }

    #[test]
    fn unmatched_rules_disqualify() {
        let c = catalog(vec![DriverManifest::new("mazak", "1.0.0", Protocol::Mtconnect)
            .with_rules(vec![MatchRule::vendor("MAZAK.*")])]);
        assert!(select_driver(&c, &fp(Protocol::Mtconnect, Some("Haas"), None)).is_none());
        assert!(select_driver(&c, &fp(Protocol::Mtconnect, None, None)).is_none());
    }

    #[test]
    fn partial_rule_credit_and_best_rule() {
        let c = catalog(vec![DriverManifest::new("d", "1.0.0", Protocol::Mtconnect).with_rules(vec![
            MatchRule { vendor: Some("haas".into()), model: Some("UMC.*".into()), controller: None },
            MatchRule { vendor: None, model: Some("vf-\\d".into()), controller: Some("1\\.3".into()) },
        ])]);
        let mut f = fp(Protocol::Mtconnect, Some("HAAS"), Some("VF-2"));
        f.controller_version = Some("1.3.0".into());
        let (score, reasons) = score_entry(&c.entries()[0], &f).unwrap();
        assert!((score - 0.8).abs() < 1e-9);
        assert!(reasons.iter().any(|r| r.starts_with("controller")));
    }

    #[test]
    fn ties_go_to_first_registered() {
        let c = catalog(vec![
            DriverManifest::new("first", "1.0.0", Protocol::Modbus),
            DriverManifest::new("second", "1.0.0", Protocol::Modbus),
        ]);
        let m = select_driver(&c, &fp(Protocol::Modbus, None, None)).unwrap();
        assert_eq!(m.manifest.name, "first");
    }

    #[test]
    fn builtin_catalog_picks_vendor_drivers() {
        let c = DriverCatalog::builtin();
        let m = select_driver(&c, &fp(Protocol::Mtconnect, Some("Haas"), Some("VF-2"))).unwrap();
        assert_eq!(m.manifest.name, "haas_mtconnect");
        let m = select_driver(&c, &fp(Protocol::Mtconnect, Some("Okuma"), None)).unwrap();
        assert_eq!(m.manifest.name, "generic-mtconnect");
        let m = select_driver(&c, &fp(Protocol::FanucFocas, Some("FANUC"), None)).unwrap();
        assert_eq!(m.manifest.name, "fanuc-focas");
        assert!((m.score - 0.7).abs() < 1e-9);
    }
}
