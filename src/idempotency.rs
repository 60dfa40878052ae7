use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

fn sha256_hex(s: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(s.as_bytes());
    hex::encode(hasher.finalize())
}

/// Deterministic id for a telemetry record.
///
/// Only scalar metrics take part; the map is already key-ordered so the JSON
/// rendering is canonical.
pub fn compute_record_id(
    tenant_id: &str,
    site_id: &str,
    machine_id: &str,
    timestamp: &str,
    metrics: &BTreeMap<String, Value>,
) -> String {
    let stable: BTreeMap<&str, &Value> = metrics
        .iter()
        .filter(|(_, v)| matches!(v, Value::Bool(_) | Value::Number(_) | Value::String(_)))
        .map(|(k, v)| (k.as_str(), v))
        .collect();
    let metrics_json = serde_json::to_string(&stable).unwrap_or_default();

    let mut s = String::new();
    s.push_str(tenant_id);
    s.push('|');
    s.push_str(site_id);
    s.push('|');
    s.push_str(machine_id);
    s.push('|');
    s.push_str(timestamp);
    s.push('|');
    s.push_str(&metrics_json);
    sha256_hex(&s)
}

/// Rebuild `value` with every object's keys in sorted order.
fn canonical(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> = map.iter().map(|(k, v)| (k, canonical(v))).collect();
            Value::Object(sorted.into_iter().map(|(k, v)| (k.clone(), v)).collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        other => other.clone(),
    }
}

/// Deterministic id for a gateway or machine event. `details` takes part
/// with its keys in canonical order.
pub fn compute_event_id(
    tenant_id: &str,
    site_id: &str,
    machine_id: &str,
    timestamp: &str,
    event_type: &str,
    details: &Value,
) -> String {
    let details_json = serde_json::to_string(&canonical(details)).unwrap_or_default();
    sha256_hex(&format!(
        "{}|{}|{}|{}|{}|{}",
        tenant_id, site_id, machine_id, timestamp, event_type, details_json
    ))
}

/// Idempotency key for an uplink batch: order-independent over its record ids.
pub fn compute_batch_key<S: AsRef<str>>(record_ids: &[S]) -> String {
    let mut ids: Vec<&str> = record_ids.iter().map(AsRef::as_ref).collect();
    ids.sort_unstable();
    sha256_hex(&ids.join(","))
}

/// Strong machine identity from fingerprint content, if the fingerprint
/// carries enough of it.
pub fn compute_machine_id(
    ip: &str,
    serial: Option<&str>,
    vendor: Option<&str>,
    model: Option<&str>,
) -> Option<String> {
    if let Some(serial) = serial {
        return Some(sha256_hex(&format!("serial:{}", serial)));
    }
    match (vendor, model) {
        (Some(v), Some(m)) => Some(sha256_hex(&format!("{}:{}:{}", v, m, ip))),
        _ => None,
    }
}
