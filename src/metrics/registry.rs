//! Metrics registry for coordinating component metrics
//!
//! Registers every component's metrics and detects naming conflicts early.

use crate::metrics::{MetricDoc, PhaseMetrics};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Register all metrics from all components
pub fn register_all_metrics() {
    let mut all_metrics = HashMap::new();

    register_phase_metrics::<super::DiscoveryMetrics>(&mut all_metrics);
    register_phase_metrics::<super::DriverMetrics>(&mut all_metrics);
    register_phase_metrics::<super::PollerMetrics>(&mut all_metrics);
    register_phase_metrics::<super::BufferMetrics>(&mut all_metrics);
    register_phase_metrics::<super::UplinkMetrics>(&mut all_metrics);

    info!("Registered {} total metrics across all phases", all_metrics.len());

    if std::env::var("EDGE_METRICS_DEBUG").is_ok() {
        log_metrics_summary(&all_metrics);
    }
}

/// Register metrics for a specific phase and detect conflicts
fn register_phase_metrics<T: PhaseMetrics>(all_metrics: &mut HashMap<String, (&'static str, MetricDoc)>) {
    T::register_metrics();
    let phase_name = T::phase_name();

    for doc in T::metrics_documentation() {
        if let Some((existing_phase, _)) = all_metrics.get(doc.name) {
            warn!(
                "Metric name conflict detected: '{}' is defined in both '{}' and '{}'",
                doc.name, existing_phase, phase_name
            );
        } else {
            all_metrics.insert(doc.name.to_string(), (phase_name, doc));
        }
    }
}

fn log_metrics_summary(all_metrics: &HashMap<String, (&'static str, MetricDoc)>) {
    let mut names: Vec<&String> = all_metrics.keys().collect();
    names.sort();
    for name in names {
        if let Some((phase, doc)) = all_metrics.get(name) {
            debug!("  [{}] {} ({:?}): {}", phase, name, doc.metric_type, doc.help);
        }
    }
}

/// Every documented metric across components, for conflict checks in tests.
pub fn all_metric_docs() -> Vec<MetricDoc> {
    let mut docs = Vec::new();
    docs.extend(super::DiscoveryMetrics::metrics_documentation());
    docs.extend(super::DriverMetrics::metrics_documentation());
    docs.extend(super::PollerMetrics::metrics_documentation());
    docs.extend(super::BufferMetrics::metrics_documentation());
    docs.extend(super::UplinkMetrics::metrics_documentation());
    docs
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn metric_names_are_unique_and_prefixed() {
        let docs = all_metric_docs();
        let mut seen = HashSet::new();
        for doc in &docs {
            assert!(doc.name.starts_with("edge_"), "{}", doc.name);
            assert!(seen.insert(doc.name), "duplicate metric {}", doc.name);
        }
    }
}
