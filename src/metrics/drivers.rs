//! Driver Selection & Sync Metrics

use crate::metrics::{phase_metric, MetricDoc, MetricType, PhaseMetrics};

pub struct DriverMetrics;

impl DriverMetrics {
    pub fn record_selection(matched: bool) {
        if matched {
            ::metrics::counter!(phase_metric!(counter, "drivers", "selections_matched")).increment(1);
        } else {
            ::metrics::counter!(phase_metric!(counter, "drivers", "selections_unmatched")).increment(1);
        }
    }

    pub fn record_activation() {
        ::metrics::counter!(phase_metric!(counter, "drivers", "activations")).increment(1);
    }

    pub fn record_rejection() {
        ::metrics::counter!(phase_metric!(counter, "drivers", "rejections")).increment(1);
    }

    pub fn record_sync_unavailable() {
        ::metrics::counter!(phase_metric!(counter, "drivers", "sync_unavailable")).increment(1);
    }
}

impl PhaseMetrics for DriverMetrics {
    fn register_metrics() {
        use metrics::counter;

        let _ = counter!(phase_metric!(counter, "drivers", "selections_matched"));
        let _ = counter!(phase_metric!(counter, "drivers", "selections_unmatched"));
        let _ = counter!(phase_metric!(counter, "drivers", "activations"));
        let _ = counter!(phase_metric!(counter, "drivers", "rejections"));
        let _ = counter!(phase_metric!(counter, "drivers", "sync_unavailable"));
    }

    fn phase_name() -> &'static str {
        "drivers"
    }

    fn metrics_documentation() -> Vec<MetricDoc> {
        vec![
            MetricDoc {
                name: phase_metric!(counter, "drivers", "selections_matched"),
                metric_type: MetricType::Counter,
                help: "Fingerprints for which a driver was selected",
            },
            MetricDoc {
                name: phase_metric!(counter, "drivers", "selections_unmatched"),
                metric_type: MetricType::Counter,
                help: "Fingerprints with no qualifying driver",
            },
            MetricDoc {
                name: phase_metric!(counter, "drivers", "activations"),
                metric_type: MetricType::Counter,
                help: "Driver artifacts verified and activated",
            },
            MetricDoc {
                name: phase_metric!(counter, "drivers", "rejections"),
                metric_type: MetricType::Counter,
                help: "Driver artifacts rejected by signature or checksum verification",
            },
            MetricDoc {
                name: phase_metric!(counter, "drivers", "sync_unavailable"),
                metric_type: MetricType::Counter,
                help: "Driver syncs that could not reach the hub",
            },
        ]
    }
}
