//! Discovery & Fingerprint Metrics

use crate::metrics::{phase_metric, MetricDoc, MetricType, PhaseMetrics};

pub struct DiscoveryMetrics;

impl DiscoveryMetrics {
    pub fn record_cycle(candidates: usize, fingerprints: usize, duration_secs: f64) {
        ::metrics::counter!(phase_metric!(counter, "discovery", "cycles")).increment(1);
        ::metrics::gauge!(phase_metric!(gauge, "discovery", "candidates")).set(candidates as f64);
        ::metrics::gauge!(phase_metric!(gauge, "discovery", "fingerprints")).set(fingerprints as f64);
        ::metrics::histogram!(phase_metric!(histogram, "discovery", "cycle_duration_seconds"))
            .record(duration_secs);
    }

    pub fn record_subnet_error() {
        ::metrics::counter!(phase_metric!(counter, "discovery", "subnet_errors")).increment(1);
    }

    pub fn record_probe_failure() {
        ::metrics::counter!(phase_metric!(counter, "discovery", "probe_failures")).increment(1);
    }
}

impl PhaseMetrics for DiscoveryMetrics {
    fn register_metrics() {
        use metrics::{counter, gauge, histogram};

        let _ = counter!(phase_metric!(counter, "discovery", "cycles"));
        let _ = counter!(phase_metric!(counter, "discovery", "subnet_errors"));
        let _ = counter!(phase_metric!(counter, "discovery", "probe_failures"));
        let _ = gauge!(phase_metric!(gauge, "discovery", "candidates"));
        let _ = gauge!(phase_metric!(gauge, "discovery", "fingerprints"));
        let _ = histogram!(phase_metric!(histogram, "discovery", "cycle_duration_seconds"));
    }

    fn phase_name() -> &'static str {
        "discovery"
    }

    fn metrics_documentation() -> Vec<MetricDoc> {
        vec![
            MetricDoc {
                name: phase_metric!(counter, "discovery", "cycles"),
                metric_type: MetricType::Counter,
                help: "Completed discovery cycles",
            },
            MetricDoc {
                name: phase_metric!(counter, "discovery", "subnet_errors"),
                metric_type: MetricType::Counter,
                help: "Subnets skipped because they could not be scanned",
            },
            MetricDoc {
                name: phase_metric!(counter, "discovery", "probe_failures"),
                metric_type: MetricType::Counter,
                help: "Protocol probes that errored or timed out",
            },
            MetricDoc {
                name: phase_metric!(gauge, "discovery", "candidates"),
                metric_type: MetricType::Gauge,
                help: "Candidates found in the last cycle",
            },
            MetricDoc {
                name: phase_metric!(gauge, "discovery", "fingerprints"),
                metric_type: MetricType::Gauge,
                help: "Machines identified in the last cycle",
            },
            MetricDoc {
                name: phase_metric!(histogram, "discovery", "cycle_duration_seconds"),
                metric_type: MetricType::Histogram,
                help: "Wall time of one discovery cycle",
            },
        ]
    }
}
