//! Isolated Poller Metrics

use crate::metrics::{phase_metric, MetricDoc, MetricType, PhaseMetrics};

pub struct PollerMetrics;

impl PollerMetrics {
    pub fn record_poll_success(duration_secs: f64) {
        ::metrics::counter!(phase_metric!(counter, "poller", "polls_success")).increment(1);
        ::metrics::histogram!(phase_metric!(histogram, "poller", "poll_duration_seconds"))
            .record(duration_secs);
    }

    pub fn record_poll_failure() {
        ::metrics::counter!(phase_metric!(counter, "poller", "polls_failed")).increment(1);
    }

    pub fn record_poll_timeout() {
        ::metrics::counter!(phase_metric!(counter, "poller", "polls_timed_out")).increment(1);
    }

    pub fn record_skipped_backoff() {
        ::metrics::counter!(phase_metric!(counter, "poller", "skipped_backoff")).increment(1);
    }

    pub fn record_circuit_open() {
        ::metrics::counter!(phase_metric!(counter, "poller", "circuit_open")).increment(1);
    }
}

impl PhaseMetrics for PollerMetrics {
    fn register_metrics() {
        use metrics::{counter, histogram};

        let _ = counter!(phase_metric!(counter, "poller", "polls_success"));
        let _ = counter!(phase_metric!(counter, "poller", "polls_failed"));
        let _ = counter!(phase_metric!(counter, "poller", "polls_timed_out"));
        let _ = counter!(phase_metric!(counter, "poller", "skipped_backoff"));
        let _ = counter!(phase_metric!(counter, "poller", "circuit_open"));
        let _ = histogram!(phase_metric!(histogram, "poller", "poll_duration_seconds"));
    }

    fn phase_name() -> &'static str {
        "poller"
    }

    fn metrics_documentation() -> Vec<MetricDoc> {
        vec![
            MetricDoc {
                name: phase_metric!(counter, "poller", "polls_success"),
                metric_type: MetricType::Counter,
                help: "Driver polls that returned a sample",
            },
            MetricDoc {
                name: phase_metric!(counter, "poller", "polls_failed"),
                metric_type: MetricType::Counter,
                help: "Driver polls that failed (including timeouts)",
            },
            MetricDoc {
                name: phase_metric!(counter, "poller", "polls_timed_out"),
                metric_type: MetricType::Counter,
                help: "Driver worker processes killed after the poll timeout",
            },
            MetricDoc {
                name: phase_metric!(counter, "poller", "skipped_backoff"),
                metric_type: MetricType::Counter,
                help: "Polls skipped because the machine is in backoff",
            },
            MetricDoc {
                name: phase_metric!(counter, "poller", "circuit_open"),
                metric_type: MetricType::Counter,
                help: "Failures recorded while a machine is past the circuit threshold",
            },
            MetricDoc {
                name: phase_metric!(histogram, "poller", "poll_duration_seconds"),
                metric_type: MetricType::Histogram,
                help: "Wall time of successful driver polls",
            },
        ]
    }
}
