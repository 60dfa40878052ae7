//! Uplink Metrics

use crate::metrics::{phase_metric, MetricDoc, MetricType, PhaseMetrics};

pub struct UplinkMetrics;

impl UplinkMetrics {
    pub fn record_batch_sent(records: usize, duration_secs: f64) {
        ::metrics::counter!(phase_metric!(counter, "uplink", "batches_sent")).increment(1);
        ::metrics::counter!(phase_metric!(counter, "uplink", "records_sent")).increment(records as u64);
        ::metrics::histogram!(phase_metric!(histogram, "uplink", "request_duration_seconds"))
            .record(duration_secs);
    }

    pub fn record_batch_failed() {
        ::metrics::counter!(phase_metric!(counter, "uplink", "batches_failed")).increment(1);
    }

    pub fn record_backoff(seconds: f64) {
        ::metrics::gauge!(phase_metric!(gauge, "uplink", "backoff_seconds")).set(seconds);
    }
}

impl PhaseMetrics for UplinkMetrics {
    fn register_metrics() {
        use metrics::{counter, gauge, histogram};

        let _ = counter!(phase_metric!(counter, "uplink", "batches_sent"));
        let _ = counter!(phase_metric!(counter, "uplink", "records_sent"));
        let _ = counter!(phase_metric!(counter, "uplink", "batches_failed"));
        let _ = gauge!(phase_metric!(gauge, "uplink", "backoff_seconds"));
        let _ = histogram!(phase_metric!(histogram, "uplink", "request_duration_seconds"));
    }

    fn phase_name() -> &'static str {
        "uplink"
    }

    fn metrics_documentation() -> Vec<MetricDoc> {
        vec![
            MetricDoc {
                name: phase_metric!(counter, "uplink", "batches_sent"),
                metric_type: MetricType::Counter,
                help: "Batches acknowledged by the collector",
            },
            MetricDoc {
                name: phase_metric!(counter, "uplink", "records_sent"),
                metric_type: MetricType::Counter,
                help: "Records acknowledged by the collector",
            },
            MetricDoc {
                name: phase_metric!(counter, "uplink", "batches_failed"),
                metric_type: MetricType::Counter,
                help: "Batches released back to the queue after a failed POST",
            },
            MetricDoc {
                name: phase_metric!(gauge, "uplink", "backoff_seconds"),
                metric_type: MetricType::Gauge,
                help: "Current uplink backoff delay",
            },
            MetricDoc {
                name: phase_metric!(histogram, "uplink", "request_duration_seconds"),
                metric_type: MetricType::Histogram,
                help: "Wall time of successful collector POSTs",
            },
        ]
    }
}
