//! Durable Buffer Metrics

use crate::metrics::{phase_metric, MetricDoc, MetricType, PhaseMetrics};

pub struct BufferMetrics;

impl BufferMetrics {
    pub fn record_enqueue(inserted: bool) {
        if inserted {
            ::metrics::counter!(phase_metric!(counter, "buffer", "enqueued")).increment(1);
        } else {
            ::metrics::counter!(phase_metric!(counter, "buffer", "duplicates")).increment(1);
        }
    }

    pub fn record_depth(queued: u64, in_flight: u64) {
        ::metrics::gauge!(phase_metric!(gauge, "buffer", "queued")).set(queued as f64);
        ::metrics::gauge!(phase_metric!(gauge, "buffer", "in_flight")).set(in_flight as f64);
    }

    pub fn record_recovered(rows: usize) {
        ::metrics::counter!(phase_metric!(counter, "buffer", "recovered")).increment(rows as u64);
    }
}

impl PhaseMetrics for BufferMetrics {
    fn register_metrics() {
        use metrics::{counter, gauge};

        let _ = counter!(phase_metric!(counter, "buffer", "enqueued"));
        let _ = counter!(phase_metric!(counter, "buffer", "duplicates"));
        let _ = counter!(phase_metric!(counter, "buffer", "recovered"));
        let _ = gauge!(phase_metric!(gauge, "buffer", "queued"));
        let _ = gauge!(phase_metric!(gauge, "buffer", "in_flight"));
    }

    fn phase_name() -> &'static str {
        "buffer"
    }

    fn metrics_documentation() -> Vec<MetricDoc> {
        vec![
            MetricDoc {
                name: phase_metric!(counter, "buffer", "enqueued"),
                metric_type: MetricType::Counter,
                help: "Records newly stored in the buffer",
            },
            MetricDoc {
                name: phase_metric!(counter, "buffer", "duplicates"),
                metric_type: MetricType::Counter,
                help: "Enqueues ignored because the idempotency id was already stored",
            },
            MetricDoc {
                name: phase_metric!(counter, "buffer", "recovered"),
                metric_type: MetricType::Counter,
                help: "In-flight rows reset to queued when the buffer was opened",
            },
            MetricDoc {
                name: phase_metric!(gauge, "buffer", "queued"),
                metric_type: MetricType::Gauge,
                help: "Rows waiting for uplink",
            },
            MetricDoc {
                name: phase_metric!(gauge, "buffer", "in_flight"),
                metric_type: MetricType::Gauge,
                help: "Rows reserved by an uplink attempt",
            },
        ]
    }
}
