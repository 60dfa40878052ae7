//! Store-and-forward uplink: drains the durable buffer to the collector.
//!
//! Each attempt reserves a batch, POSTs it with an idempotency key derived
//! from its record ids, and either deletes the batch (2xx) or releases it and
//! backs off.

use crate::app::ports::{CollectorPort, HttpClientPort};
use crate::buffer::DurableBuffer;
use crate::error::GatewayError;
use crate::idempotency::compute_batch_key;
use crate::metrics::UplinkMetrics;
use crate::runtime::backoff::jittered_delay;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub const IDEMPOTENCY_HEADER: &str = "X-Idempotency-Key";

#[derive(Error, Debug)]
pub enum UplinkError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("collector rejected batch with status {status}")]
    Rejected { status: u16, body: String },

    #[error(transparent)]
    Buffer(#[from] GatewayError),
}

/// Collector reached over the HTTP port.
pub struct HttpCollector {
    http: Arc<dyn HttpClientPort>,
    ingest_url: String,
}

impl HttpCollector {
    pub fn new(http: Arc<dyn HttpClientPort>, ingest_url: impl Into<String>) -> Self {
        Self { http, ingest_url: ingest_url.into() }
    }
}

#[async_trait]
impl CollectorPort for HttpCollector {
    async fn send_batch(&self, batch_key: &str, records: &[Value]) -> Result<(), UplinkError> {
        let body = json!({ "records": records });
        let res = self
            .http
            .post_json(&self.ingest_url, &[(IDEMPOTENCY_HEADER, batch_key.to_string())], &body)
            .await
            .map_err(UplinkError::Transport)?;
        if res.is_success() {
            Ok(())
        } else {
            let body = String::from_utf8_lossy(&res.bytes).chars().take(512).collect();
            Err(UplinkError::Rejected { status: res.status, body })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    Idle,
    Sent(usize),
    Failed,
    BackingOff,
}

pub struct UplinkWorker {
    buffer: Arc<DurableBuffer>,
    collector: Arc<dyn CollectorPort>,
    batch_size: usize,
    backoff_cap_secs: u64,
    failures: u32,
    retry_at: Option<Instant>,
}

impl UplinkWorker {
    pub fn new(buffer: Arc<DurableBuffer>, collector: Arc<dyn CollectorPort>, batch_size: usize, backoff_cap_secs: u64) -> Self {
        Self { buffer, collector, batch_size: batch_size.max(1), backoff_cap_secs, failures: 0, retry_at: None }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Time left before the next attempt is allowed.
    pub fn backoff_remaining(&self, now: Instant) -> Option<Duration> {
        self.retry_at.and_then(|t| t.checked_duration_since(now)).filter(|d| !d.is_zero())
    }

    /// One reserve → send → acknowledge step.
    pub async fn drain_once(&mut self) -> DrainOutcome {
        if self.backoff_remaining(Instant::now()).is_some() {
            return DrainOutcome::BackingOff;
        }

        let batch = match self.buffer.reserve_batch(self.batch_size) {
            Ok(batch) => batch,
            Err(e) => {
                error!("Uplink: reserve failed: {}", e);
                return DrainOutcome::Failed;
            }
        };
        if batch.is_empty() {
            return DrainOutcome::Idle;
        }

        let ids: Vec<String> = batch.iter().map(|r| r.id.clone()).collect();
        let records: Vec<Value> = batch.into_iter().map(|r| r.payload).collect();
        let batch_key = compute_batch_key(&ids);
        let started = Instant::now();

        match self.collector.send_batch(&batch_key, &records).await {
            Ok(()) => {
                if let Err(e) = self.buffer.mark_sent(&ids) {
                    // rows stay in_flight until restart recovery; the key makes the resend harmless
                    error!("Uplink: failed to delete sent batch: {}", e);
                }
                UplinkMetrics::record_batch_sent(ids.len(), started.elapsed().as_secs_f64());
                UplinkMetrics::record_backoff(0.0);
                if self.failures > 0 {
                    info!(after_failures = self.failures, "Uplink: collector reachable again");
                }
                self.failures = 0;
                self.retry_at = None;
                debug!(records = ids.len(), batch_key = %batch_key, "Uplink: batch sent");
                DrainOutcome::Sent(ids.len())
            }
            Err(e) => {
                if let Err(release_err) = self.buffer.release(&ids) {
                    error!("Uplink: failed to release batch: {}", release_err);
                }
                self.failures = self.failures.saturating_add(1);
                let delay = jittered_delay(self.failures, self.backoff_cap_secs);
                self.retry_at = Some(Instant::now() + delay);
                UplinkMetrics::record_batch_failed();
                UplinkMetrics::record_backoff(delay.as_secs_f64());
                warn!(
                    records = ids.len(),
                    failures = self.failures,
                    backoff_secs = delay.as_secs_f64(),
                    "Uplink: send failed: {}",
                    e
                );
                DrainOutcome::Failed
            }
        }
    }

    /// Drain until `shutdown` flips to true. Full batches are followed
    /// immediately by the next one; otherwise the loop waits `interval` or
    /// the remaining backoff.
    pub async fn run(mut self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(batch_size = self.batch_size, "Uplink: worker started");
        loop {
            let outcome = self.drain_once().await;
            let wait = match outcome {
                DrainOutcome::Sent(n) if n >= self.batch_size => Duration::ZERO,
                DrainOutcome::BackingOff | DrainOutcome::Failed => self
                    .backoff_remaining(Instant::now())
                    .unwrap_or(interval),
                _ => interval,
            };
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Uplink: worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{RecordContext, TelemetryRecord};
    use crate::buffer::BufferStats;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingCollector {
        fail: Mutex<bool>,
        batches: Mutex<Vec<(String, usize)>>,
    }

    #[async_trait]
    impl CollectorPort for RecordingCollector {
        async fn send_batch(&self, batch_key: &str, records: &[Value]) -> Result<(), UplinkError> {
            self.batches.lock().unwrap().push((batch_key.to_string(), records.len()));
            if *self.fail.lock().unwrap() {
                Err(UplinkError::Transport("connection refused".into()))
            } else {
                Ok(())
            }
        }
    }

    fn fill(buffer: &DurableBuffer, n: usize) {
        let ctx = RecordContext { tenant_id: "t".into(), site_id: "s".into(), device_id: "gw".into() };
        for i in 0..n {
            let mut metrics = BTreeMap::new();
            metrics.insert("part_count".to_string(), json!(i));
            let r = TelemetryRecord::new(&ctx, "m1", "2026-01-01T00:00:00.000Z", metrics, None);
            buffer.enqueue(&r.into()).unwrap();
        }
    }

    #[tokio::test]
    async fn drains_in_batches() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = Arc::new(DurableBuffer::open(dir.path().join("b.db")).unwrap());
        fill(&buffer, 5);
        let collector = Arc::new(RecordingCollector::default());
        let mut worker = UplinkWorker::new(buffer.clone(), collector.clone(), 2, 300);

        assert_eq!(worker.drain_once().await, DrainOutcome::Sent(2));
        assert_eq!(worker.drain_once().await, DrainOutcome::Sent(2));
        assert_eq!(worker.drain_once().await, DrainOutcome::Sent(1));
        assert_eq!(worker.drain_once().await, DrainOutcome::Idle);
        assert_eq!(buffer.stats().unwrap(), BufferStats::default());
        assert_eq!(collector.batches.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn failure_releases_batch_and_backs_off() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = Arc::new(DurableBuffer::open(dir.path().join("b.db")).unwrap());
        fill(&buffer, 3);
        let collector = Arc::new(RecordingCollector::default());
        *collector.fail.lock().unwrap() = true;
        let mut worker = UplinkWorker::new(buffer.clone(), collector.clone(), 10, 300);

        assert_eq!(worker.drain_once().await, DrainOutcome::Failed);
        assert_eq!(buffer.stats().unwrap(), BufferStats { queued: 3, in_flight: 0 });
        assert_eq!(worker.failures(), 1);
        assert_eq!(worker.drain_once().await, DrainOutcome::BackingOff);
        assert_eq!(collector.batches.lock().unwrap().len(), 1);

        // retry of the same rows carries the same key
        *collector.fail.lock().unwrap() = false;
        worker.retry_at = None;
        assert_eq!(worker.drain_once().await, DrainOutcome::Sent(3));
        assert_eq!(worker.failures(), 0);
        let batches = collector.batches.lock().unwrap();
        assert_eq!(batches[0].0, batches[1].0);
    }
}
