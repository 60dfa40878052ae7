//! Isolated poller: samples every enrolled machine each cycle and buffers the
//! results as telemetry.

use crate::app::ports::SampleExecutor;
use crate::buffer::DurableBuffer;
use crate::domain::{now_timestamp, Protocol, RecordContext, TelemetryRecord};
use crate::drivers::{resolve_profile, DriverCatalog, DriverProfile};
use crate::metrics::PollerMetrics;
use crate::registry::MachineRegistry;
use crate::runtime::backoff::BackoffTracker;
use crate::runtime::worker::DriverJob;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// One machine to sample this cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct PollTarget {
    pub machine_id: String,
    pub driver_id: String,
    pub endpoint: String,
    pub profile: DriverProfile,
}

fn default_endpoint(ip: &str, protocol: Protocol) -> String {
    match protocol {
        Protocol::Mtconnect => format!("http://{}:{}", ip, protocol.default_port()),
        Protocol::Opcua => format!("opc.tcp://{}:{}", ip, protocol.default_port()),
        _ => format!("{}:{}", ip, protocol.default_port()),
    }
}

/// Enrolled machines whose driver resolves to a runnable profile.
pub fn poll_targets(registry: &MachineRegistry, catalog: &DriverCatalog, active_dir: &Path) -> Vec<PollTarget> {
    let mut targets = Vec::new();
    for entry in registry.pollable() {
        let Some(driver_id) = entry.selected_driver_id.as_deref() else {
            continue;
        };
        let Some(profile) = resolve_profile(active_dir, catalog, driver_id) else {
            debug!(machine_id = %entry.machine_id, driver = driver_id, "Poller: driver not installed, skipping");
            continue;
        };
        let protocol = entry.protocol.unwrap_or_else(|| profile.kind().protocol());
        let endpoint = entry.endpoint.clone().unwrap_or_else(|| default_endpoint(&entry.ip, protocol));
        targets.push(PollTarget {
            machine_id: entry.machine_id.clone(),
            driver_id: driver_id.to_string(),
            endpoint,
            profile,
        });
    }
    targets
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub polled: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub enqueued: usize,
}

pub struct Poller {
    executor: Arc<dyn SampleExecutor>,
    buffer: Arc<DurableBuffer>,
    ctx: RecordContext,
    timeout: Duration,
    backoff: BackoffTracker,
}

impl Poller {
    pub fn new(
        executor: Arc<dyn SampleExecutor>,
        buffer: Arc<DurableBuffer>,
        ctx: RecordContext,
        timeout: Duration,
        backoff_cap_secs: u64,
        circuit_breaker_threshold: u32,
    ) -> Self {
        Self {
            executor,
            buffer,
            ctx,
            timeout,
            backoff: BackoffTracker::new(backoff_cap_secs, circuit_breaker_threshold),
        }
    }

    pub fn failures(&self, machine_id: &str) -> u32 {
        self.backoff.failures(machine_id)
    }

    /// Poll every target not in backoff, concurrently, each under the poll
    /// timeout.
    pub async fn poll_cycle(&mut self, targets: &[PollTarget]) -> CycleReport {
        let mut report = CycleReport::default();
        let now = Instant::now();
        // the driver gets most of the budget; the rest covers process startup
        let driver_budget_ms = (self.timeout.as_millis() as u64).saturating_mul(4) / 5;

        let mut set = JoinSet::new();
        for target in targets {
            if self.backoff.is_backing_off(&target.machine_id, now) {
                debug!(machine_id = %target.machine_id, "Poller: in backoff, skipping");
                PollerMetrics::record_skipped_backoff();
                report.skipped += 1;
                continue;
            }
            let job = DriverJob {
                machine_id: target.machine_id.clone(),
                driver_id: target.driver_id.clone(),
                endpoint: target.endpoint.clone(),
                profile: target.profile.clone(),
                timeout_ms: driver_budget_ms.max(1),
            };
            let executor = self.executor.clone();
            let timeout = self.timeout;
            let span = info_span!("poll", machine_id = %target.machine_id, driver = %target.driver_id);
            set.spawn(
                async move {
                    let started = Instant::now();
                    let result = executor.execute(&job, timeout).await;
                    (job.machine_id, result, started.elapsed())
                }
                .instrument(span),
            );
            report.polled += 1;
        }

        while let Some(joined) = set.join_next().await {
            let (machine_id, result, elapsed) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!("Poller: poll task failed: {}", e);
                    report.failed += 1;
                    continue;
                }
            };
            match result {
                Ok(sample) => {
                    self.backoff.record_success(&machine_id);
                    PollerMetrics::record_poll_success(elapsed.as_secs_f64());
                    report.succeeded += 1;
                    let record = TelemetryRecord::new(&self.ctx, &machine_id, &now_timestamp(), sample.metrics, sample.status);
                    match self.buffer.enqueue(&record.into()) {
                        Ok(true) => report.enqueued += 1,
                        Ok(false) => debug!(machine_id = %machine_id, "Poller: duplicate sample ignored"),
                        Err(e) => error!(machine_id = %machine_id, "Poller: failed to buffer sample: {}", e),
                    }
                }
                Err(fault) => {
                    report.failed += 1;
                    PollerMetrics::record_poll_failure();
                    if fault.is_timeout() {
                        PollerMetrics::record_poll_timeout();
                    }
                    let outcome = self.backoff.record_failure(&machine_id, Instant::now());
                    warn!(
                        machine_id = %machine_id,
                        failures = outcome.failures,
                        backoff_secs = outcome.delay.as_secs_f64(),
                        "Poller: poll failed: {}",
                        fault
                    );
                    if outcome.circuit_open {
                        PollerMetrics::record_circuit_open();
                        error!(machine_id = %machine_id, failures = outcome.failures, "Poller: circuit breaker open");
                    }
                }
            }
        }

        info!(
            polled = report.polled,
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            "Poller: cycle complete"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DriverManifest, Fingerprint, DriverMatch};
    use crate::drivers::kinds::Sample;
    use crate::runtime::isolation::{WorkerFault, WorkerPool};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Mutex;

    /// Executor scripted per machine id.
    #[derive(Default)]
    struct ScriptedExecutor {
        fail: Mutex<HashMap<String, bool>>,
        delay: Duration,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SampleExecutor for ScriptedExecutor {
        async fn execute(&self, job: &DriverJob, timeout: Duration) -> Result<Sample, WorkerFault> {
            self.calls.lock().unwrap().push(job.machine_id.clone());
            tokio::time::sleep(self.delay).await;
            if self.fail.lock().unwrap().get(&job.machine_id).copied().unwrap_or(false) {
                return Err(WorkerFault::Timeout(timeout));
            }
            let mut metrics = BTreeMap::new();
            metrics.insert("spindle_speed".to_string(), json!(1200.0));
            metrics.insert("execution_state".to_string(), json!("ACTIVE"));
            Ok(Sample { metrics, status: Some("ACTIVE".into()) })
        }
    }

    fn target(id: &str) -> PollTarget {
        PollTarget {
            machine_id: id.into(),
            driver_id: "generic-mtconnect".into(),
            endpoint: "http://127.0.0.1:7878".into(),
            profile: DriverProfile::Mtconnect { current_path: "/current".into() },
        }
    }

    fn poller(executor: Arc<ScriptedExecutor>) -> (tempfile::TempDir, Arc<DurableBuffer>, Poller) {
        let dir = tempfile::tempdir().unwrap();
        let buffer = Arc::new(DurableBuffer::open(dir.path().join("buffer.db")).unwrap());
        let ctx = RecordContext { tenant_id: "t".into(), site_id: "s".into(), device_id: "gw".into() };
        let poller = Poller::new(executor, buffer.clone(), ctx, Duration::from_secs(1), 300, 3);
        (dir, buffer, poller)
    }

    #[tokio::test]
    async fn successful_samples_are_buffered() {
        let exec = Arc::new(ScriptedExecutor::default());
        let (_dir, buffer, mut poller) = poller(exec);
        let report = poller.poll_cycle(&[target("m1"), target("m2")]).await;
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.enqueued, 2);

        let batch = buffer.reserve_batch(10).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].payload["kind"], "telemetry");
        assert_eq!(batch[0].payload["status"], "ACTIVE");
    }

    #[tokio::test]
    async fn failures_back_off_and_success_resets() {
        let exec = Arc::new(ScriptedExecutor::default());
        exec.fail.lock().unwrap().insert("m1".into(), true);
        let (_dir, _buffer, mut poller) = poller(exec.clone());

        let first = poller.poll_cycle(&[target("m1"), target("m2")]).await;
        assert_eq!((first.failed, first.succeeded), (1, 1));
        assert_eq!(poller.failures("m1"), 1);

        // m1 is inside its 2-3s backoff window
        let second = poller.poll_cycle(&[target("m1"), target("m2")]).await;
        assert_eq!(second.skipped, 1);
        assert_eq!(exec.calls.lock().unwrap().iter().filter(|c| *c == "m1").count(), 1);

        poller.backoff.record_success("m1");
        exec.fail.lock().unwrap().insert("m1".into(), false);
        let third = poller.poll_cycle(&[target("m1")]).await;
        assert_eq!(third.succeeded, 1);
        assert_eq!(poller.failures("m1"), 0);
    }

    #[tokio::test]
    async fn machines_are_polled_concurrently() {
        let exec = Arc::new(ScriptedExecutor { delay: Duration::from_millis(300), ..Default::default() });
        let (_dir, _buffer, mut poller) = poller(exec);
        let started = Instant::now();
        let targets: Vec<PollTarget> = (0..5).map(|i| target(&format!("m{}", i))).collect();
        let report = poller.poll_cycle(&targets).await;
        assert_eq!(report.succeeded, 5);
        assert!(started.elapsed() < Duration::from_millis(1_200));
    }

    /// Children for machines named `hung-*` never answer; the rest reply at once.
    const MIXED_WORKER: &str = r#"input=$(cat)
case "$input" in *'"machine_id":"hung-'*) sleep 30 ;; esac
echo '{"status":"ok","sample":{"metrics":{"spindle_speed":1200.0},"status":"ACTIVE"}}'"#;

    /// Real worker processes, with the wall time of every execution recorded.
    struct TimedPool {
        pool: WorkerPool,
        elapsed: Mutex<HashMap<String, Duration>>,
    }

    #[async_trait]
    impl SampleExecutor for TimedPool {
        async fn execute(&self, job: &DriverJob, timeout: Duration) -> Result<Sample, WorkerFault> {
            let started = Instant::now();
            let result = self.pool.execute(job, timeout).await;
            self.elapsed.lock().unwrap().insert(job.machine_id.clone(), started.elapsed());
            result
        }
    }

    fn process_poller(max_workers: usize) -> (tempfile::TempDir, Arc<DurableBuffer>, Arc<TimedPool>, Poller) {
        let dir = tempfile::tempdir().unwrap();
        let buffer = Arc::new(DurableBuffer::open(dir.path().join("buffer.db")).unwrap());
        let ctx = RecordContext { tenant_id: "t".into(), site_id: "s".into(), device_id: "gw".into() };
        let exec = Arc::new(TimedPool {
            pool: WorkerPool::new("/bin/sh", vec!["-c".into(), MIXED_WORKER.into()], max_workers),
            elapsed: Mutex::default(),
        });
        let poller = Poller::new(exec.clone(), buffer.clone(), ctx, Duration::from_secs(1), 300, 3);
        (dir, buffer, exec, poller)
    }

    #[tokio::test]
    async fn hung_driver_does_not_hold_up_healthy_machines() {
        let (_dir, buffer, exec, mut poller) = process_poller(4);
        let started = Instant::now();
        let report = poller.poll_cycle(&[target("hung-1"), target("ok-1"), target("ok-2")]).await;
        assert!(started.elapsed() < Duration::from_millis(1_800));
        assert_eq!((report.succeeded, report.failed, report.enqueued), (2, 1, 2));
        assert_eq!(poller.failures("hung-1"), 1);

        let elapsed = exec.elapsed.lock().unwrap().clone();
        assert!(elapsed["hung-1"] >= Duration::from_secs(1));
        assert!(elapsed["ok-1"] < Duration::from_millis(800));
        assert!(elapsed["ok-2"] < Duration::from_millis(800));
        assert_eq!(buffer.stats().unwrap().queued, 2);
    }

    #[tokio::test]
    async fn oversubscribed_pool_still_ends_every_poll_by_the_timeout() {
        let (_dir, _buffer, exec, mut poller) = process_poller(2);
        let targets = [target("hung-1"), target("hung-2"), target("ok-1"), target("ok-2")];
        let started = Instant::now();
        let report = poller.poll_cycle(&targets).await;
        assert!(started.elapsed() < Duration::from_millis(1_800));
        assert_eq!(report.polled, 4);
        assert_eq!(report.succeeded + report.failed, 4);
        assert!(report.failed >= 2);

        let elapsed = exec.elapsed.lock().unwrap().clone();
        assert_eq!(elapsed.len(), 4);
        assert!(elapsed.values().all(|e| *e < Duration::from_millis(1_800)));
    }

    #[test]
    fn targets_come_from_enrolled_machines() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = MachineRegistry::load(dir.path().join("reg.json"));
        let selection = DriverMatch {
            manifest: DriverManifest::new("generic-modbus", "1.0.0", Protocol::Modbus),
            score: 0.4,
            reasons: vec![],
        };
        let fp = Fingerprint::new("10.0.0.5", Protocol::Modbus, "10.0.0.5:502", 0.9);
        let id = registry.apply_fingerprint(&fp, Some(&selection)).machine_id.clone();
        registry.add_manual("CNC-2", "10.0.0.6", None, Some("hub-only-driver"));

        let catalog = DriverCatalog::builtin();
        assert!(poll_targets(&registry, &catalog, dir.path()).is_empty());

        registry.enroll(&id);
        let targets = poll_targets(&registry, &catalog, dir.path());
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].endpoint, "10.0.0.5:502");
        assert_eq!(default_endpoint("10.0.0.7", Protocol::Mtconnect), "http://10.0.0.7:7878");
    }
}
