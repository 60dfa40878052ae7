//! Runs jobs in child processes so a hung or crashing driver cannot take the
//! agent down with it.
//!
//! A job is written as JSON to the child's stdin; the child answers with one
//! JSON document on stdout. A child that has not answered within the timeout
//! is killed.

use crate::app::ports::SampleExecutor;
use crate::drivers::kinds::Sample;
use crate::runtime::worker::{DriverJob, WorkerReply};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Largest reply accepted from a worker.
const MAX_REPLY_BYTES: u64 = 4 * 1024 * 1024;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum WorkerFault {
    #[error("failed to start worker: {0}")]
    Spawn(String),

    #[error("worker timed out after {0:?}")]
    Timeout(Duration),

    #[error("worker exited abnormally: {0}")]
    Crashed(String),

    #[error("unreadable worker reply: {0}")]
    BadReply(String),

    #[error("driver error: {0}")]
    Driver(String),
}

impl WorkerFault {
    pub fn is_timeout(&self) -> bool {
        matches!(self, WorkerFault::Timeout(_))
    }
}

/// Bounded pool of one-shot worker processes.
pub struct WorkerPool {
    program: PathBuf,
    args: Vec<String>,
    permits: Semaphore,
}

impl WorkerPool {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, max_concurrent: usize) -> Self {
        Self { program: program.into(), args, permits: Semaphore::new(max_concurrent.max(1)) }
    }

    /// Workers that re-run this executable as `driver-worker`.
    pub fn for_driver_worker(program: Option<PathBuf>, max_concurrent: usize) -> Result<Self, WorkerFault> {
        let program = match program {
            Some(p) => p,
            None => std::env::current_exe().map_err(|e| WorkerFault::Spawn(e.to_string()))?,
        };
        Ok(Self::new(program, vec!["driver-worker".to_string()], max_concurrent))
    }

    /// Run `job` in a fresh child process and decode its reply.
    pub async fn submit<J, T>(&self, job: &J, timeout: Duration) -> Result<T, WorkerFault>
    where
        J: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let input = serde_json::to_vec(job).map_err(|e| WorkerFault::Spawn(e.to_string()))?;
        let mut spawned: Option<Child> = None;

        // queueing for a permit counts against the caller's timeout
        let run = async {
            let _permit = self
                .permits
                .acquire()
                .await
                .map_err(|e| WorkerFault::Spawn(e.to_string()))?;

            let child = spawned.insert(
                Command::new(&self.program)
                    .args(&self.args)
                    .stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::inherit())
                    .kill_on_drop(true)
                    .spawn()
                    .map_err(|e| WorkerFault::Spawn(format!("{}: {}", self.program.display(), e)))?,
            );

            let mut stdin = child.stdin.take().ok_or_else(|| WorkerFault::Spawn("stdin unavailable".into()))?;
            let mut stdout = child.stdout.take().ok_or_else(|| WorkerFault::Spawn("stdout unavailable".into()))?;

            // a child that exits without reading its input is not an error here
            if let Err(e) = stdin.write_all(&input).await {
                debug!("Worker: stdin write failed: {}", e);
            }
            drop(stdin);
            let mut out = Vec::new();
            (&mut stdout)
                .take(MAX_REPLY_BYTES)
                .read_to_end(&mut out)
                .await
                .map_err(|e| WorkerFault::Crashed(e.to_string()))?;
            let status = child.wait().await.map_err(|e| WorkerFault::Crashed(e.to_string()))?;
            Ok::<_, WorkerFault>((status, out))
        };

        let result = tokio::time::timeout(timeout, run).await;
        let (status, out) = match result {
            Ok(done) => done?,
            Err(_) => {
                if let Some(mut child) = spawned.take() {
                    if let Err(e) = child.kill().await {
                        warn!("Worker: failed to kill timed out child: {}", e);
                    }
                }
                return Err(WorkerFault::Timeout(timeout));
            }
        };

        if !status.success() {
            return Err(WorkerFault::Crashed(status.to_string()));
        }
        serde_json::from_slice(&out).map_err(|e| WorkerFault::BadReply(e.to_string()))
    }
}

#[async_trait]
impl SampleExecutor for WorkerPool {
    async fn execute(&self, job: &DriverJob, timeout: Duration) -> Result<Sample, WorkerFault> {
        match self.submit::<_, WorkerReply>(job, timeout).await? {
            WorkerReply::Ok { sample } => Ok(sample),
            WorkerReply::Error { error } => Err(WorkerFault::Driver(error)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::time::Instant;

    fn sh(script: &str) -> WorkerPool {
        WorkerPool::new("/bin/sh", vec!["-c".into(), script.into()], 4)
    }

    #[tokio::test]
    async fn echoes_reply_from_child() {
        let pool = sh("cat");
        let reply: Value = pool.submit(&json!({"hello": "worker"}), Duration::from_secs(5)).await.unwrap();
        assert_eq!(reply, json!({"hello": "worker"}));
    }

    #[tokio::test]
    async fn hung_child_is_killed_at_timeout() {
        let pool = sh("sleep 30");
        let started = Instant::now();
        let err = pool
            .submit::<_, Value>(&json!({}), Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn crashes_and_garbage_are_faults() {
        let err = sh("exit 3").submit::<_, Value>(&json!({}), Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, WorkerFault::Crashed(_)));
        let err = sh("echo not-json").submit::<_, Value>(&json!({}), Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, WorkerFault::BadReply(_)));
        let err = WorkerPool::new("/nonexistent/worker", vec![], 1)
            .submit::<_, Value>(&json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerFault::Spawn(_)));
    }

    #[tokio::test]
    async fn queued_jobs_time_out_on_their_own_clock() {
        let pool = WorkerPool::new("/bin/sh", vec!["-c".into(), "sleep 30".into()], 1);
        let timeout = Duration::from_secs(1);
        let (req_a, req_b) = (json!({}), json!({}));
        let started = Instant::now();
        let (first, second) = tokio::join!(
            pool.submit::<_, Value>(&req_a, timeout),
            pool.submit::<_, Value>(&req_b, timeout),
        );
        assert!(first.unwrap_err().is_timeout());
        assert!(second.unwrap_err().is_timeout());
        // both finish within one timeout even though only one can run at a time
        assert!(started.elapsed() < Duration::from_millis(1_800));
    }

    #[tokio::test]
    async fn driver_errors_map_to_faults() {
        let pool = sh(r#"cat >/dev/null; echo '{"status":"error","error":"connection refused"}'"#);
        let job = DriverJob {
            machine_id: "m1".into(),
            driver_id: "generic-modbus".into(),
            endpoint: "127.0.0.1:1".into(),
            profile: crate::drivers::kinds::DriverProfile::Focas,
            timeout_ms: 100,
        };
        let err = pool.execute(&job, Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(err, WorkerFault::Driver("connection refused".into()));
    }
}
