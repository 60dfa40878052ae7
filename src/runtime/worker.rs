//! The `driver-worker` side of process isolation: one job in on stdin, one
//! reply out on stdout.

use crate::drivers::kinds::{self, DriverProfile, Sample};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverJob {
    pub machine_id: String,
    pub driver_id: String,
    pub endpoint: String,
    pub profile: DriverProfile,
    /// Budget for the controller I/O inside the worker.
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkerReply {
    Ok { sample: Sample },
    Error { error: String },
}

/// Execute one job in-process.
pub async fn run_job(job: &DriverJob) -> WorkerReply {
    let timeout = Duration::from_millis(job.timeout_ms.max(1));
    match kinds::sample(&job.profile, &job.endpoint, timeout).await {
        Ok(sample) => {
            debug!(machine_id = %job.machine_id, metrics = sample.metrics.len(), "Worker: sample taken");
            WorkerReply::Ok { sample }
        }
        Err(e) => {
            warn!(machine_id = %job.machine_id, driver = %job.driver_id, "Worker: sample failed: {}", e);
            WorkerReply::Error { error: e.to_string() }
        }
    }
}

/// Read a [`DriverJob`] from stdin, run it and write the [`WorkerReply`] to
/// stdout.
pub async fn serve_stdio() -> Result<()> {
    let mut input = Vec::new();
    tokio::io::stdin().read_to_end(&mut input).await?;
    let reply = match serde_json::from_slice::<DriverJob>(&input) {
        Ok(job) => run_job(&job).await,
        Err(e) => WorkerReply::Error { error: format!("invalid job: {}", e) },
    };
    let mut out = serde_json::to_vec(&reply)?;
    out.push(b'\n');
    let mut stdout = tokio::io::stdout();
    stdout.write_all(&out).await?;
    stdout.flush().await?;
    Ok(())
}
