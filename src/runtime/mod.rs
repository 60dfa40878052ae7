//! Driver runtime: process isolation, per-machine backoff and the poll loop.

pub mod backoff;
pub mod isolation;
pub mod poller;
pub mod worker;

pub use isolation::{WorkerFault, WorkerPool};
pub use poller::{poll_targets, CycleReport, PollTarget, Poller};
