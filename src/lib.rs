pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;

// Domain data shapes shared across layers
pub mod domain;
pub mod idempotency;

// Discovery and identification
pub mod discovery;
pub mod fingerprint;
pub mod protocols;
pub mod rate_limiter;

// Drivers, polling and the stores they feed
pub mod buffer;
pub mod drivers;
pub mod registry;
pub mod runtime;
pub mod uplink;

// Cloud control plane and the local status endpoint
pub mod control;
pub mod server;

// Layered boundaries for application and infrastructure
pub mod app;
pub mod infra;

pub mod agent;
