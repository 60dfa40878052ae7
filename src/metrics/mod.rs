//! Centralized metrics infrastructure for the edge gateway
//!
//! Each component defines its own metrics in a dedicated submodule, which keeps
//! ownership clear and prevents naming conflicts.

pub mod buffer;
pub mod discovery;
pub mod drivers;
pub mod poller;
pub mod registry;
pub mod uplink;

pub use buffer::BufferMetrics;
pub use discovery::DiscoveryMetrics;
pub use drivers::DriverMetrics;
pub use poller::PollerMetrics;
pub use uplink::UplinkMetrics;

use std::sync::{Once, OnceLock};
use tracing::{info, warn};

static INIT: Once = Once::new();
static HANDLE: OnceLock<metrics_exporter_prometheus::PrometheusHandle> = OnceLock::new();

/// Initialize the global metrics recorder
///
/// Idempotent. Installs a Prometheus recorder without its own listener; the
/// local status endpoint renders the handle on `GET /metrics`.
pub fn init_metrics() {
    INIT.call_once(|| {
        let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
        match builder.install_recorder() {
            Ok(handle) => {
                if HANDLE.set(handle).is_err() {
                    warn!("METRICS: Failed to store handle in OnceLock (already set?)");
                }
                info!("Prometheus recorder installed");

                // Register all phase metrics to validate naming and detect conflicts early
                registry::register_all_metrics();
            }
            Err(e) => {
                warn!("Failed to install Prometheus recorder: {}", e);
            }
        }
    });
}

/// Prometheus text exposition of everything recorded so far.
pub fn render() -> Option<String> {
    HANDLE.get().map(|h| h.render())
}

/// Trait for component-specific metrics collections
///
/// Each component implements this trait to provide:
/// - Metric registration at startup
/// - Consistent naming conventions
/// - Documentation of what each metric measures
pub trait PhaseMetrics {
    /// Register all metrics for this phase so they appear before first use.
    fn register_metrics();

    /// Get the phase name for prefixing metrics
    fn phase_name() -> &'static str;

    /// Get documentation for all metrics in this phase
    fn metrics_documentation() -> Vec<MetricDoc>;
}

/// Documentation for a single metric
#[derive(Debug, Clone)]
pub struct MetricDoc {
    pub name: &'static str,
    pub metric_type: MetricType,
    pub help: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Counter,
    Histogram,
    Gauge,
}

/// Macro to create phase-specific metric names with consistent naming
///
/// edge_{phase}_{metric_name}[_total]
macro_rules! phase_metric {
    (counter, $phase:literal, $name:literal) => {
        concat!("edge_", $phase, "_", $name, "_total")
    };
    (histogram, $phase:literal, $name:literal) => {
        concat!("edge_", $phase, "_", $name)
    };
    (gauge, $phase:literal, $name:literal) => {
        concat!("edge_", $phase, "_", $name)
    };
}

pub(crate) use phase_metric;
