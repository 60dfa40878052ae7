use crate::buffer::{BufferStats, DurableBuffer};
use crate::error::{GatewayError, Result};
use crate::registry::{MachineRegistry, RegistrySummary};
use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Json},
    routing::get,
    Extension, Router,
};
use hyper::Server;
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Everything the local status endpoint reads.
pub struct StatusState {
    pub buffer: Arc<DurableBuffer>,
    pub registry_path: PathBuf,
    pub device_id: String,
    pub started: Instant,
}

#[derive(Debug, Serialize)]
struct StatusReport {
    device_id: String,
    version: &'static str,
    uptime_seconds: u64,
    buffer: Option<BufferStats>,
    registry: RegistrySummary,
}

/// Health check endpoint
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "edge-gateway",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn status(Extension(state): Extension<Arc<StatusState>>) -> impl IntoResponse {
    let buffer = match state.buffer.stats() {
        Ok(stats) => Some(stats),
        Err(e) => {
            warn!("Status: buffer stats unavailable: {}", e);
            None
        }
    };
    let registry = MachineRegistry::load(&state.registry_path).summary();
    Json(StatusReport {
        device_id: state.device_id.clone(),
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.started.elapsed().as_secs(),
        buffer,
        registry,
    })
}

async fn metrics() -> impl IntoResponse {
    match crate::metrics::render() {
        Some(body) => (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            "metrics recorder not installed\n".to_string(),
        ),
    }
}

pub fn create_router(state: Arc<StatusState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .layer(Extension(state))
}

/// Serve the status endpoint until `shutdown` resolves.
pub async fn serve(bind: &str, state: Arc<StatusState>, shutdown: impl Future<Output = ()>) -> Result<()> {
    let addr: SocketAddr = bind
        .parse()
        .map_err(|e| GatewayError::Config(format!("invalid status bind address '{}': {}", bind, e)))?;
    let app = create_router(state);

    info!("Status endpoint listening on http://{}", addr);
    Server::try_bind(&addr)
        .map_err(|e| GatewayError::Config(format!("cannot bind {}: {}", addr, e)))?
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| GatewayError::Config(format!("status server error: {}", e)))
}
