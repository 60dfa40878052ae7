//! Gateway heartbeat to the management service.

use crate::app::ports::HttpClientPort;
use crate::buffer::BufferStats;
use crate::domain::now_timestamp;
use crate::error::{GatewayError, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Heartbeat {
    pub uptime_seconds: u64,
    pub agent_version: &'static str,
    pub timestamp: String,
    pub buffer: BufferStats,
}

pub struct HeartbeatSender {
    http: Arc<dyn HttpClientPort>,
    url: String,
    started: Instant,
}

impl HeartbeatSender {
    pub fn new(http: Arc<dyn HttpClientPort>, mgmt_base_url: &str, device_id: &str) -> Self {
        Self {
            http,
            url: format!("{}/gateways/{}/heartbeat", mgmt_base_url.trim_end_matches('/'), device_id),
            started: Instant::now(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn build(&self, buffer: BufferStats) -> Heartbeat {
        Heartbeat {
            uptime_seconds: self.started.elapsed().as_secs(),
            agent_version: AGENT_VERSION,
            timestamp: now_timestamp(),
            buffer,
        }
    }

    pub async fn send(&self, buffer: BufferStats) -> Result<()> {
        let body = serde_json::to_value(self.build(buffer))?;
        let res = self
            .http
            .post_json(&self.url, &[], &body)
            .await
            .map_err(|message| GatewayError::Remote { status: 0, message })?;
        if !res.is_success() {
            return Err(GatewayError::Remote { status: res.status, message: format!("POST {}", self.url) });
        }
        debug!("Heartbeat: sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoHttp;

    #[async_trait::async_trait]
    impl HttpClientPort for NoHttp {
        async fn get(&self, _url: &str) -> std::result::Result<crate::app::ports::HttpResponse, String> {
            Err("offline".into())
        }
        async fn post_json(
            &self,
            _url: &str,
            _headers: &[(&str, String)],
            _body: &serde_json::Value,
        ) -> std::result::Result<crate::app::ports::HttpResponse, String> {
            Err("offline".into())
        }
    }

    #[tokio::test]
    async fn heartbeat_shape_and_offline_error() {
        let sender = HeartbeatSender::new(Arc::new(NoHttp), "https://mgmt.example/", "gw-1");
        assert_eq!(sender.url(), "https://mgmt.example/gateways/gw-1/heartbeat");
        let hb = serde_json::to_value(sender.build(BufferStats { queued: 4, in_flight: 1 })).unwrap();
        assert_eq!(hb["buffer"]["queued"], 4);
        assert_eq!(hb["agent_version"], AGENT_VERSION);
        assert!(matches!(sender.send(BufferStats::default()).await, Err(GatewayError::Remote { status: 0, .. })));
    }
}
