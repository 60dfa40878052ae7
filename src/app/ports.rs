use async_trait::async_trait;
use serde_json::Value;

// Outbound HTTP used by the hub client and the control loops
#[async_trait]
pub trait HttpClientPort: Send + Sync {
    async fn get(&self, url: &str) -> Result<HttpResponse, String>;
    async fn post_json(&self, url: &str, headers: &[(&str, String)], body: &Value) -> Result<HttpResponse, String>;
}

#[derive(Clone, Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub content_length: u64,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

// Uplink-side port
#[async_trait]
pub trait CollectorPort: Send + Sync {
    /// Deliver one batch. `Ok` only when the collector acknowledged it.
    async fn send_batch(&self, batch_key: &str, records: &[Value]) -> Result<(), crate::uplink::UplinkError>;
}

// Poller-side port
#[async_trait]
pub trait SampleExecutor: Send + Sync {
    async fn execute(
        &self,
        job: &crate::runtime::worker::DriverJob,
        timeout: std::time::Duration,
    ) -> Result<crate::drivers::kinds::Sample, crate::runtime::isolation::WorkerFault>;
}
