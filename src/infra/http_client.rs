use crate::app::ports::{HttpClientPort, HttpResponse};
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, ETAG, LAST_MODIFIED};
use serde_json::Value;
use std::time::Duration;

/// reqwest-backed HTTP port. Every request carries the gateway bearer
/// credential when one is configured.
#[derive(Clone)]
pub struct ReqwestHttp {
    client: reqwest::Client,
    bearer: Option<String>,
}

impl ReqwestHttp {
    pub fn new(timeout: Duration, bearer: Option<String>) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("edge-gateway/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self { client, bearer })
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.bearer {
            Some(token) => req.header(AUTHORIZATION, format!("Bearer {}", token)),
            None => req,
        }
    }

    async fn into_response(resp: reqwest::Response) -> Result<HttpResponse, String> {
        let status = resp.status().as_u16();
        let headers = resp.headers().clone();
        let bytes = resp.bytes().await.map_err(|e| e.to_string())?.to_vec();
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let content_length: u64 = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse().ok())
            .unwrap_or(bytes.len() as u64);
        let etag = headers.get(ETAG).and_then(|v| v.to_str().ok()).map(|s| s.to_string());
        let last_modified = headers
            .get(LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        Ok(HttpResponse { status, bytes, content_type, content_length, etag, last_modified })
    }
}

#[async_trait]
impl HttpClientPort for ReqwestHttp {
    async fn get(&self, url: &str) -> Result<HttpResponse, String> {
        let resp = self.authorize(self.client.get(url)).send().await.map_err(|e| e.to_string())?;
        Self::into_response(resp).await
    }

    async fn post_json(&self, url: &str, headers: &[(&str, String)], body: &Value) -> Result<HttpResponse, String> {
        let mut req = self.authorize(self.client.post(url)).json(body);
        for (name, value) in headers {
            req = req.header(*name, value);
        }
        let resp = req.send().await.map_err(|e| e.to_string())?;
        Self::into_response(resp).await
    }
}
