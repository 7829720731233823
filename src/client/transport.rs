//! HTTP backend client.
//!
//! Thin wrapper over `reqwest` with a per-request timeout. Every completed
//! transfer is fed to the [`BandwidthMonitor`]. Status codes are returned
//! as-is; deciding what a status means is up to the caller.

use reqwest::{Client, Method};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::client::sync::bandwidth::BandwidthMonitor;
use crate::shared::config::SyncConfig;
use crate::shared::error::TransportError;
use crate::shared::model::HttpMethod;

/// Header carrying a mutation's idempotency key
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Response received from the backend
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    /// Parsed JSON body; `Null` when empty, a string when not JSON
    pub body: Value,
    pub bytes: u64,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Statuses worth retrying later: 408, 429 and 5xx
    pub fn is_transient_failure(&self) -> bool {
        self.status == 408 || self.status == 429 || self.status >= 500
    }

    /// Short description for logs and dead letters
    pub fn error_summary(&self) -> String {
        match &self.body {
            Value::Null => format!("HTTP {}", self.status),
            Value::String(s) => format!("HTTP {}: {}", self.status, s),
            other => format!("HTTP {}: {}", self.status, other),
        }
    }
}

/// REST backend client
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    config: Arc<SyncConfig>,
    bandwidth: Arc<BandwidthMonitor>,
}

impl HttpBackend {
    pub fn new(config: Arc<SyncConfig>, bandwidth: Arc<BandwidthMonitor>) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;

        Ok(Self {
            client,
            config,
            bandwidth,
        })
    }

    pub fn bandwidth(&self) -> &Arc<BandwidthMonitor> {
        &self.bandwidth
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Send a JSON request to `path` on the configured server
    pub async fn send(
        &self,
        method: HttpMethod,
        path: &str,
        body: Option<&Value>,
        idempotency_key: Option<Uuid>,
    ) -> Result<HttpResponse, TransportError> {
        let url = self.config.api_url(path);
        let mut request = self.client.request(to_reqwest(method), &url);

        if let Some(key) = idempotency_key {
            request = request.header(IDEMPOTENCY_HEADER, key.to_string());
        }

        let mut sent_bytes = 0u64;
        if let Some(body) = body.filter(|b| !b.is_null()) {
            let encoded = serde_json::to_vec(body)
                .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
            sent_bytes = encoded.len() as u64;
            request = request
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(encoded);
        }

        tracing::debug!("[Transport] {} {}", method, url);
        self.execute(request, sent_bytes).await
    }

    /// Send a pre-serialized request, as persisted by the mirror queue
    ///
    /// `url` may be absolute or a path on the configured server.
    pub async fn send_raw(
        &self,
        method: HttpMethod,
        url: &str,
        headers: &[(String, String)],
        body: Option<&str>,
    ) -> Result<HttpResponse, TransportError> {
        let url = if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            self.config.api_url(url)
        };

        let mut request = self.client.request(to_reqwest(method), &url);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let mut sent_bytes = 0u64;
        if let Some(body) = body {
            sent_bytes = body.len() as u64;
            request = request.body(body.to_string());
        }

        tracing::debug!("[Transport] {} {} (raw)", method, url);
        self.execute(request, sent_bytes).await
    }

    async fn execute(
        &self,
        request: reqwest::RequestBuilder,
        sent_bytes: u64,
    ) -> Result<HttpResponse, TransportError> {
        let timeout = self.config.request_timeout();
        let started = Instant::now();

        let response = request.send().await.map_err(|e| map_send_error(e, timeout))?;
        let status = response.status().as_u16();
        let raw = response.bytes().await.map_err(|e| map_send_error(e, timeout))?;

        let received = raw.len() as u64;
        self.bandwidth
            .record(sent_bytes + received, started.elapsed())
            .await;

        let body = if raw.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&raw)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&raw).into_owned()))
        };

        Ok(HttpResponse {
            status,
            body,
            bytes: received,
        })
    }
}

fn to_reqwest(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Get => Method::GET,
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Patch => Method::PATCH,
        HttpMethod::Delete => Method::DELETE,
    }
}

fn map_send_error(err: reqwest::Error, timeout: Duration) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(timeout)
    } else {
        err.into()
    }
}
