//! Outbound HTTP seam for webhook delivery.
//!
//! The delivery subsystem talks HTTP through [`WebhookTransport`] so tests
//! can script responses without a network. [`HttpTransport`] is the reqwest
//! implementation used by the binary.

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use std::time::Duration;
use thiserror::Error;

pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";
pub const TIMESTAMP_HEADER: &str = "X-Webhook-Timestamp";
pub const EVENT_TYPE_HEADER: &str = "X-Webhook-Event";

/// Raw outcome of one delivery POST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookResponse {
    pub status: u16,
    pub body: String,
}

impl WebhookResponse {
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(String),
}

#[async_trait]
pub trait WebhookTransport: Send + Sync {
    /// POST the signed payload. Non-2xx responses come back as `Ok` with the
    /// status; only connection-level failures are `Err`.
    async fn post(
        &self,
        url: &str,
        event_type: &str,
        payload: &str,
        signature: &str,
        timestamp_millis: i64,
    ) -> Result<WebhookResponse, TransportError>;
}

/// reqwest-backed transport with a per-request timeout.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WebhookTransport for HttpTransport {
    async fn post(
        &self,
        url: &str,
        event_type: &str,
        payload: &str,
        signature: &str,
        timestamp_millis: i64,
    ) -> Result<WebhookResponse, TransportError> {
        let response = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .header(SIGNATURE_HEADER, signature)
            .header(TIMESTAMP_HEADER, timestamp_millis.to_string())
            .header(EVENT_TYPE_HEADER, event_type)
            .body(payload.to_string())
            .send()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Ok(WebhookResponse { status, body })
    }
}
