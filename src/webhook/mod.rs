//! Webhook Delivery Subsystem
//!
//! Signed, at-least-once delivery of event notifications to external URLs.
//! Every event is persisted before the first attempt; failures schedule a
//! retry with exponential backoff (1, 5, 15, 60, 240 minutes by default)
//! until the retry budget is exhausted.
//!
//! Status machine: PENDING → SENT → DELIVERED | FAILED | EXHAUSTED;
//! FAILED → RETRYING → SENT. DELIVERED and EXHAUSTED are terminal.
//! RETRYING re-enters itself so an event stranded mid-sweep is picked up
//! by the next sweep instead of wedging it.

pub mod signer;
pub mod transport;

use crate::core_types::{Reference, new_reference, now_millis};
use crate::error::LedgerError;
use crate::store::LedgerStore;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, warn};
use transport::WebhookTransport;

/// Stored response bodies are truncated beyond this many characters.
pub const RESPONSE_BODY_MAX: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WebhookStatus {
    Pending,
    Sent,
    Delivered,
    Retrying,
    Failed,
    Exhausted,
}

impl WebhookStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            WebhookStatus::Pending => "PENDING",
            WebhookStatus::Sent => "SENT",
            WebhookStatus::Delivered => "DELIVERED",
            WebhookStatus::Retrying => "RETRYING",
            WebhookStatus::Failed => "FAILED",
            WebhookStatus::Exhausted => "EXHAUSTED",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(WebhookStatus::Pending),
            "SENT" => Some(WebhookStatus::Sent),
            "DELIVERED" => Some(WebhookStatus::Delivered),
            "RETRYING" => Some(WebhookStatus::Retrying),
            "FAILED" => Some(WebhookStatus::Failed),
            "EXHAUSTED" => Some(WebhookStatus::Exhausted),
            _ => None,
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, WebhookStatus::Delivered | WebhookStatus::Exhausted)
    }

    /// Closed transition table; everything not listed is forbidden.
    pub const fn can_transition(self, to: WebhookStatus) -> bool {
        use WebhookStatus::*;
        matches!(
            (self, to),
            (Pending, Sent)
                | (Sent, Delivered)
                | (Sent, Failed)
                | (Sent, Exhausted)
                | (Failed, Retrying)
                // an interrupted sweep can leave an event in RETRYING; the
                // next sweep re-enters it
                | (Retrying, Retrying)
                | (Retrying, Sent)
        )
    }
}

impl fmt::Display for WebhookStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One outbound notification, owned by the delivery subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: Reference,
    pub event_type: String,
    pub payload: String,
    pub target_url: String,
    pub signature: String,
    pub status: WebhookStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub http_status: Option<u16>,
    pub response_body: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl WebhookEvent {
    fn transition(&mut self, to: WebhookStatus) -> Result<(), LedgerError> {
        if !self.status.can_transition(to) {
            return Err(LedgerError::invalid(format!(
                "webhook {} cannot move from {} to {to}",
                self.id, self.status
            )));
        }
        self.status = to;
        Ok(())
    }
}

/// Delivery configuration, injected from the application config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub secret: String,
    pub backoff_minutes: Vec<i64>,
    pub max_retries: u32,
    pub request_timeout_secs: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            secret: "default-webhook-secret-change-in-production".to_string(),
            backoff_minutes: vec![1, 5, 15, 60, 240],
            max_retries: 5,
            request_timeout_secs: 10,
        }
    }
}

/// Signs, persists and delivers webhook events; drives the retry sweep.
pub struct WebhookDelivery<S: LedgerStore> {
    store: Arc<S>,
    transport: Arc<dyn WebhookTransport>,
    config: WebhookConfig,
}

impl<S: LedgerStore> WebhookDelivery<S> {
    pub fn new(store: Arc<S>, transport: Arc<dyn WebhookTransport>, config: WebhookConfig) -> Self {
        Self {
            store,
            transport,
            config,
        }
    }

    /// Sign the payload, persist the event and attempt delivery once.
    /// Failures are recorded on the event, not returned: the retry sweep
    /// owns them from here.
    pub async fn send(
        &self,
        event_type: &str,
        payload: &str,
        target_url: &str,
    ) -> Result<WebhookEvent, LedgerError> {
        info!(event_type, target_url, "sending webhook");

        let event = WebhookEvent {
            id: new_reference(),
            event_type: event_type.to_string(),
            payload: payload.to_string(),
            target_url: target_url.to_string(),
            signature: signer::sign(payload, &self.config.secret),
            status: WebhookStatus::Pending,
            retry_count: 0,
            max_retries: self.config.max_retries,
            next_retry_at: None,
            http_status: None,
            response_body: None,
            last_attempt_at: None,
            created_at: Utc::now(),
        };
        self.store.insert_webhook(&event).await?;

        self.attempt(event).await
    }

    /// Re-attempt every FAILED/RETRYING event whose retry time has come and
    /// whose budget is not exhausted. Returns the number processed.
    pub async fn process_retries(&self) -> Result<usize, LedgerError> {
        let due = self.store.due_webhooks(Utc::now()).await?;
        if !due.is_empty() {
            info!(count = due.len(), "processing webhook retries");
        }

        let count = due.len();
        for mut event in due {
            event.transition(WebhookStatus::Retrying)?;
            event.retry_count += 1;
            self.store.update_webhook(&event).await?;

            if let Err(e) = self.attempt(event).await {
                error!(error = %e, "webhook retry attempt failed");
            }
        }
        Ok(count)
    }

    /// Verify an incoming payload against its signature header.
    pub fn verify_signature(payload: &str, signature: &str, secret: &str) -> bool {
        signer::verify(payload, signature, secret)
    }

    async fn attempt(&self, mut event: WebhookEvent) -> Result<WebhookEvent, LedgerError> {
        event.transition(WebhookStatus::Sent)?;
        event.last_attempt_at = Some(Utc::now());
        self.store.update_webhook(&event).await?;

        let outcome = self
            .transport
            .post(
                &event.target_url,
                &event.event_type,
                &event.payload,
                &event.signature,
                now_millis(),
            )
            .await;

        match outcome {
            Ok(response) => {
                event.http_status = Some(response.status);
                event.response_body = Some(truncate_response(&response.body));
                if response.is_success() {
                    event.transition(WebhookStatus::Delivered)?;
                    info!(id = %event.id, event_type = %event.event_type, "webhook delivered");
                } else {
                    self.record_failure(&mut event, &format!("HTTP {}", response.status))?;
                }
            }
            Err(e) => {
                self.record_failure(&mut event, &e.to_string())?;
            }
        }

        self.store.update_webhook(&event).await?;
        Ok(event)
    }

    /// Schedule the next retry with exponential backoff, or exhaust the
    /// event once the budget is spent.
    fn record_failure(&self, event: &mut WebhookEvent, reason: &str) -> Result<(), LedgerError> {
        if event.retry_count >= event.max_retries {
            event.transition(WebhookStatus::Exhausted)?;
            event.response_body = Some(format!(
                "Exhausted after {} retries. Last error: {reason}",
                event.max_retries
            ));
            warn!(
                id = %event.id,
                event_type = %event.event_type,
                retries = event.retry_count,
                "webhook exhausted"
            );
        } else {
            event.transition(WebhookStatus::Failed)?;
            let idx = (event.retry_count as usize).min(self.config.backoff_minutes.len() - 1);
            let backoff = self.config.backoff_minutes[idx];
            event.next_retry_at = Some(Utc::now() + Duration::minutes(backoff));
            info!(
                id = %event.id,
                retry = event.retry_count,
                max = event.max_retries,
                next_retry_in_min = backoff,
                reason,
                "webhook delivery failed"
            );
        }
        Ok(())
    }
}

fn truncate_response(body: &str) -> String {
    match body.char_indices().nth(RESPONSE_BODY_MAX) {
        Some((cut, _)) => format!("{}...", &body[..cut]),
        None => body.to_string(),
    }
}
