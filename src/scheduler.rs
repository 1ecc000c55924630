//! Periodic maintenance loop.
//!
//! Drives two background jobs on independent intervals: reaping expired
//! idempotency records and sweeping due webhook retries. The loop is pure
//! plumbing; both jobs are plain async methods that tests call directly.

use crate::config::MaintenanceConfig;
use crate::idempotency::IdempotencyService;
use crate::store::LedgerStore;
use crate::webhook::WebhookDelivery;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval};
use tracing::warn;

pub async fn run_maintenance<S: LedgerStore>(
    idempotency: Arc<IdempotencyService<S>>,
    webhooks: Arc<WebhookDelivery<S>>,
    config: MaintenanceConfig,
) {
    let mut reap = interval(Duration::from_secs(config.reap_interval_secs));
    let mut retry = interval(Duration::from_secs(config.retry_interval_secs));
    reap.set_missed_tick_behavior(MissedTickBehavior::Delay);
    retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = reap.tick() => {
                if let Err(e) = idempotency.reap().await {
                    warn!(error = %e, "idempotency reap failed");
                }
            }
            _ = retry.tick() => {
                if let Err(e) = webhooks.process_retries().await {
                    warn!(error = %e, "webhook retry sweep failed");
                }
            }
        }
    }
}
