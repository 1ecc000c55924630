//! paycore maintenance daemon.
//!
//! Boots config and logging, connects the ledger store and runs the
//! periodic maintenance loop (idempotency reaping + webhook retry sweep)
//! until interrupted. The ledger services themselves are a library API;
//! an HTTP surface is intentionally out of scope here.

use chrono::Duration;
use paycore::config::AppConfig;
use paycore::idempotency::{IdempotencyService, MemoryCache};
use paycore::logging::init_logging;
use paycore::scheduler::run_maintenance;
use paycore::store::{LedgerStore, memory::MemoryStore, postgres::PgStore};
use paycore::webhook::WebhookDelivery;
use paycore::webhook::transport::HttpTransport;
use std::sync::Arc;
use tracing::info;

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let config = AppConfig::load(&env);
    let _guard = init_logging(&config);

    info!(env, "starting paycore");

    match config.postgres_url.clone() {
        Some(url) => {
            let store = Arc::new(PgStore::connect(&url).await?);
            store.health_check().await?;
            run(store, config).await
        }
        None => {
            info!("no postgres_url configured, using in-memory store");
            run(Arc::new(MemoryStore::new()), config).await
        }
    }
}

async fn run<S: LedgerStore>(store: Arc<S>, config: AppConfig) -> anyhow::Result<()> {
    let idempotency = Arc::new(IdempotencyService::new(
        store.clone(),
        Arc::new(MemoryCache::new()),
        Duration::minutes(config.idempotency.ttl_minutes),
    ));
    let transport = Arc::new(HttpTransport::new(std::time::Duration::from_secs(
        config.webhook.request_timeout_secs,
    ))?);
    let webhooks = Arc::new(WebhookDelivery::new(
        store,
        transport,
        config.webhook.clone(),
    ));

    let maintenance = tokio::spawn(run_maintenance(
        idempotency,
        webhooks,
        config.maintenance.clone(),
    ));

    info!("paycore maintenance loop running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    maintenance.abort();
    Ok(())
}
