//! Idempotency Store
//!
//! Maps an opaque client key to the result the first successful write
//! produced, so retried requests observe the identical outcome. Two tiers:
//! a fast volatile cache in front of durable records in the ledger store.
//! Cache failures are non-fatal; the durable tier is authoritative.

use crate::store::{LedgerStore, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Default time-to-live for stored results: 24 hours.
pub fn default_ttl() -> Duration {
    Duration::minutes(1440)
}

/// Durable record of a completed write keyed by the client's idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub response_body: String,
    pub status_code: u16,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Result served back to a retried caller.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredResult {
    pub body: String,
    pub status_code: u16,
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

/// Fast volatile tier. Implementations may fail (e.g. a remote cache being
/// down); callers fall through to the durable store.
#[async_trait]
pub trait IdempotencyCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<StoredResult>, CacheError>;

    async fn put(
        &self,
        key: &str,
        value: StoredResult,
        ttl: Duration,
    ) -> Result<(), CacheError>;
}

/// In-process TTL cache over a concurrent map. Entries expire lazily on
/// read; the durable reaper handles long-term cleanup.
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, (StoredResult, DateTime<Utc>)>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdempotencyCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<StoredResult>, CacheError> {
        if let Some(entry) = self.entries.get(key) {
            let (value, expires_at) = entry.value();
            if *expires_at > Utc::now() {
                return Ok(Some(value.clone()));
            }
        }
        // Expired or absent; drop any stale entry.
        self.entries
            .remove_if(key, |_, (_, expires_at)| *expires_at <= Utc::now());
        Ok(None)
    }

    async fn put(
        &self,
        key: &str,
        value: StoredResult,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        self.entries
            .insert(key.to_string(), (value, Utc::now() + ttl));
        Ok(())
    }
}

/// Two-tier idempotency service.
///
/// Contract: for any key, every caller that passes it to a write operation
/// observes the same stored result, even under concurrent first-use races.
pub struct IdempotencyService<S: LedgerStore> {
    cache: Arc<dyn IdempotencyCache>,
    store: Arc<S>,
    default_ttl: Duration,
}

impl<S: LedgerStore> IdempotencyService<S> {
    pub fn new(store: Arc<S>, cache: Arc<dyn IdempotencyCache>, default_ttl: Duration) -> Self {
        Self {
            cache,
            store,
            default_ttl,
        }
    }

    pub fn with_defaults(store: Arc<S>) -> Self {
        Self::new(store, Arc::new(MemoryCache::new()), default_ttl())
    }

    /// Look up a previously stored result. Checks the fast cache first and
    /// falls back to durable storage; a durable hit repopulates the cache
    /// with the remaining TTL. Expired durable records are treated as
    /// not-found, never re-served.
    pub async fn check(&self, key: &str) -> Result<Option<StoredResult>, StoreError> {
        if key.is_empty() {
            return Ok(None);
        }

        match self.cache.get(key).await {
            Ok(Some(hit)) => {
                debug!(key, "idempotency hit in cache");
                return Ok(Some(hit));
            }
            Ok(None) => {}
            Err(e) => {
                warn!(key, error = %e, "idempotency cache lookup failed, falling back to store");
            }
        }

        let Some(record) = self.store.idempotency_get(key).await? else {
            return Ok(None);
        };

        let now = Utc::now();
        if record.expires_at <= now {
            debug!(key, "idempotency record expired");
            return Ok(None);
        }

        debug!(key, "idempotency hit in durable store");
        let result = StoredResult {
            body: record.response_body,
            status_code: record.status_code,
        };
        let remaining = record.expires_at - now;
        if let Err(e) = self.cache.put(key, result.clone(), remaining).await {
            warn!(key, error = %e, "failed to repopulate idempotency cache");
        }

        Ok(Some(result))
    }

    /// Persist the result of a first successful write: durable first with
    /// first-committer-wins semantics (a lost race is swallowed because the
    /// stored result is authoritative), then best-effort cache mirror.
    pub async fn save(&self, key: &str, body: &str, status_code: u16, ttl: Option<Duration>) {
        if key.is_empty() {
            return;
        }
        let ttl = ttl.unwrap_or(self.default_ttl);
        let now = Utc::now();

        let record = IdempotencyRecord {
            key: key.to_string(),
            response_body: body.to_string(),
            status_code,
            expires_at: now + ttl,
            created_at: now,
        };

        match self.store.idempotency_insert(&record).await {
            Ok(true) => {
                debug!(key, expires_at = %record.expires_at, "idempotency result saved");
                let cached = StoredResult {
                    body: body.to_string(),
                    status_code,
                };
                if let Err(e) = self.cache.put(key, cached, ttl).await {
                    warn!(key, error = %e, "failed to mirror idempotency result to cache");
                }
            }
            // Lost the insert race or the write failed; the cache must not
            // serve a body the durable tier never accepted.
            Ok(false) => debug!(key, "idempotency record already present, keeping winner"),
            Err(e) => warn!(key, error = %e, "failed to save idempotency record"),
        }
    }

    /// Delete durable records past expiry. Driven periodically by the
    /// maintenance scheduler; safe to call directly.
    pub async fn reap(&self) -> Result<u64, StoreError> {
        let deleted = self.store.idempotency_delete_expired(Utc::now()).await?;
        if deleted > 0 {
            info!(deleted, "reaped expired idempotency records");
        }
        Ok(deleted)
    }
}
