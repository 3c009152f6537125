//! TTL-based mutex keyed by owner, shared through the database so that
//! overlapping scheduler triggers and separate instances exclude each other.
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::db::{self, Pool};
use crate::error::{storage, ScoutResult};

pub fn owner_lock_key(owner_id: &str) -> String {
    format!("scan:{}", owner_id)
}

#[derive(Debug, Clone)]
pub struct DistributedLock {
    pool: Pool,
}

impl DistributedLock {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Returns false when a live lock is held by anyone (including `holder`).
    pub async fn acquire(
        &self,
        key: &str,
        owner_id: &str,
        holder: &str,
        ttl: Duration,
    ) -> ScoutResult<bool> {
        self.acquire_at(key, owner_id, holder, ttl, Utc::now()).await
    }

    pub async fn acquire_at(
        &self,
        key: &str,
        owner_id: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> ScoutResult<bool> {
        let now_ms = now.timestamp_millis();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let acquired = db::try_acquire_lock(
            &self.pool,
            key,
            owner_id,
            holder,
            now_ms,
            now_ms.saturating_add(ttl_ms),
        )
        .await
        .map_err(storage)?;
        debug!(key, holder, acquired, "lock acquire");
        Ok(acquired)
    }

    /// Only the holder that acquired the lock can release it.
    pub async fn release(&self, key: &str, holder: &str) -> ScoutResult<bool> {
        let released = db::release_lock(&self.pool, key, holder)
            .await
            .map_err(storage)?;
        if !released {
            warn!(key, holder, "release matched no lock held by this holder");
        }
        Ok(released)
    }

    /// Delete every lock whose TTL has elapsed.
    pub async fn reap_expired(&self) -> ScoutResult<u64> {
        self.reap_expired_at(Utc::now()).await
    }

    pub async fn reap_expired_at(&self, now: DateTime<Utc>) -> ScoutResult<u64> {
        let reaped = db::reap_expired_locks(&self.pool, now.timestamp_millis())
            .await
            .map_err(storage)?;
        if reaped > 0 {
            info!(reaped, "reaped expired scan locks");
        }
        Ok(reaped)
    }
}
