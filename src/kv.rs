//! Short-lived key-value entries with a TTL, injected where request handling
//! needs to remember something briefly (webhook replay guard).
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::db::{self, Pool};
use crate::error::{storage, ScoutResult};

#[async_trait]
pub trait KvStore: Send + Sync {
    /// Store `value` unless a live entry exists. Returns whether it was stored.
    async fn put_if_absent(&self, key: &str, value: &str, ttl: Duration) -> ScoutResult<bool>;
    async fn get(&self, key: &str) -> ScoutResult<Option<String>>;
    async fn delete(&self, key: &str) -> ScoutResult<()>;
    async fn purge_expired(&self) -> ScoutResult<u64>;
}

#[derive(Debug, Clone)]
pub struct SqliteKvStore {
    pool: Pool,
}

impl SqliteKvStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl KvStore for SqliteKvStore {
    async fn put_if_absent(&self, key: &str, value: &str, ttl: Duration) -> ScoutResult<bool> {
        let now_ms = Utc::now().timestamp_millis();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        db::kv_put_if_absent(&self.pool, key, value, now_ms, now_ms.saturating_add(ttl_ms))
            .await
            .map_err(storage)
    }

    async fn get(&self, key: &str) -> ScoutResult<Option<String>> {
        db::kv_get(&self.pool, key, Utc::now().timestamp_millis())
            .await
            .map_err(storage)
    }

    async fn delete(&self, key: &str) -> ScoutResult<()> {
        db::kv_delete(&self.pool, key).await.map_err(storage)
    }

    async fn purge_expired(&self) -> ScoutResult<u64> {
        db::kv_purge_expired(&self.pool, Utc::now().timestamp_millis())
            .await
            .map_err(storage)
    }
}
