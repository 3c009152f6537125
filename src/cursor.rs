//! Per-owner "since" watermark.
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, instrument};

use crate::db::{self, Pool};
use crate::error::{storage, ScoutResult};

#[derive(Debug, Clone)]
pub struct CursorStore {
    pool: Pool,
    lookback: Duration,
}

impl CursorStore {
    pub fn new(pool: Pool, lookback: std::time::Duration) -> Self {
        let lookback = Duration::from_std(lookback).unwrap_or_else(|_| Duration::minutes(5));
        Self { pool, lookback }
    }

    /// Stored watermark, if this owner has been scanned before.
    pub async fn get(&self, owner_id: &str) -> ScoutResult<Option<DateTime<Utc>>> {
        let ms = db::get_cursor_ms(&self.pool, owner_id)
            .await
            .map_err(storage)?;
        Ok(ms.and_then(DateTime::from_timestamp_millis))
    }

    /// Watermark to scan from. An owner with no cursor starts a short
    /// lookback before `now` instead of scanning all history.
    #[instrument(skip(self))]
    pub async fn since_or_seed(&self, owner_id: &str, now: DateTime<Utc>) -> ScoutResult<DateTime<Utc>> {
        match self.get(owner_id).await? {
            Some(since) => Ok(since),
            None => {
                let seeded = now - self.lookback;
                debug!(%seeded, "seeding cursor");
                self.set(owner_id, seeded).await
            }
        }
    }

    /// Move the watermark forward. Earlier values leave it where it is; the
    /// effective stored value is returned.
    pub async fn set(&self, owner_id: &str, since_at: DateTime<Utc>) -> ScoutResult<DateTime<Utc>> {
        let stored = db::advance_cursor_ms(&self.pool, owner_id, since_at.timestamp_millis())
            .await
            .map_err(storage)?;
        Ok(DateTime::from_timestamp_millis(stored).unwrap_or(since_at))
    }
}
