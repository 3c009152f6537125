//! At-most-once claims on `(item_id, owner_id)`.
use chrono::Utc;
use tracing::error;

use crate::db::{self, Pool};

#[derive(Debug, Clone)]
pub struct DedupeCache {
    pool: Pool,
}

impl DedupeCache {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// True only for the first claim of the pair. A storage failure counts as
    /// a lost claim: the item is suppressed rather than risk a second send.
    pub async fn try_claim(&self, item_id: &str, owner_id: &str) -> bool {
        match db::insert_dedupe_claim(&self.pool, item_id, owner_id, Utc::now()).await {
            Ok(claimed) => claimed,
            Err(err) => {
                error!(?err, item_id, owner_id, "dedupe claim failed; suppressing");
                false
            }
        }
    }

    /// Read-only check used to skip paid work for items already handled.
    /// Errors read as "not claimed" since `try_claim` still guards the send.
    pub async fn is_claimed(&self, item_id: &str, owner_id: &str) -> bool {
        db::dedupe_claim_exists(&self.pool, item_id, owner_id)
            .await
            .unwrap_or(false)
    }
}
