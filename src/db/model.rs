//! Row view models used by repositories.
//!
//! Keep these structs focused on the data written or returned by queries.
//! Policy lives in the pipeline modules.

use chrono::{DateTime, Utc};

use crate::model::NotifyMode;

/// Fields an account-management collaborator writes for a user. Used by
/// operators and tests to seed the store.
#[derive(Debug, Clone)]
pub struct UserSeed {
    pub id: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub quota_used: i64,
    pub quota_limit: i64,
    pub quiet_start: Option<String>,
    pub quiet_end: Option<String>,
    pub utc_offset_minutes: i32,
    pub notify_mode: NotifyMode,
    pub business_profile_id: Option<i64>,
}

impl UserSeed {
    pub fn new(id: impl Into<String>, quota_limit: i64) -> Self {
        Self {
            id: id.into(),
            phone: None,
            email: None,
            quota_used: 0,
            quota_limit,
            quiet_start: None,
            quiet_end: None,
            utc_offset_minutes: 0,
            notify_mode: NotifyMode::Sms,
            business_profile_id: None,
        }
    }
}

/// One AI relevance/reply decision.
#[derive(Debug, Clone)]
pub struct AiReplyLog {
    pub item_id: String,
    pub rule_id: i64,
    pub owner_id: String,
    pub relevant: bool,
    /// The model call failed; `relevant` is not a verdict.
    pub errored: bool,
    pub reason: String,
    pub reply_text: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Lock row as stored; times are epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRow {
    pub lock_key: String,
    pub owner_id: String,
    pub holder_id: String,
    pub acquired_at_ms: i64,
    pub expires_at_ms: i64,
}
