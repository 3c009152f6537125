use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuleStatus {
    Active,
    Paused,
}

impl RuleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleStatus::Active => "active",
            RuleStatus::Paused => "paused",
        }
    }

    pub fn parse_status(s: &str) -> Option<Self> {
        match s {
            "active" => Some(RuleStatus::Active),
            "paused" => Some(RuleStatus::Paused),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotifyMode {
    Sms,
    Reply,
}

impl NotifyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotifyMode::Sms => "sms",
            NotifyMode::Reply => "reply",
        }
    }

    pub fn parse_mode(s: &str) -> Option<Self> {
        match s {
            "sms" => Some(NotifyMode::Sms),
            "reply" => Some(NotifyMode::Reply),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Sms,
    Reply,
    StoredOnly,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Sms => "sms",
            Channel::Reply => "reply",
            Channel::StoredOnly => "stored_only",
        }
    }

    pub fn parse_channel(s: &str) -> Option<Self> {
        match s {
            "sms" => Some(Channel::Sms),
            "reply" => Some(Channel::Reply),
            "stored_only" => Some(Channel::StoredOnly),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Sent,
    Suppressed,
    Failed,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Sent => "sent",
            Outcome::Suppressed => "suppressed",
            Outcome::Failed => "failed",
        }
    }

    pub fn parse_outcome(s: &str) -> Option<Self> {
        match s {
            "sent" => Some(Outcome::Sent),
            "suppressed" => Some(Outcome::Suppressed),
            "failed" => Some(Outcome::Failed),
            _ => None,
        }
    }
}

/// Why a dispatch did not reach the channel.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SuppressReason {
    AlreadyClaimed,
    QuietHours,
    OverQuota,
}

impl SuppressReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuppressReason::AlreadyClaimed => "already_claimed",
            SuppressReason::QuietHours => "quiet_hours",
            SuppressReason::OverQuota => "over_quota",
        }
    }
}

/// Keyword rule owned by a user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Rule {
    pub id: i64,
    pub owner_id: String,
    pub query_string: String,
    pub status: RuleStatus,
    pub created_at: DateTime<Utc>,
    pub last_match_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct BusinessProfile {
    pub name: String,
    pub summary: String,
    pub safe_topics: Vec<String>,
    pub tone: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub quota_used: i64,
    pub quota_limit: i64,
    pub quiet_start: Option<String>,
    pub quiet_end: Option<String>,
    pub utc_offset_minutes: i32,
    pub notify_mode: NotifyMode,
    pub business_profile: Option<BusinessProfile>,
}

/// Normalized post returned by the search provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Item {
    pub id: String,
    pub text: String,
    pub author_id: String,
    #[serde(default)]
    pub author_handle: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationRecord {
    pub item_id: String,
    pub rule_id: i64,
    pub owner_id: String,
    pub channel: Channel,
    pub outcome: Outcome,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}
