//! Push ingestion: a signed match event enters the same
//! dedupe, quiet hours, quota, send sequence as a polled item.
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{info, instrument};

use crate::config;
use crate::db::{self, Pool};
use crate::error::{storage, ScoutError, ScoutResult};
use crate::model::{Item, RuleStatus};
use crate::notify::{format_sms, Content, DispatchResult, NotificationDispatcher};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-scout-signature";
pub const MATCH_EVENT: &str = "match";

/// `sha256=<hex>` signature over `body`.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Stable id for a delivery: the body digest, independent of how the
/// signature header was spelled.
pub fn delivery_id(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

/// Constant-time check of a `sha256=<hex>` header value.
pub fn verify_signature(secret: &str, body: &[u8], header: Option<&str>) -> bool {
    let Some(hex_sig) = header.map(str::trim).and_then(|h| h.strip_prefix("sha256=")) else {
        return false;
    };
    let signature = match hex::decode(hex_sig) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(body);
    mac.verify_slice(&signature).is_ok()
}

#[derive(Debug, Default, Deserialize)]
pub struct MatchEvent {
    #[serde(default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub item: Option<ItemPayload>,
    #[serde(default)]
    pub rule: Option<RulePayload>,
    #[serde(default)]
    pub user: Option<UserPayload>,
    #[serde(default)]
    pub matched_at: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ItemPayload {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub author_id: Option<String>,
    #[serde(default)]
    pub author_handle: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RulePayload {
    #[serde(default)]
    pub id: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UserPayload {
    #[serde(default)]
    pub id: Option<String>,
}

/// A match event that passed schema validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidMatch {
    pub item: Item,
    pub rule_id: i64,
    pub user_id: String,
    pub matched_at: DateTime<Utc>,
}

fn required<'a>(value: &'a Option<String>, field: &str, errors: &mut Vec<String>) -> Option<&'a str> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Some(v),
        _ => {
            errors.push(format!("{} is required", field));
            None
        }
    }
}

fn timestamp(value: &Option<String>, field: &str, errors: &mut Vec<String>) -> Option<DateTime<Utc>> {
    let raw = required(value, field, errors)?;
    match DateTime::parse_from_rfc3339(raw) {
        Ok(ts) => Some(ts.with_timezone(&Utc)),
        Err(_) => {
            errors.push(format!("{} must be an RFC 3339 timestamp", field));
            None
        }
    }
}

impl MatchEvent {
    /// Collect every schema problem rather than stopping at the first.
    pub fn validate(&self) -> Result<ValidMatch, Vec<String>> {
        let mut errors = Vec::new();

        match self.event_type.as_deref() {
            Some(MATCH_EVENT) => {}
            Some(other) => errors.push(format!("event_type {:?} is not supported", other)),
            None => errors.push("event_type is required".into()),
        }

        let empty_item = ItemPayload::default();
        if self.item.is_none() {
            errors.push("item is required".into());
        }
        let item = self.item.as_ref().unwrap_or(&empty_item);
        let id = required(&item.id, "item.id", &mut errors);
        let text = required(&item.text, "item.text", &mut errors);
        let author_id = required(&item.author_id, "item.author_id", &mut errors);
        let created_at = timestamp(&item.created_at, "item.created_at", &mut errors);

        let rule_id = match self.rule.as_ref().and_then(|r| r.id) {
            Some(id) if id > 0 => Some(id),
            Some(_) => {
                errors.push("rule.id must be positive".into());
                None
            }
            None => {
                errors.push("rule.id is required".into());
                None
            }
        };
        let user_id = match self.user.as_ref() {
            Some(user) => required(&user.id, "user.id", &mut errors),
            None => {
                errors.push("user.id is required".into());
                None
            }
        };
        let matched_at = timestamp(&self.matched_at, "matched_at", &mut errors);

        match (id, text, author_id, created_at, rule_id, user_id, matched_at) {
            (Some(id), Some(text), Some(author_id), Some(created_at), Some(rule_id), Some(user_id), Some(matched_at))
                if errors.is_empty() =>
            {
                Ok(ValidMatch {
                    item: Item {
                        id: id.to_string(),
                        text: text.to_string(),
                        author_id: author_id.to_string(),
                        author_handle: item.author_handle.clone(),
                        created_at,
                    },
                    rule_id,
                    user_id: user_id.to_string(),
                    matched_at,
                })
            }
            _ => Err(errors),
        }
    }
}

/// Resolve the referenced rule and user, then dispatch as an SMS.
#[instrument(skip_all, fields(item_id = %event.item.id, owner_id = %event.user_id))]
pub async fn process_match(
    pool: &Pool,
    dispatcher: &NotificationDispatcher,
    app: &config::App,
    event: &ValidMatch,
) -> ScoutResult<DispatchResult> {
    let rule = db::fetch_rule(pool, event.rule_id)
        .await
        .map_err(storage)?
        .ok_or_else(|| ScoutError::Validation(vec![format!("rule {} does not exist", event.rule_id)]))?;
    if rule.owner_id != event.user_id {
        return Err(ScoutError::Validation(vec![format!(
            "rule {} is not owned by user {}",
            rule.id, event.user_id
        )]));
    }
    if rule.status != RuleStatus::Active {
        return Err(ScoutError::Validation(vec![format!("rule {} is not active", rule.id)]));
    }
    let mut user = db::fetch_user(pool, &event.user_id)
        .await
        .map_err(storage)?
        .ok_or_else(|| ScoutError::Validation(vec![format!("user {} does not exist", event.user_id)]))?;

    let body = format_sms(&rule, &event.item, &app.item_url_template);
    let result = dispatcher
        .dispatch(&event.item, &rule, &mut user, Content::Sms(body), event.matched_at)
        .await;
    info!(outcome = result.outcome.as_str(), "webhook match processed");
    Ok(result)
}
