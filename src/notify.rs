//! User-visible side effects: SMS and automated replies, each recorded in the
//! notification audit log.
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};

use crate::config;
use crate::db::{self, Pool};
use crate::dedupe::DedupeCache;
use crate::error::{ScoutError, ScoutResult};
use crate::gates;
use crate::model::{Channel, Item, NotificationRecord, Outcome, Rule, SuppressReason, User};

/// Longest item excerpt copied into an SMS body.
const SMS_EXCERPT_CHARS: usize = 200;

#[async_trait]
pub trait SmsGateway: Send + Sync {
    /// Send `body` to `to`, returning the gateway's message id.
    async fn send(&self, to: &str, body: &str) -> ScoutResult<String>;
}

#[async_trait]
pub trait ReplyPoster: Send + Sync {
    /// Post `text` as a reply to `in_reply_to`, returning the new post id.
    async fn post_reply(&self, in_reply_to: &str, text: &str) -> ScoutResult<String>;
}

#[derive(Debug, Deserialize)]
struct TwilioMessage {
    sid: String,
}

#[derive(Clone)]
pub struct TwilioSms {
    http: Client,
    base_url: Url,
    account_sid: String,
    auth_token: String,
    from_number: String,
}

impl fmt::Debug for TwilioSms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TwilioSms")
            .field("base_url", &self.base_url)
            .field("from_number", &self.from_number)
            .finish_non_exhaustive()
    }
}

impl TwilioSms {
    pub fn from_config(cfg: &config::Sms) -> ScoutResult<Self> {
        let normalized = if cfg.base_url.ends_with('/') {
            cfg.base_url.clone()
        } else {
            format!("{}/", cfg.base_url)
        };
        let base_url = Url::parse(&normalized)
            .map_err(|e| ScoutError::Configuration(format!("invalid sms base_url: {}", e)))?;
        let http = Client::builder()
            .user_agent("keyword-scout/0.1")
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .map_err(|e| ScoutError::Configuration(format!("http client: {}", e)))?;
        Ok(Self {
            http,
            base_url,
            account_sid: cfg.account_sid.clone(),
            auth_token: cfg.auth_token.clone(),
            from_number: cfg.from_number.clone(),
        })
    }
}

#[async_trait]
impl SmsGateway for TwilioSms {
    async fn send(&self, to: &str, body: &str) -> ScoutResult<String> {
        let url = self
            .base_url
            .join(&format!("2010-04-01/Accounts/{}/Messages.json", self.account_sid))
            .map_err(|e| ScoutError::Configuration(format!("invalid sms endpoint: {}", e)))?;
        let res = self
            .http
            .post(url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&[("To", to), ("From", self.from_number.as_str()), ("Body", body)])
            .send()
            .await?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(ScoutError::Upstream {
                status: status.as_u16(),
                body,
            });
        }
        let msg: TwilioMessage = res.json().await?;
        Ok(msg.sid)
    }
}

/// What to deliver for a match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Content {
    Sms(String),
    Reply(String),
}

impl Content {
    pub fn channel(&self) -> Channel {
        match self {
            Content::Sms(_) => Channel::Sms,
            Content::Reply(_) => Channel::Reply,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchResult {
    pub outcome: Outcome,
    pub channel: Channel,
    pub reason: Option<SuppressReason>,
    pub external_id: Option<String>,
}

impl DispatchResult {
    fn suppressed(channel: Channel, reason: SuppressReason) -> Self {
        Self {
            outcome: Outcome::Suppressed,
            channel,
            reason: Some(reason),
            external_id: None,
        }
    }

    fn failed(channel: Channel) -> Self {
        Self {
            outcome: Outcome::Failed,
            channel,
            reason: None,
            external_id: None,
        }
    }
}

pub fn format_sms(rule: &Rule, item: &Item, url_template: &str) -> String {
    let mut excerpt: String = item.text.chars().take(SMS_EXCERPT_CHARS).collect();
    if item.text.chars().count() > SMS_EXCERPT_CHARS {
        excerpt.push('…');
    }
    format!(
        "New match for \"{}\": {}\n{}",
        rule.query_string.trim(),
        excerpt,
        url_template.replace("{id}", &item.id)
    )
}

#[derive(Clone)]
pub struct NotificationDispatcher {
    pool: Pool,
    dedupe: DedupeCache,
    sms: Arc<dyn SmsGateway>,
    replies: Arc<dyn ReplyPoster>,
}

impl NotificationDispatcher {
    pub fn new(
        pool: Pool,
        dedupe: DedupeCache,
        sms: Arc<dyn SmsGateway>,
        replies: Arc<dyn ReplyPoster>,
    ) -> Self {
        Self {
            pool,
            dedupe,
            sms,
            replies,
        }
    }

    pub fn dedupe(&self) -> &DedupeCache {
        &self.dedupe
    }

    /// Claim, gate, send, record. One send is reserved from the quota before
    /// sending and refunded if the send fails; `user.quota_used` tracks the
    /// stored count so later items in the same cycle see it.
    #[instrument(skip_all, fields(item_id = %item.id, owner_id = %user.id))]
    pub async fn dispatch(
        &self,
        item: &Item,
        rule: &Rule,
        user: &mut User,
        content: Content,
        now: DateTime<Utc>,
    ) -> DispatchResult {
        if !self.dedupe.try_claim(&item.id, &user.id).await {
            return DispatchResult::suppressed(Channel::StoredOnly, SuppressReason::AlreadyClaimed);
        }

        if let Err(err) = db::touch_rule_last_match(&self.pool, rule.id, now).await {
            warn!(?err, rule_id = rule.id, "failed to update rule last_match_at");
        }

        let gated = if gates::is_quiet(user, now) {
            Some(SuppressReason::QuietHours)
        } else if !gates::quota_allows(user) {
            Some(SuppressReason::OverQuota)
        } else {
            match db::reserve_quota(&self.pool, &user.id).await {
                Ok(Some(used)) => {
                    user.quota_used = used;
                    None
                }
                Ok(None) => {
                    // Another dispatch for this user took the last send.
                    user.quota_used = user.quota_limit;
                    Some(SuppressReason::OverQuota)
                }
                Err(err) => {
                    error!(?err, "quota reservation failed");
                    let channel = content.channel();
                    let detail = format!("quota reservation failed: {}", err);
                    self.record(item, rule, &user.id, channel, Outcome::Failed, Some(&detail), now)
                        .await;
                    return DispatchResult::failed(channel);
                }
            }
        };
        if let Some(reason) = gated {
            info!(reason = reason.as_str(), "notification stored only");
            self.record(item, rule, &user.id, Channel::StoredOnly, Outcome::Suppressed, Some(reason.as_str()), now)
                .await;
            return DispatchResult::suppressed(Channel::StoredOnly, reason);
        }

        let channel = content.channel();
        let sent = match &content {
            Content::Sms(body) => self.send_sms(user, body).await,
            Content::Reply(text) => self.replies.post_reply(&item.id, text).await,
        };

        match sent {
            Ok(external_id) => {
                self.record(item, rule, &user.id, channel, Outcome::Sent, Some(&external_id), now)
                    .await;
                info!(channel = channel.as_str(), %external_id, "notification sent");
                DispatchResult {
                    outcome: Outcome::Sent,
                    channel,
                    reason: None,
                    external_id: Some(external_id),
                }
            }
            Err(err) => {
                warn!(?err, channel = channel.as_str(), "notification failed");
                match db::refund_quota(&self.pool, &user.id).await {
                    Ok(used) => user.quota_used = used,
                    Err(refund_err) => error!(?refund_err, "failed to refund quota after failed send"),
                }
                let detail = err.to_string();
                self.record(item, rule, &user.id, channel, Outcome::Failed, Some(&detail), now)
                    .await;
                DispatchResult::failed(channel)
            }
        }
    }

    async fn send_sms(&self, user: &User, body: &str) -> ScoutResult<String> {
        let to = user
            .phone
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| ScoutError::Validation(vec![format!("user {} has no phone", user.id)]))?;
        self.sms.send(to, body).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn record(
        &self,
        item: &Item,
        rule: &Rule,
        owner_id: &str,
        channel: Channel,
        outcome: Outcome,
        detail: Option<&str>,
        now: DateTime<Utc>,
    ) {
        let record = NotificationRecord {
            item_id: item.id.clone(),
            rule_id: rule.id,
            owner_id: owner_id.to_string(),
            channel,
            outcome,
            detail: detail.map(str::to_string),
            created_at: now,
        };
        if let Err(err) = db::insert_notification(&self.pool, &record).await {
            error!(?err, item_id = %item.id, "failed to persist notification record");
        }
    }
}
