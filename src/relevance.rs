//! Optional AI stage: decide whether a match is worth acting on and draft a
//! reply in the business's voice.
//!
//! The model sits behind `ReplyEngine`. `AiStage` adds the deterministic
//! parts around it: local hard exclusions, per-call timeouts, the length
//! budget and the emoji policy.
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, instrument};

use crate::config;
use crate::error::{ScoutError, ScoutResult};
use crate::model::{BusinessProfile, Item};

static PROMO_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(giveaway|promo\s*code|discount\s*code|use\s+code|dm\s+(me|us)\s+for|follow\s+(and|&|\+)\s+(rt|retweet)|airdrop|limited\s+offer|click\s+the\s+link)\b",
    )
    .expect("Invalid promo regex")
});

static LINK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"https?://\S+").expect("Invalid link regex"));

static EMOJI_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[\p{Extended_Pictographic}\x{FE0F}\x{200D}]").expect("Invalid emoji regex")
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relevance {
    pub relevant: bool,
    pub reason: String,
}

impl Relevance {
    fn rejected(reason: &str) -> Self {
        Self {
            relevant: false,
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
pub trait ReplyEngine: Send + Sync {
    async fn is_relevant(&self, text: &str, profile: &BusinessProfile) -> ScoutResult<Relevance>;

    async fn draft(&self, text: &str, profile: &BusinessProfile) -> ScoutResult<String>;

    /// Rewrite `reply` to fit `max_chars` while keeping its core point.
    async fn shorten(&self, reply: &str, max_chars: usize, allow_emoji: bool) -> ScoutResult<String>;
}

/// Exclusions decided locally, before any model call.
pub fn hard_exclusion(item: &Item, now: DateTime<Utc>, freshness: chrono::Duration) -> Option<&'static str> {
    if now - item.created_at > freshness {
        return Some("stale");
    }
    if PROMO_RE.is_match(&item.text) {
        return Some("promotional");
    }
    if LINK_RE.find_iter(&item.text).count() >= 3 {
        return Some("link_heavy");
    }
    None
}

pub fn has_emoji(text: &str) -> bool {
    EMOJI_RE.is_match(text)
}

pub fn strip_emoji(text: &str) -> String {
    let stripped = EMOJI_RE.replace_all(text, "");
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Cut to at most `max_chars`, preferring the last word boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    match cut.rfind(char::is_whitespace) {
        Some(pos) if pos > 0 => cut[..pos].trim_end().to_string(),
        _ => cut,
    }
}

pub struct AiStage {
    engine: Arc<dyn ReplyEngine>,
    freshness: chrono::Duration,
    timeout: Duration,
    max_reply_chars: usize,
}

impl fmt::Debug for AiStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AiStage")
            .field("freshness", &self.freshness)
            .field("timeout", &self.timeout)
            .field("max_reply_chars", &self.max_reply_chars)
            .finish_non_exhaustive()
    }
}

impl AiStage {
    pub fn new(
        engine: Arc<dyn ReplyEngine>,
        freshness: chrono::Duration,
        timeout: Duration,
        max_reply_chars: usize,
    ) -> Self {
        Self {
            engine,
            freshness,
            timeout,
            max_reply_chars,
        }
    }

    pub fn from_config(cfg: &config::Ai, engine: Arc<dyn ReplyEngine>) -> Self {
        Self::new(
            engine,
            chrono::Duration::minutes(cfg.freshness_minutes),
            Duration::from_secs(cfg.timeout_secs),
            cfg.max_reply_chars,
        )
    }

    async fn bounded<T>(&self, what: &'static str, fut: impl Future<Output = ScoutResult<T>>) -> ScoutResult<T> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| ScoutError::Timeout(what))?
    }

    #[instrument(skip_all, fields(item_id = %item.id))]
    pub async fn evaluate(
        &self,
        item: &Item,
        profile: &BusinessProfile,
        now: DateTime<Utc>,
    ) -> ScoutResult<Relevance> {
        if let Some(reason) = hard_exclusion(item, now, self.freshness) {
            debug!(reason, "hard exclusion");
            return Ok(Relevance::rejected(reason));
        }
        self.bounded("relevance model", self.engine.is_relevant(&item.text, profile))
            .await
    }

    /// Draft a reply within the length budget. Emoji are only kept when the
    /// source text uses them.
    #[instrument(skip_all)]
    pub async fn draft(&self, source_text: &str, profile: &BusinessProfile) -> ScoutResult<String> {
        let allow_emoji = has_emoji(source_text);
        let mut reply = self
            .bounded("reply model", self.engine.draft(source_text, profile))
            .await?;
        if !allow_emoji {
            reply = strip_emoji(&reply);
        }
        if reply.chars().count() > self.max_reply_chars {
            debug!(len = reply.chars().count(), "draft over budget; shortening");
            reply = self
                .bounded(
                    "shorten model",
                    self.engine.shorten(&reply, self.max_reply_chars, allow_emoji),
                )
                .await?;
            if !allow_emoji {
                reply = strip_emoji(&reply);
            }
        }
        let reply = truncate_chars(reply.trim(), self.max_reply_chars);
        if reply.is_empty() {
            return Err(ScoutError::Upstream {
                status: 200,
                body: "model returned an empty reply".into(),
            });
        }
        Ok(reply)
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

/// `ReplyEngine` backed by an OpenAI-compatible chat completions endpoint.
#[derive(Clone)]
pub struct ChatReplyEngine {
    http: Client,
    endpoint: Url,
    api_key: String,
    model: String,
}

impl fmt::Debug for ChatReplyEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatReplyEngine")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

fn profile_context(profile: &BusinessProfile) -> String {
    let topics = if profile.safe_topics.is_empty() {
        "(none listed)".to_string()
    } else {
        profile.safe_topics.join(", ")
    };
    format!(
        "Business: {}\nSummary: {}\nSafe topics: {}\nTone: {}",
        profile.name,
        profile.summary,
        topics,
        profile.tone.as_deref().unwrap_or("friendly, helpful")
    )
}

impl ChatReplyEngine {
    pub fn from_config(cfg: &config::Ai) -> ScoutResult<Self> {
        let normalized = if cfg.base_url.ends_with('/') {
            cfg.base_url.clone()
        } else {
            format!("{}/", cfg.base_url)
        };
        let endpoint = Url::parse(&normalized)
            .and_then(|u| u.join("v1/chat/completions"))
            .map_err(|e| ScoutError::Configuration(format!("invalid ai base_url: {}", e)))?;
        let http = Client::builder()
            .user_agent("keyword-scout/0.1")
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .map_err(|e| ScoutError::Configuration(format!("http client: {}", e)))?;
        Ok(Self {
            http,
            endpoint,
            api_key: cfg.api_key.clone(),
            model: cfg.model.clone(),
        })
    }

    async fn complete(&self, system: &str, user: &str, json_mode: bool) -> ScoutResult<String> {
        let mut body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
            "temperature": 0.4,
        });
        if json_mode {
            body["response_format"] = json!({ "type": "json_object" });
        }
        let res = self
            .http
            .post(self.endpoint.clone())
            .bearer_auth(&self.api_key)
            .json(&body)
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
        let parsed: ChatResponse = res.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .ok_or_else(|| ScoutError::Upstream {
                status: status.as_u16(),
                body: "model response had no content".into(),
            })
    }
}

#[async_trait]
impl ReplyEngine for ChatReplyEngine {
    async fn is_relevant(&self, text: &str, profile: &BusinessProfile) -> ScoutResult<Relevance> {
        let system = format!(
            "You screen social posts for a business.\n{}\n\
             Answer with JSON {{\"relevant\": bool, \"reason\": string}}. \
             A post is relevant only if the business could genuinely help the author \
             and the topic is within its safe topics. Always mark as not relevant: \
             promotional or spam posts, politics, tragedies, disasters or deaths, \
             and posts where a brand reply would be intrusive.",
            profile_context(profile)
        );
        let raw = self.complete(&system, text, true).await?;
        serde_json::from_str::<Relevance>(&raw).map_err(|e| ScoutError::Upstream {
            status: 200,
            body: format!("unparseable relevance verdict: {}", e),
        })
    }

    async fn draft(&self, text: &str, profile: &BusinessProfile) -> ScoutResult<String> {
        let system = format!(
            "You write short public replies on behalf of a business.\n{}\n\
             Reply to the post directly, be specific and useful, never salesy, \
             no hashtags, no links.",
            profile_context(profile)
        );
        self.complete(&system, text, false).await
    }

    async fn shorten(&self, reply: &str, max_chars: usize, allow_emoji: bool) -> ScoutResult<String> {
        let emoji_rule = if allow_emoji {
            "Emoji are allowed."
        } else {
            "Do not use emoji."
        };
        let system = format!(
            "Rewrite the reply in at most {} characters. Keep its core point. {}",
            max_chars, emoji_rule
        );
        self.complete(&system, reply, false).await
    }
}
