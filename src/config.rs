//! Configuration loader and validator for the keyword scout.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::error::ScoutError;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

impl From<ConfigError> for ScoutError {
    fn from(err: ConfigError) -> Self {
        ScoutError::Configuration(err.to_string())
    }
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub app: App,
    pub search: Search,
    pub sms: Sms,
    #[serde(default)]
    pub ai: Option<Ai>,
    pub server: Server,
}

/// Scheduler and pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub scan_interval_secs: u64,
    #[serde(default = "default_worker_slots")]
    pub worker_slots: usize,
    #[serde(default = "default_owner_budget_secs")]
    pub owner_budget_secs: u64,
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    #[serde(default = "default_cursor_lookback_secs")]
    pub cursor_lookback_secs: u64,
    #[serde(default = "default_usage_reset_secs")]
    pub usage_reset_secs: u64,
    pub item_url_template: String,
}

/// Search provider settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Search {
    pub base_url: String,
    pub api_keys: Vec<String>,
    pub max_results: u32,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    #[serde(default = "default_max_query_len")]
    pub max_query_len: usize,
    #[serde(default = "default_language")]
    pub language: String,
    pub cost_per_item: f64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub retry: Retry,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Retry {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for Retry {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
        }
    }
}

/// SMS gateway settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Sms {
    pub base_url: String,
    pub account_sid: String,
    pub auth_token: String,
    pub from_number: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

/// Optional relevance/reply model settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ai {
    pub enabled: bool,
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    #[serde(default = "default_freshness_minutes")]
    pub freshness_minutes: i64,
    #[serde(default = "default_max_reply_chars")]
    pub max_reply_chars: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

/// HTTP surface settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Server {
    pub bind: String,
    pub cron_secret: String,
    pub webhook_secret: String,
    #[serde(default = "default_replay_ttl_secs")]
    pub replay_ttl_secs: u64,
}

fn default_worker_slots() -> usize {
    4
}
fn default_owner_budget_secs() -> u64 {
    120
}
fn default_lock_ttl_secs() -> u64 {
    300
}
fn default_cursor_lookback_secs() -> u64 {
    300
}
fn default_usage_reset_secs() -> u64 {
    3600
}
fn default_max_pages() -> u32 {
    3
}
fn default_max_query_len() -> usize {
    512
}
fn default_language() -> String {
    "en".into()
}
fn default_timeout_secs() -> u64 {
    20
}
fn default_freshness_minutes() -> i64 {
    60
}
fn default_max_reply_chars() -> usize {
    240
}
fn default_replay_ttl_secs() -> u64 {
    600
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.app.resolved_data_dir())
    }

    pub fn ai_enabled(&self) -> bool {
        self.ai.as_ref().map(|ai| ai.enabled).unwrap_or(false)
    }
}

impl App {
    /// `data_dir` with a leading `~/` expanded against `$HOME`.
    pub fn resolved_data_dir(&self) -> String {
        match self.data_dir.strip_prefix("~/") {
            Some(rest) => match std::env::var("HOME") {
                Ok(home) => format!("{}/{}", home.trim_end_matches('/'), rest),
                Err(_) => self.data_dir.clone(),
            },
            None => self.data_dir.clone(),
        }
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn owner_budget(&self) -> Duration {
        Duration::from_secs(self.owner_budget_secs)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.scan_interval_secs == 0 {
        return Err(ConfigError::Invalid("app.scan_interval_secs must be > 0"));
    }
    if cfg.app.worker_slots == 0 {
        return Err(ConfigError::Invalid("app.worker_slots must be > 0"));
    }
    // The hard per-owner limit is twice the budget; the lock must outlive it.
    if cfg.app.lock_ttl_secs <= cfg.app.owner_budget_secs.saturating_mul(2) {
        return Err(ConfigError::Invalid(
            "app.lock_ttl_secs must exceed twice app.owner_budget_secs",
        ));
    }
    if !cfg.app.item_url_template.contains("{id}") {
        return Err(ConfigError::Invalid(
            "app.item_url_template must contain {id}",
        ));
    }

    if cfg.search.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("search.base_url must be non-empty"));
    }
    if cfg.search.api_keys.is_empty() {
        return Err(ConfigError::Invalid("search.api_keys must be non-empty"));
    }
    if cfg.search.api_keys.iter().any(|k| k.trim().is_empty()) {
        return Err(ConfigError::Invalid("search.api_keys entries must be non-empty"));
    }
    if cfg.search.max_results == 0 {
        return Err(ConfigError::Invalid("search.max_results must be > 0"));
    }
    if cfg.search.max_pages == 0 {
        return Err(ConfigError::Invalid("search.max_pages must be > 0"));
    }
    if cfg.search.retry.max_attempts == 0 {
        return Err(ConfigError::Invalid("search.retry.max_attempts must be > 0"));
    }

    if cfg.sms.account_sid.trim().is_empty() {
        return Err(ConfigError::Invalid("sms.account_sid must be non-empty"));
    }
    if cfg.sms.auth_token.trim().is_empty() {
        return Err(ConfigError::Invalid("sms.auth_token must be non-empty"));
    }
    if cfg.sms.from_number.trim().is_empty() {
        return Err(ConfigError::Invalid("sms.from_number must be non-empty"));
    }

    if let Some(ai) = cfg.ai.as_ref().filter(|ai| ai.enabled) {
        if ai.api_key.trim().is_empty() {
            return Err(ConfigError::Invalid("ai.api_key must be non-empty when enabled"));
        }
        if ai.model.trim().is_empty() {
            return Err(ConfigError::Invalid("ai.model must be non-empty when enabled"));
        }
        if ai.max_reply_chars == 0 {
            return Err(ConfigError::Invalid("ai.max_reply_chars must be > 0"));
        }
    }

    if cfg.server.cron_secret.trim().is_empty() {
        return Err(ConfigError::Invalid("server.cron_secret must be non-empty"));
    }
    if cfg.server.webhook_secret.trim().is_empty() {
        return Err(ConfigError::Invalid("server.webhook_secret must be non-empty"));
    }

    Ok(())
}

/// Example configuration document.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  scan_interval_secs: 120
  worker_slots: 4
  owner_budget_secs: 120
  lock_ttl_secs: 300
  cursor_lookback_secs: 300
  usage_reset_secs: 3600
  item_url_template: "https://x.com/i/status/{id}"

search:
  base_url: "https://api.example-search.io/"
  api_keys:
    - "SEARCH_KEY_PRIMARY"
    - "SEARCH_KEY_SECONDARY"
  max_results: 20
  max_pages: 3
  max_query_len: 512
  language: "en"
  cost_per_item: 0.15
  timeout_secs: 20
  retry:
    max_attempts: 4
    base_delay_ms: 500
    max_delay_ms: 8000

sms:
  base_url: "https://api.twilio.com/"
  account_sid: "ACXXXXXXXXXXXXXXXX"
  auth_token: "TWILIO_AUTH_TOKEN"
  from_number: "+15550000000"

ai:
  enabled: true
  base_url: "https://api.openai.com/"
  api_key: "OPENAI_API_KEY"
  model: "gpt-4o-mini"
  freshness_minutes: 60
  max_reply_chars: 240
  timeout_secs: 20

server:
  bind: "0.0.0.0:8080"
  cron_secret: "CRON_SECRET"
  webhook_secret: "WEBHOOK_SECRET"
  replay_ttl_secs: 600
"#
}
