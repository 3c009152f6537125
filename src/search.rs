//! Search provider client: query construction, page validation and windowed
//! paging on top of the credential pool.
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::config;
use crate::credentials::{Credential, CredentialPool};
use crate::error::{ScoutError, ScoutResult};
use crate::model::{Item, Rule};
use crate::notify::ReplyPoster;

/// Filters appended to every query.
const QUERY_SUFFIX: &str = "-is:retweet -is:quote -is:reply";

/// Page-size parameter names, tried in order when the provider ignores one.
pub const PAGE_SIZE_PARAMS: [&str; 3] = ["max_results", "count", "limit"];

/// Render one rule as a provider term: `@name` becomes an author filter,
/// anything else an exact phrase.
pub fn rule_term(query: &str) -> Option<String> {
    let trimmed = query.trim();
    if let Some(handle) = trimmed.strip_prefix('@') {
        let handle = handle.trim();
        if !handle.is_empty() && handle.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Some(format!("from:{}", handle));
        }
        return None;
    }
    let phrase = normalize_phrase(trimmed);
    if phrase.is_empty() {
        return None;
    }
    Some(format!("\"{}\"", phrase))
}

/// Quotes dropped and whitespace runs collapsed, as the phrase is searched.
fn normalize_phrase(raw: &str) -> String {
    raw.split(|c: char| c == '"' || c.is_whitespace())
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn assemble(terms: &[String], language: &str) -> String {
    format!("({}) {} lang:{}", terms.join(" OR "), QUERY_SUFFIX, language)
}

/// Combine rules into a single OR expression with the mandatory suffix.
pub fn build_query(rules: &[Rule], language: &str) -> Option<String> {
    let terms: Vec<String> = rules
        .iter()
        .filter_map(|r| rule_term(&r.query_string))
        .collect();
    if terms.is_empty() {
        return None;
    }
    Some(assemble(&terms, language))
}

/// Greedily pack rules into groups whose combined query stays within
/// `max_len`. A rule too long to fit even on its own is dropped.
pub fn chunk_rules(rules: &[Rule], max_len: usize, language: &str) -> Vec<Vec<Rule>> {
    let mut chunks: Vec<Vec<Rule>> = Vec::new();
    let mut current: Vec<Rule> = Vec::new();
    let mut terms: Vec<String> = Vec::new();

    for rule in rules {
        let Some(term) = rule_term(&rule.query_string) else {
            warn!(rule_id = rule.id, "rule has no usable search term; skipping");
            continue;
        };
        if assemble(std::slice::from_ref(&term), language).len() > max_len {
            warn!(rule_id = rule.id, max_len, "rule exceeds query length limit; skipping");
            continue;
        }
        terms.push(term);
        if assemble(&terms, language).len() > max_len {
            let term = terms.pop().unwrap_or_default();
            chunks.push(std::mem::take(&mut current));
            terms = vec![term];
        }
        current.push(rule.clone());
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Pick the rule an item most plausibly matched.
pub fn attribute<'a>(item: &Item, rules: &'a [Rule]) -> Option<&'a Rule> {
    let text = item.text.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
    rules
        .iter()
        .find(|rule| {
            let q = rule.query_string.trim();
            match q.strip_prefix('@') {
                Some(handle) => item
                    .author_handle
                    .as_deref()
                    .map(|h| h.trim_start_matches('@').eq_ignore_ascii_case(handle.trim()))
                    .unwrap_or(false),
                None => {
                    let phrase = normalize_phrase(q);
                    !phrase.is_empty() && text.contains(&phrase.to_lowercase())
                }
            }
        })
        .or_else(|| rules.first())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub query: String,
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
    pub max_results: u32,
    pub next_token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchPage {
    pub items: Vec<Item>,
    /// Count reported in the provider's metadata block, when present.
    pub reported_count: Option<u32>,
    pub next_token: Option<String>,
    /// Provider requests spent producing this page, counting credential
    /// retries and rejected page-size attempts. Zero is read as one.
    pub calls: u32,
    /// Items billed on attempts that were thrown away.
    pub discarded_billed: u32,
}

impl SearchPage {
    /// Billable items: the provider's own count wins over the local length.
    pub fn billed_count(&self) -> u32 {
        let local = self.items.len() as u32;
        match self.reported_count {
            Some(reported) => {
                if reported != local {
                    warn!(reported, local, "provider count differs from items returned");
                }
                reported
            }
            None => local,
        }
    }
}

/// Check a page against the request. Page-size violations and window
/// violations are distinguished so the caller can retry the former.
pub fn validate_page(req: &SearchRequest, page: &SearchPage) -> Result<(), PageViolation> {
    let local = page.items.len() as u32;
    let reported = page.reported_count.unwrap_or(local);
    if reported > req.max_results || local > req.max_results {
        return Err(PageViolation::TooMany {
            requested: req.max_results,
            returned: reported.max(local),
        });
    }
    if let Some(item) = page
        .items
        .iter()
        .find(|item| item.created_at < req.since || item.created_at > req.until)
    {
        return Err(PageViolation::OutsideWindow {
            item_id: item.id.clone(),
            created_at: item.created_at,
        });
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageViolation {
    TooMany { requested: u32, returned: u32 },
    OutsideWindow { item_id: String, created_at: DateTime<Utc> },
}

impl fmt::Display for PageViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageViolation::TooMany { requested, returned } => {
                write!(f, "requested {} items, provider returned {}", requested, returned)
            }
            PageViolation::OutsideWindow { item_id, created_at } => write!(
                f,
                "item {} created at {} is outside the requested window",
                item_id, created_at
            ),
        }
    }
}

impl From<PageViolation> for ScoutError {
    fn from(v: PageViolation) -> Self {
        ScoutError::ContractViolation(v.to_string())
    }
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    /// Fetch one validated page.
    async fn search_page(&self, req: &SearchRequest) -> ScoutResult<SearchPage>;
}

/// Everything collected for one query across its pages.
#[derive(Debug, Clone, Default)]
pub struct WindowResult {
    pub items: Vec<Item>,
    pub calls: u32,
    pub billed_items: u32,
    /// Paging stopped because the deadline passed.
    pub truncated: bool,
}

/// Page through `[since, until]` for one query. Stops at `max_pages`, when
/// the provider has no more pages, or when `deadline` has passed; at least
/// one page is always requested.
#[instrument(skip_all, fields(query_len = query.len()))]
pub async fn collect_window(
    provider: &dyn SearchProvider,
    query: &str,
    since: DateTime<Utc>,
    until: DateTime<Utc>,
    max_results: u32,
    max_pages: u32,
    deadline: Instant,
) -> ScoutResult<WindowResult> {
    let mut out = WindowResult::default();
    let mut next_token: Option<String> = None;

    for page_no in 0..max_pages.max(1) {
        if page_no > 0 && Instant::now() >= deadline {
            out.truncated = true;
            break;
        }
        let req = SearchRequest {
            query: query.to_string(),
            since,
            until,
            max_results,
            next_token: next_token.take(),
        };
        let page = provider.search_page(&req).await?;
        out.calls += page.calls.max(1);
        out.billed_items += page.billed_count() + page.discarded_billed;
        debug!(page = page_no, items = page.items.len(), "search page");
        out.items.extend(page.items);
        match page.next_token {
            Some(token) if !token.is_empty() => next_token = Some(token),
            _ => break,
        }
    }
    Ok(out)
}

#[derive(Debug, Deserialize)]
struct RawResponse {
    #[serde(default)]
    data: Option<Vec<RawItem>>,
    #[serde(default)]
    meta: Option<RawMeta>,
}

#[derive(Debug, Deserialize)]
struct RawItem {
    id: String,
    text: String,
    author_id: String,
    #[serde(default, alias = "username")]
    author_handle: Option<String>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct RawMeta {
    #[serde(default)]
    result_count: Option<u32>,
    #[serde(default)]
    next_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PostReplyResponse {
    data: PostedReply,
}

#[derive(Debug, Deserialize)]
struct PostedReply {
    id: String,
}

#[derive(Clone)]
pub struct SearchClient {
    http: Client,
    base_url: Url,
    pool: Arc<CredentialPool>,
}

impl fmt::Debug for SearchClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SearchClient")
            .field("base_url", &self.base_url)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl SearchClient {
    pub fn new(base_url: &str, pool: Arc<CredentialPool>, timeout: Duration) -> ScoutResult<Self> {
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{}/", base_url)
        };
        let base_url = Url::parse(&normalized)
            .map_err(|e| ScoutError::Configuration(format!("invalid search base_url: {}", e)))?;
        let http = Client::builder()
            .user_agent("keyword-scout/0.1")
            .timeout(timeout)
            .build()
            .map_err(|e| ScoutError::Configuration(format!("http client: {}", e)))?;
        Ok(Self {
            http,
            base_url,
            pool,
        })
    }

    pub fn from_config(cfg: &config::Search, pool: Arc<CredentialPool>) -> ScoutResult<Self> {
        Self::new(&cfg.base_url, pool, Duration::from_secs(cfg.timeout_secs))
    }

    fn endpoint(&self, path: &str) -> ScoutResult<Url> {
        self.base_url
            .join(path)
            .map_err(|e| ScoutError::Configuration(format!("invalid endpoint {}: {}", path, e)))
    }

    async fn fetch_once(
        &self,
        credential: Credential,
        req: &SearchRequest,
        size_param: &str,
    ) -> ScoutResult<SearchPage> {
        let url = self.endpoint("tweets/search/recent")?;
        let mut params: Vec<(&str, String)> = vec![
            ("query", req.query.clone()),
            (size_param, req.max_results.to_string()),
            ("start_time", req.since.to_rfc3339_opts(SecondsFormat::Secs, true)),
            ("end_time", req.until.to_rfc3339_opts(SecondsFormat::Secs, true)),
        ];
        if let Some(token) = req.next_token.as_ref() {
            params.push(("next_token", token.clone()));
        }

        let res = self
            .http
            .get(url)
            .header("X-API-Key", credential.key)
            .query(&params)
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
        let raw: RawResponse = res.json().await?;
        Ok(SearchPage {
            items: raw
                .data
                .unwrap_or_default()
                .into_iter()
                .map(|r| Item {
                    id: r.id,
                    text: r.text,
                    author_id: r.author_id,
                    author_handle: r.author_handle,
                    created_at: r.created_at,
                })
                .collect(),
            reported_count: raw.meta.as_ref().and_then(|m| m.result_count),
            next_token: raw.meta.and_then(|m| m.next_token),
            calls: 1,
            discarded_billed: 0,
        })
    }
}

#[async_trait]
impl SearchProvider for SearchClient {
    async fn search_page(&self, req: &SearchRequest) -> ScoutResult<SearchPage> {
        let mut last_violation: Option<PageViolation> = None;
        let mut calls: u32 = 0;
        let mut discarded_billed: u32 = 0;
        for size_param in PAGE_SIZE_PARAMS {
            let mut page = self
                .pool
                .execute(|cred| {
                    calls += 1;
                    self.fetch_once(cred, req, size_param)
                })
                .await?;
            match validate_page(req, &page) {
                Ok(()) => {
                    page.calls = calls;
                    page.discarded_billed = discarded_billed;
                    return Ok(page);
                }
                Err(violation @ PageViolation::TooMany { .. }) => {
                    warn!(param = size_param, %violation, "provider ignored page size; trying next parameter");
                    discarded_billed += page.billed_count();
                    last_violation = Some(violation);
                }
                Err(violation) => return Err(violation.into()),
            }
        }
        Err(last_violation
            .map(ScoutError::from)
            .unwrap_or_else(|| ScoutError::ContractViolation("no page size parameter accepted".into())))
    }
}

#[async_trait]
impl ReplyPoster for SearchClient {
    async fn post_reply(&self, in_reply_to: &str, text: &str) -> ScoutResult<String> {
        let url = self.endpoint("tweets")?;
        let body = json!({
            "text": text,
            "reply": { "in_reply_to_tweet_id": in_reply_to },
        });
        let id = self
            .pool
            .execute(|cred| {
                let url = url.clone();
                let body = body.clone();
                async move {
                    let res = self
                        .http
                        .post(url)
                        .header("X-API-Key", cred.key)
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
                    let posted: PostReplyResponse = res.json().await?;
                    Ok(posted.data.id)
                }
            })
            .await?;
        info!(in_reply_to, reply_id = %id, "posted reply");
        Ok(id)
    }
}
