//! One scan cycle: for every owner with active rules, lock, query the window
//! since the owner's cursor, dispatch new matches, advance the cursor and
//! unlock.
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::Config;
use crate::cursor::CursorStore;
use crate::db::{self, AiReplyLog, Pool};
use crate::error::{storage, ScoutError, ScoutResult};
use crate::lock::{owner_lock_key, DistributedLock};
use crate::model::{Item, NotifyMode, Outcome, Rule, User};
use crate::notify::{format_sms, Content, NotificationDispatcher};
use crate::relevance::AiStage;
use crate::search::{attribute, build_query, chunk_rules, collect_window, SearchProvider};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanState {
    Idle,
    LockAcquired,
    Querying,
    Dispatching,
    CursorAdvanced,
    Unlocked,
    Skipped,
}

fn enter(state: &mut ScanState, next: ScanState) {
    debug!(from = ?*state, to = ?next, "scan state");
    *state = next;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerStats {
    pub rules_scanned: u32,
    pub rules_hit: u32,
    pub calls_made: u32,
    pub billed_items: u32,
    pub items_seen: u32,
    pub already_handled: u32,
    pub irrelevant: u32,
    pub notifications_sent: u32,
    pub suppressed: u32,
    pub failed: u32,
    /// Paging stopped early because the owner's time budget ran out.
    pub truncated: bool,
    pub cursor: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OwnerOutcome {
    Completed(OwnerStats),
    /// Another holder is scanning this owner.
    Skipped,
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReport {
    pub owner_id: String,
    pub state: ScanState,
    pub outcome: OwnerOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleSummary {
    pub calls_made: u32,
    pub rules_scanned: u32,
    pub rules_hit: u32,
    pub notifications_sent: u32,
    pub credits_used: f64,
    pub timestamp: DateTime<Utc>,
    pub owners: Vec<OwnerReport>,
}

impl CycleSummary {
    fn from_reports(reports: Vec<OwnerReport>, cost_per_item: f64, timestamp: DateTime<Utc>) -> Self {
        let mut summary = CycleSummary {
            calls_made: 0,
            rules_scanned: 0,
            rules_hit: 0,
            notifications_sent: 0,
            credits_used: 0.0,
            timestamp,
            owners: Vec::with_capacity(reports.len()),
        };
        let mut billed: u64 = 0;
        for report in reports {
            if let OwnerOutcome::Completed(stats) = &report.outcome {
                summary.calls_made += stats.calls_made;
                summary.rules_scanned += stats.rules_scanned;
                summary.rules_hit += stats.rules_hit;
                summary.notifications_sent += stats.notifications_sent;
                billed += u64::from(stats.billed_items);
            }
            summary.owners.push(report);
        }
        summary.credits_used = billed as f64 * cost_per_item;
        summary
    }
}

/// Knobs the coordinator needs, lifted out of the full configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanSettings {
    pub worker_slots: usize,
    pub owner_budget: Duration,
    pub lock_ttl: Duration,
    pub cursor_lookback: Duration,
    pub max_results: u32,
    pub max_pages: u32,
    pub max_query_len: usize,
    pub language: String,
    pub cost_per_item: f64,
    pub item_url_template: String,
}

impl ScanSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            worker_slots: cfg.app.worker_slots.max(1),
            owner_budget: cfg.app.owner_budget(),
            lock_ttl: cfg.app.lock_ttl(),
            cursor_lookback: Duration::from_secs(cfg.app.cursor_lookback_secs),
            max_results: cfg.search.max_results,
            max_pages: cfg.search.max_pages,
            max_query_len: cfg.search.max_query_len,
            language: cfg.search.language.clone(),
            cost_per_item: cfg.search.cost_per_item,
            item_url_template: cfg.app.item_url_template.clone(),
        }
    }
}

enum Prepared {
    Ready(Content),
    Irrelevant,
    /// Rejected by the model on an earlier cycle.
    AlreadyJudged,
    Failed(ScoutError),
}

pub struct ScanCoordinator {
    pool: Pool,
    settings: ScanSettings,
    search: Arc<dyn SearchProvider>,
    cursors: CursorStore,
    lock: DistributedLock,
    dispatcher: NotificationDispatcher,
    ai: Option<Arc<AiStage>>,
}

impl ScanCoordinator {
    pub fn new(
        pool: Pool,
        settings: ScanSettings,
        search: Arc<dyn SearchProvider>,
        dispatcher: NotificationDispatcher,
        ai: Option<Arc<AiStage>>,
    ) -> Self {
        Self {
            cursors: CursorStore::new(pool.clone(), settings.cursor_lookback),
            lock: DistributedLock::new(pool.clone()),
            pool,
            settings,
            search,
            dispatcher,
            ai,
        }
    }

    pub fn lock(&self) -> &DistributedLock {
        &self.lock
    }

    pub async fn run_cycle(&self) -> ScoutResult<CycleSummary> {
        self.run_cycle_at(Utc::now()).await
    }

    /// Scan every owner with active rules using `now` as the window end.
    /// Per-owner failures are reported in the summary; only failing to list
    /// owners fails the cycle.
    pub async fn run_cycle_at(&self, now: DateTime<Utc>) -> ScoutResult<CycleSummary> {
        let owners = db::owners_with_active_rules(&self.pool)
            .await
            .map_err(storage)?;
        info!(owners = owners.len(), slots = self.settings.worker_slots, "scan cycle start");

        let reports: Vec<OwnerReport> = stream::iter(owners)
            .map(|owner| self.scan_owner_bounded(owner, now))
            .buffer_unordered(self.settings.worker_slots)
            .collect()
            .await;

        let summary = CycleSummary::from_reports(reports, self.settings.cost_per_item, Utc::now());
        info!(
            calls = summary.calls_made,
            rules = summary.rules_scanned,
            hits = summary.rules_hit,
            sent = summary.notifications_sent,
            credits = summary.credits_used,
            "scan cycle done"
        );
        Ok(summary)
    }

    async fn scan_owner_bounded(&self, owner_id: String, now: DateTime<Utc>) -> OwnerReport {
        let holder = Uuid::new_v4().to_string();
        let hard_limit = self.settings.owner_budget.saturating_mul(2);
        let span = info_span!("owner", owner_id = %owner_id);
        match tokio::time::timeout(hard_limit, self.scan_owner(&owner_id, &holder, now))
            .instrument(span)
            .await
        {
            Ok(report) => report,
            Err(_) => {
                error!(owner_id = %owner_id, ?hard_limit, "owner scan exceeded hard limit");
                let key = owner_lock_key(&owner_id);
                if let Err(err) = self.lock.release(&key, &holder).await {
                    warn!(?err, owner_id = %owner_id, "best-effort release failed");
                }
                OwnerReport {
                    owner_id,
                    state: ScanState::Unlocked,
                    outcome: OwnerOutcome::Failed {
                        error: ScoutError::Timeout("owner scan").to_string(),
                    },
                }
            }
        }
    }

    /// Run one owner's cycle under its lock. Lock contention is a skip; any
    /// failure after acquiring still releases.
    pub async fn scan_owner(&self, owner_id: &str, holder: &str, now: DateTime<Utc>) -> OwnerReport {
        let mut state = ScanState::Idle;
        let key = owner_lock_key(owner_id);
        let report = |state, outcome| OwnerReport {
            owner_id: owner_id.to_string(),
            state,
            outcome,
        };

        // `now` is the window end; the lease runs from the moment we take it.
        match self
            .lock
            .acquire(&key, owner_id, holder, self.settings.lock_ttl)
            .await
        {
            Ok(true) => enter(&mut state, ScanState::LockAcquired),
            Ok(false) => {
                info!("owner locked by another holder; skipping");
                enter(&mut state, ScanState::Skipped);
                return report(state, OwnerOutcome::Skipped);
            }
            Err(err) => {
                error!(?err, "lock acquire failed");
                return report(state, OwnerOutcome::Failed { error: err.to_string() });
            }
        }

        let result = self.scan_locked(owner_id, now, &mut state).await;

        if let Err(err) = self.lock.release(&key, holder).await {
            warn!(?err, "lock release failed; it will expire");
        }
        enter(&mut state, ScanState::Unlocked);

        match result {
            Ok(stats) => {
                info!(
                    sent = stats.notifications_sent,
                    suppressed = stats.suppressed,
                    failed = stats.failed,
                    truncated = stats.truncated,
                    "owner scan complete"
                );
                report(state, OwnerOutcome::Completed(stats))
            }
            Err(err) => {
                error!(?err, "owner scan failed");
                report(state, OwnerOutcome::Failed { error: err.to_string() })
            }
        }
    }

    async fn scan_locked(
        &self,
        owner_id: &str,
        now: DateTime<Utc>,
        state: &mut ScanState,
    ) -> ScoutResult<OwnerStats> {
        let deadline = Instant::now() + self.settings.owner_budget;
        let mut stats = OwnerStats::default();

        let mut user = db::fetch_user(&self.pool, owner_id)
            .await
            .map_err(storage)?
            .ok_or_else(|| ScoutError::Validation(vec![format!("unknown owner {}", owner_id)]))?;
        let rules = db::active_rules_for_owner(&self.pool, owner_id)
            .await
            .map_err(storage)?;
        stats.rules_scanned = rules.len() as u32;
        if rules.is_empty() {
            return Ok(stats);
        }
        let since = self.cursors.since_or_seed(owner_id, now).await?;

        enter(state, ScanState::Querying);
        let mut matches: Vec<(Item, Rule)> = Vec::new();
        let mut seen_ids: HashSet<String> = HashSet::new();
        let chunks = chunk_rules(&rules, self.settings.max_query_len, &self.settings.language);
        for (idx, chunk) in chunks.iter().enumerate() {
            if idx > 0 && Instant::now() >= deadline {
                warn!(remaining = chunks.len() - idx, "owner budget spent; skipping remaining queries");
                stats.truncated = true;
                break;
            }
            let Some(query) = build_query(chunk, &self.settings.language) else {
                continue;
            };
            let window = collect_window(
                self.search.as_ref(),
                &query,
                since,
                now,
                self.settings.max_results,
                self.settings.max_pages,
                deadline,
            )
            .await?;
            stats.calls_made += window.calls;
            stats.billed_items += window.billed_items;
            stats.truncated |= window.truncated;
            for item in window.items {
                if !seen_ids.insert(item.id.clone()) {
                    continue;
                }
                if let Some(rule) = attribute(&item, chunk) {
                    matches.push((item, rule.clone()));
                }
            }
        }

        enter(state, ScanState::Dispatching);
        let mut newest: Option<DateTime<Utc>> = None;
        let mut hit_rules: HashSet<i64> = HashSet::new();
        for (item, rule) in &matches {
            stats.items_seen += 1;
            newest = Some(newest.map_or(item.created_at, |n| n.max(item.created_at)));

            if self.dispatcher.dedupe().is_claimed(&item.id, owner_id).await {
                stats.already_handled += 1;
                continue;
            }
            hit_rules.insert(rule.id);

            let content = match self.prepare(item, rule, &user, now).await {
                Prepared::Ready(content) => content,
                Prepared::Irrelevant => {
                    stats.irrelevant += 1;
                    continue;
                }
                Prepared::AlreadyJudged => {
                    stats.already_handled += 1;
                    continue;
                }
                Prepared::Failed(err) => {
                    warn!(?err, item_id = %item.id, "ai stage failed for item");
                    stats.failed += 1;
                    continue;
                }
            };

            let result = self.dispatcher.dispatch(item, rule, &mut user, content, now).await;
            match result.outcome {
                Outcome::Sent => stats.notifications_sent += 1,
                Outcome::Suppressed => stats.suppressed += 1,
                Outcome::Failed => stats.failed += 1,
            }
        }
        stats.rules_hit = hit_rules.len() as u32;

        if let Some(newest) = newest {
            stats.cursor = Some(self.cursors.set(owner_id, newest).await?);
            enter(state, ScanState::CursorAdvanced);
        }
        Ok(stats)
    }

    /// Decide what to send. Without an AI stage or a business profile the
    /// match goes out as an SMS.
    async fn prepare(&self, item: &Item, rule: &Rule, user: &User, now: DateTime<Utc>) -> Prepared {
        let sms = || Content::Sms(format_sms(rule, item, &self.settings.item_url_template));
        let (Some(ai), Some(profile)) = (self.ai.as_ref(), user.business_profile.as_ref()) else {
            return Prepared::Ready(sms());
        };

        // The window start is inclusive, so the newest item of the last cycle
        // comes back until something newer arrives.
        match db::ai_rejected(&self.pool, &item.id, &user.id).await {
            Ok(true) => return Prepared::AlreadyJudged,
            Ok(false) => {}
            Err(err) => warn!(?err, item_id = %item.id, "failed to look up earlier verdict"),
        }

        let verdict = match ai.evaluate(item, profile, now).await {
            Ok(v) => v,
            Err(err) => {
                let reason = format!("error: {}", err);
                self.log_ai(item, rule, user, false, true, &reason, None, now).await;
                return Prepared::Failed(err);
            }
        };
        if !verdict.relevant {
            self.log_ai(item, rule, user, false, false, &verdict.reason, None, now)
                .await;
            return Prepared::Irrelevant;
        }

        if user.notify_mode != NotifyMode::Reply {
            self.log_ai(item, rule, user, true, false, &verdict.reason, None, now)
                .await;
            return Prepared::Ready(sms());
        }
        match ai.draft(&item.text, profile).await {
            Ok(reply) => {
                self.log_ai(item, rule, user, true, false, &verdict.reason, Some(&reply), now)
                    .await;
                Prepared::Ready(Content::Reply(reply))
            }
            Err(err) => {
                let reason = format!("draft error: {}", err);
                self.log_ai(item, rule, user, true, true, &reason, None, now).await;
                Prepared::Failed(err)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn log_ai(
        &self,
        item: &Item,
        rule: &Rule,
        user: &User,
        relevant: bool,
        errored: bool,
        reason: &str,
        reply_text: Option<&str>,
        now: DateTime<Utc>,
    ) {
        let log = AiReplyLog {
            item_id: item.id.clone(),
            rule_id: rule.id,
            owner_id: user.id.clone(),
            relevant,
            errored,
            reason: reason.to_string(),
            reply_text: reply_text.map(str::to_string),
            created_at: now,
        };
        if let Err(err) = db::insert_ai_reply_log(&self.pool, &log).await {
            error!(?err, item_id = %item.id, "failed to persist ai reply log");
        }
    }
}
