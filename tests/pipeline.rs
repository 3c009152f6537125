use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use keyword_scout::db::{self, UserSeed};
use keyword_scout::dedupe::DedupeCache;
use keyword_scout::error::{ScoutError, ScoutResult};
use keyword_scout::lock::{owner_lock_key, DistributedLock};
use keyword_scout::model::{
    BusinessProfile, Channel, Item, NotifyMode, Outcome, RuleStatus, SuppressReason,
};
use keyword_scout::notify::{Content, NotificationDispatcher, ReplyPoster, SmsGateway};
use keyword_scout::relevance::{AiStage, Relevance, ReplyEngine};
use keyword_scout::scan::{OwnerOutcome, ScanCoordinator, ScanSettings};
use keyword_scout::search::{SearchPage, SearchProvider, SearchRequest};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

async fn setup_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

fn at(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, h, m, 0).unwrap()
}

fn item(id: &str, text: &str, created_at: DateTime<Utc>) -> Item {
    Item {
        id: id.into(),
        text: text.into(),
        author_id: "A1".into(),
        author_handle: Some("shopper".into()),
        created_at,
    }
}

#[derive(Clone, Default)]
struct FakeSearch {
    items: Arc<Mutex<Vec<Item>>>,
    requests: Arc<Mutex<VecDeque<SearchRequest>>>,
    fail_when_query_contains: Option<String>,
    delay: Duration,
    /// When set, the first page points at a second page holding `more`.
    next_token: Option<String>,
    more: Arc<Mutex<Vec<Item>>>,
}

#[async_trait]
impl SearchProvider for FakeSearch {
    async fn search_page(&self, req: &SearchRequest) -> ScoutResult<SearchPage> {
        self.requests.lock().await.push_back(req.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(needle) = &self.fail_when_query_contains {
            if req.query.contains(needle.as_str()) {
                return Err(ScoutError::Upstream {
                    status: 500,
                    body: "provider down".into(),
                });
            }
        }
        let (items, next_token) = match &req.next_token {
            None => (self.items.lock().await.clone(), self.next_token.clone()),
            Some(_) => (self.more.lock().await.clone(), None),
        };
        Ok(SearchPage {
            reported_count: Some(items.len() as u32),
            items,
            next_token,
            ..SearchPage::default()
        })
    }
}

#[derive(Clone, Default)]
struct RecordingSms {
    sent: Arc<Mutex<VecDeque<(String, String)>>>,
    fail: bool,
}

#[async_trait]
impl SmsGateway for RecordingSms {
    async fn send(&self, to: &str, body: &str) -> ScoutResult<String> {
        if self.fail {
            return Err(ScoutError::Upstream {
                status: 400,
                body: "21211 invalid 'To' number".into(),
            });
        }
        let mut sent = self.sent.lock().await;
        sent.push_back((to.to_string(), body.to_string()));
        Ok(format!("SM{}", sent.len()))
    }
}

#[derive(Clone, Default)]
struct RecordingReplies {
    posted: Arc<Mutex<VecDeque<(String, String)>>>,
}

#[async_trait]
impl ReplyPoster for RecordingReplies {
    async fn post_reply(&self, in_reply_to: &str, text: &str) -> ScoutResult<String> {
        let mut posted = self.posted.lock().await;
        posted.push_back((in_reply_to.to_string(), text.to_string()));
        Ok(format!("R{}", posted.len()))
    }
}

struct FixedEngine {
    relevant: bool,
    reply: String,
    judged: Mutex<VecDeque<String>>,
}

#[async_trait]
impl ReplyEngine for FixedEngine {
    async fn is_relevant(&self, text: &str, _profile: &BusinessProfile) -> ScoutResult<Relevance> {
        self.judged.lock().await.push_back(text.to_string());
        Ok(Relevance {
            relevant: self.relevant,
            reason: if self.relevant { "wants shoes" } else { "off topic" }.into(),
        })
    }

    async fn draft(&self, _text: &str, _profile: &BusinessProfile) -> ScoutResult<String> {
        Ok(self.reply.clone())
    }

    async fn shorten(&self, reply: &str, max_chars: usize, _allow_emoji: bool) -> ScoutResult<String> {
        Ok(reply.chars().take(max_chars).collect())
    }
}

fn settings() -> ScanSettings {
    ScanSettings {
        worker_slots: 2,
        owner_budget: Duration::from_secs(30),
        lock_ttl: Duration::from_secs(60),
        cursor_lookback: Duration::from_secs(300),
        max_results: 20,
        max_pages: 2,
        max_query_len: 512,
        language: "en".into(),
        cost_per_item: 0.5,
        item_url_template: "https://x.com/i/status/{id}".into(),
    }
}

struct Harness {
    pool: SqlitePool,
    coordinator: ScanCoordinator,
    dispatcher: NotificationDispatcher,
    search: FakeSearch,
    sms: RecordingSms,
    replies: RecordingReplies,
}

async fn harness_with(
    pool: SqlitePool,
    search: FakeSearch,
    sms: RecordingSms,
    settings: ScanSettings,
    ai: Option<Arc<AiStage>>,
) -> Harness {
    let replies = RecordingReplies::default();
    let dispatcher = NotificationDispatcher::new(
        pool.clone(),
        DedupeCache::new(pool.clone()),
        Arc::new(sms.clone()),
        Arc::new(replies.clone()),
    );
    let coordinator = ScanCoordinator::new(
        pool.clone(),
        settings,
        Arc::new(search.clone()),
        dispatcher.clone(),
        ai,
    );
    Harness {
        pool,
        coordinator,
        dispatcher,
        search,
        sms,
        replies,
    }
}

async fn seed_user(pool: &SqlitePool, id: &str, used: i64, limit: i64) -> UserSeed {
    let mut seed = UserSeed::new(id, limit);
    seed.phone = Some("+15550001111".into());
    seed.quota_used = used;
    db::upsert_user(pool, &seed).await.unwrap();
    seed
}

#[tokio::test]
async fn sneakers_end_to_end_then_rerun_sends_nothing() {
    let pool = setup_pool().await;
    seed_user(&pool, "U1", 0, 10).await;
    db::insert_rule(&pool, "U1", "sneakers", RuleStatus::Active)
        .await
        .unwrap();
    let search = FakeSearch::default();
    *search.items.lock().await = vec![item("T1", "need sneakers", at(12, 0))];
    let h = harness_with(pool, search, RecordingSms::default(), settings(), None).await;

    let now = at(12, 1);
    let summary = h.coordinator.run_cycle_at(now).await.unwrap();
    assert_eq!(summary.calls_made, 1);
    assert_eq!(summary.rules_scanned, 1);
    assert_eq!(summary.rules_hit, 1);
    assert_eq!(summary.notifications_sent, 1);
    assert!((summary.credits_used - 0.5).abs() < f64::EPSILON);

    let sent = h.sms.sent.lock().await.clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "+15550001111");
    assert!(sent[0].1.contains("sneakers"));
    assert!(sent[0].1.ends_with("https://x.com/i/status/T1"));

    let records = db::notifications_for_owner(&h.pool, "U1").await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].item_id, "T1");
    assert_eq!(records[0].outcome, Outcome::Sent);
    assert_eq!(records[0].channel, Channel::Sms);

    let cursor = db::get_cursor_ms(&h.pool, "U1").await.unwrap();
    assert_eq!(cursor, Some(at(12, 0).timestamp_millis()));
    let user = db::fetch_user(&h.pool, "U1").await.unwrap().unwrap();
    assert_eq!(user.quota_used, 1);
    assert!(db::fetch_lock(&h.pool, &owner_lock_key("U1"))
        .await
        .unwrap()
        .is_none());

    // The first request covered [now - lookback, now].
    let first = h.search.requests.lock().await.front().cloned().unwrap();
    assert_eq!(first.since, now - chrono::Duration::seconds(300));
    assert_eq!(first.until, now);

    let again = h.coordinator.run_cycle_at(now).await.unwrap();
    assert_eq!(again.notifications_sent, 0);
    assert_eq!(h.sms.sent.lock().await.len(), 1);
    assert_eq!(db::notifications_for_owner(&h.pool, "U1").await.unwrap().len(), 1);
    match &again.owners[0].outcome {
        OwnerOutcome::Completed(stats) => assert_eq!(stats.already_handled, 1),
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[tokio::test]
async fn quota_allows_exactly_one_more_send() {
    let pool = setup_pool().await;
    seed_user(&pool, "U1", 9, 10).await;
    db::insert_rule(&pool, "U1", "sneakers", RuleStatus::Active)
        .await
        .unwrap();
    let search = FakeSearch::default();
    *search.items.lock().await = vec![
        item("T1", "need sneakers", at(12, 0)),
        item("T2", "sneakers again", at(12, 0)),
    ];
    let h = harness_with(pool, search, RecordingSms::default(), settings(), None).await;

    let summary = h.coordinator.run_cycle_at(at(12, 1)).await.unwrap();
    assert_eq!(summary.notifications_sent, 1);
    assert_eq!(h.sms.sent.lock().await.len(), 1);

    let user = db::fetch_user(&h.pool, "U1").await.unwrap().unwrap();
    assert_eq!(user.quota_used, 10);

    let records = db::notifications_for_owner(&h.pool, "U1").await.unwrap();
    assert_eq!(records.len(), 2);
    let over = records.iter().find(|r| r.item_id == "T2").unwrap();
    assert_eq!(over.outcome, Outcome::Suppressed);
    assert_eq!(over.channel, Channel::StoredOnly);
    assert_eq!(over.detail.as_deref(), Some("over_quota"));
}

#[tokio::test]
async fn quiet_hours_store_without_sending() {
    let pool = setup_pool().await;
    let mut seed = seed_user(&pool, "U1", 0, 10).await;
    seed.quiet_start = Some("22:00".into());
    seed.quiet_end = Some("08:00".into());
    db::upsert_user(&pool, &seed).await.unwrap();
    db::insert_rule(&pool, "U1", "sneakers", RuleStatus::Active)
        .await
        .unwrap();
    let search = FakeSearch::default();
    *search.items.lock().await = vec![item("T1", "need sneakers", at(23, 29))];
    let h = harness_with(pool, search, RecordingSms::default(), settings(), None).await;

    let summary = h.coordinator.run_cycle_at(at(23, 30)).await.unwrap();
    assert_eq!(summary.notifications_sent, 0);
    assert!(h.sms.sent.lock().await.is_empty());

    let records = db::notifications_for_owner(&h.pool, "U1").await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].channel, Channel::StoredOnly);
    assert_eq!(records[0].outcome, Outcome::Suppressed);
    assert_eq!(records[0].detail.as_deref(), Some("quiet_hours"));
    let user = db::fetch_user(&h.pool, "U1").await.unwrap().unwrap();
    assert_eq!(user.quota_used, 0);
    assert!(h.dispatcher.dedupe().is_claimed("T1", "U1").await);
}

#[tokio::test]
async fn locked_owner_is_skipped() {
    let pool = setup_pool().await;
    seed_user(&pool, "U1", 0, 10).await;
    db::insert_rule(&pool, "U1", "sneakers", RuleStatus::Active)
        .await
        .unwrap();
    let now = at(12, 1);
    let other = DistributedLock::new(pool.clone());
    assert!(other
        .acquire(&owner_lock_key("U1"), "U1", "other-instance", Duration::from_secs(60))
        .await
        .unwrap());

    let search = FakeSearch::default();
    *search.items.lock().await = vec![item("T1", "need sneakers", at(12, 0))];
    let h = harness_with(pool, search, RecordingSms::default(), settings(), None).await;

    let summary = h.coordinator.run_cycle_at(now).await.unwrap();
    assert_eq!(summary.owners.len(), 1);
    assert_eq!(summary.owners[0].outcome, OwnerOutcome::Skipped);
    assert!(h.search.requests.lock().await.is_empty());
    assert!(h.sms.sent.lock().await.is_empty());
    let lock = db::fetch_lock(&h.pool, &owner_lock_key("U1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(lock.holder_id, "other-instance");
}

#[tokio::test]
async fn failing_owner_keeps_cursor_and_others_continue() {
    let pool = setup_pool().await;
    seed_user(&pool, "U1", 0, 10).await;
    seed_user(&pool, "U2", 0, 10).await;
    db::insert_rule(&pool, "U1", "boots", RuleStatus::Active)
        .await
        .unwrap();
    db::insert_rule(&pool, "U2", "sneakers", RuleStatus::Active)
        .await
        .unwrap();
    let search = FakeSearch {
        fail_when_query_contains: Some("boots".into()),
        ..FakeSearch::default()
    };
    *search.items.lock().await = vec![item("T1", "need sneakers", at(12, 0))];
    let h = harness_with(pool, search, RecordingSms::default(), settings(), None).await;

    let now = at(12, 1);
    let summary = h.coordinator.run_cycle_at(now).await.unwrap();
    let u1 = summary.owners.iter().find(|o| o.owner_id == "U1").unwrap();
    let u2 = summary.owners.iter().find(|o| o.owner_id == "U2").unwrap();
    match &u1.outcome {
        OwnerOutcome::Failed { error } => assert!(error.contains("500"), "{}", error),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(matches!(u2.outcome, OwnerOutcome::Completed(_)));
    assert_eq!(summary.notifications_sent, 1);

    // U1 keeps its seeded cursor and is unlocked.
    let seeded = (now - chrono::Duration::seconds(300)).timestamp_millis();
    assert_eq!(db::get_cursor_ms(&h.pool, "U1").await.unwrap(), Some(seeded));
    assert!(db::fetch_lock(&h.pool, &owner_lock_key("U1"))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn sms_failure_is_recorded_and_not_charged() {
    let pool = setup_pool().await;
    seed_user(&pool, "U1", 0, 10).await;
    db::insert_rule(&pool, "U1", "sneakers", RuleStatus::Active)
        .await
        .unwrap();
    let search = FakeSearch::default();
    *search.items.lock().await = vec![item("T1", "need sneakers", at(12, 0))];
    let sms = RecordingSms {
        fail: true,
        ..RecordingSms::default()
    };
    let h = harness_with(pool, search, sms, settings(), None).await;

    let summary = h.coordinator.run_cycle_at(at(12, 1)).await.unwrap();
    assert_eq!(summary.notifications_sent, 0);
    let records = db::notifications_for_owner(&h.pool, "U1").await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, Outcome::Failed);
    assert_eq!(records[0].channel, Channel::Sms);
    assert!(records[0].detail.as_deref().unwrap_or_default().contains("21211"));
    let user = db::fetch_user(&h.pool, "U1").await.unwrap().unwrap();
    assert_eq!(user.quota_used, 0);
}

#[tokio::test]
async fn stuck_owner_hits_hard_limit_and_is_released() {
    let pool = setup_pool().await;
    seed_user(&pool, "U1", 0, 10).await;
    db::insert_rule(&pool, "U1", "sneakers", RuleStatus::Active)
        .await
        .unwrap();
    let search = FakeSearch {
        delay: Duration::from_secs(5),
        ..FakeSearch::default()
    };
    let mut tight = settings();
    tight.owner_budget = Duration::from_millis(100);
    let h = harness_with(pool, search, RecordingSms::default(), tight, None).await;

    let summary = h.coordinator.run_cycle_at(at(12, 1)).await.unwrap();
    match &summary.owners[0].outcome {
        OwnerOutcome::Failed { error } => assert!(error.contains("timed out"), "{}", error),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(db::fetch_lock(&h.pool, &owner_lock_key("U1"))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn spent_budget_stops_paging_but_keeps_completed_work() {
    let pool = setup_pool().await;
    seed_user(&pool, "U1", 0, 10).await;
    db::insert_rule(&pool, "U1", "sneakers", RuleStatus::Active)
        .await
        .unwrap();
    let search = FakeSearch {
        delay: Duration::from_millis(400),
        next_token: Some("p2".into()),
        ..FakeSearch::default()
    };
    *search.items.lock().await = vec![
        item("T1", "need sneakers", at(11, 58)),
        item("T2", "sneakers wanted", at(11, 59)),
    ];
    *search.more.lock().await = vec![item("T3", "more sneakers", at(11, 57))];
    let mut short = settings();
    short.owner_budget = Duration::from_millis(300);
    let h = harness_with(pool, search, RecordingSms::default(), short, None).await;

    let summary = h.coordinator.run_cycle_at(at(12, 0)).await.unwrap();
    let stats = match &summary.owners[0].outcome {
        OwnerOutcome::Completed(stats) => stats.clone(),
        other => panic!("unexpected outcome {:?}", other),
    };
    assert!(stats.truncated);
    assert_eq!(stats.calls_made, 1);
    assert_eq!(stats.notifications_sent, 2);

    let requests = h.search.requests.lock().await.clone();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].next_token.is_none());
    let sent: Vec<String> = h.sms.sent.lock().await.iter().map(|(_, body)| body.clone()).collect();
    assert!(sent.iter().all(|body| !body.contains("T3")));
    assert_eq!(
        db::get_cursor_ms(&h.pool, "U1").await.unwrap(),
        Some(at(11, 59).timestamp_millis())
    );
}

async fn seed_reply_user(pool: &SqlitePool) {
    let profile_id = db::insert_business_profile(
        pool,
        &BusinessProfile {
            name: "Trail Co".into(),
            summary: "Running shoes for trails".into(),
            safe_topics: vec!["running".into(), "shoes".into()],
            tone: Some("upbeat".into()),
        },
    )
    .await
    .unwrap();
    let mut seed = UserSeed::new("U1", 10);
    seed.notify_mode = NotifyMode::Reply;
    seed.business_profile_id = Some(profile_id);
    db::upsert_user(pool, &seed).await.unwrap();
    db::insert_rule(pool, "U1", "sneakers", RuleStatus::Active)
        .await
        .unwrap();
}

fn fixed_engine(relevant: bool) -> Arc<FixedEngine> {
    Arc::new(FixedEngine {
        relevant,
        reply: "Our trail runners grip like glue, happy to help you pick a pair.".into(),
        judged: Mutex::new(VecDeque::new()),
    })
}

fn ai_stage_with(engine: Arc<FixedEngine>) -> Arc<AiStage> {
    Arc::new(AiStage::new(
        engine,
        chrono::Duration::minutes(60),
        Duration::from_secs(2),
        240,
    ))
}

fn ai_stage(relevant: bool) -> Arc<AiStage> {
    ai_stage_with(fixed_engine(relevant))
}

#[tokio::test]
async fn relevant_match_gets_an_automated_reply() {
    let pool = setup_pool().await;
    seed_reply_user(&pool).await;
    let search = FakeSearch::default();
    *search.items.lock().await = vec![item("T1", "need sneakers for trails", at(12, 0))];
    let h = harness_with(pool, search, RecordingSms::default(), settings(), Some(ai_stage(true))).await;

    let summary = h.coordinator.run_cycle_at(at(12, 1)).await.unwrap();
    assert_eq!(summary.notifications_sent, 1);
    let posted = h.replies.posted.lock().await.clone();
    assert_eq!(posted.len(), 1);
    assert_eq!(posted[0].0, "T1");
    assert!(posted[0].1.starts_with("Our trail runners"));
    assert!(h.sms.sent.lock().await.is_empty());

    let records = db::notifications_for_owner(&h.pool, "U1").await.unwrap();
    assert_eq!(records[0].channel, Channel::Reply);
    assert_eq!(records[0].detail.as_deref(), Some("R1"));
    assert_eq!(db::count_ai_reply_logs(&h.pool, "U1").await.unwrap(), 1);
}

#[tokio::test]
async fn irrelevant_match_is_logged_but_not_claimed() {
    let pool = setup_pool().await;
    seed_reply_user(&pool).await;
    let search = FakeSearch::default();
    *search.items.lock().await = vec![item("T1", "sneakers stock is a scam", at(12, 0))];
    let h = harness_with(pool, search, RecordingSms::default(), settings(), Some(ai_stage(false))).await;

    let summary = h.coordinator.run_cycle_at(at(12, 1)).await.unwrap();
    assert_eq!(summary.notifications_sent, 0);
    assert!(h.replies.posted.lock().await.is_empty());
    assert!(db::notifications_for_owner(&h.pool, "U1").await.unwrap().is_empty());
    assert_eq!(db::count_ai_reply_logs(&h.pool, "U1").await.unwrap(), 1);
    assert!(!h.dispatcher.dedupe().is_claimed("T1", "U1").await);
}

#[tokio::test]
async fn rejected_item_is_judged_once_across_cycles() {
    let pool = setup_pool().await;
    seed_reply_user(&pool).await;
    let search = FakeSearch::default();
    *search.items.lock().await = vec![item("T1", "sneakers stock is a scam", at(12, 0))];
    let engine = fixed_engine(false);
    let h = harness_with(
        pool,
        search,
        RecordingSms::default(),
        settings(),
        Some(ai_stage_with(engine.clone())),
    )
    .await;

    for minute in 1..=3 {
        h.coordinator.run_cycle_at(at(12, minute)).await.unwrap();
    }

    // The cursor sits on T1, so every cycle sees it again.
    assert_eq!(h.search.requests.lock().await.len(), 3);
    assert_eq!(engine.judged.lock().await.len(), 1);
    assert_eq!(db::count_ai_reply_logs(&h.pool, "U1").await.unwrap(), 1);
    assert!(h.replies.posted.lock().await.is_empty());
}

#[tokio::test]
async fn second_dispatch_of_same_item_is_suppressed_without_record() {
    let pool = setup_pool().await;
    seed_user(&pool, "U1", 0, 10).await;
    let rule_id = db::insert_rule(&pool, "U1", "sneakers", RuleStatus::Active)
        .await
        .unwrap();
    let h = harness_with(pool, FakeSearch::default(), RecordingSms::default(), settings(), None).await;
    let rule = db::fetch_rule(&h.pool, rule_id).await.unwrap().unwrap();
    let mut user = db::fetch_user(&h.pool, "U1").await.unwrap().unwrap();
    let t1 = item("T1", "need sneakers", at(12, 0));

    let first = h
        .dispatcher
        .dispatch(&t1, &rule, &mut user, Content::Sms("hi".into()), at(12, 1))
        .await;
    assert_eq!(first.outcome, Outcome::Sent);
    assert_eq!(user.quota_used, 1);

    let second = h
        .dispatcher
        .dispatch(&t1, &rule, &mut user, Content::Sms("hi".into()), at(12, 2))
        .await;
    assert_eq!(second.outcome, Outcome::Suppressed);
    assert_eq!(second.reason, Some(SuppressReason::AlreadyClaimed));
    assert_eq!(user.quota_used, 1);
    assert_eq!(h.sms.sent.lock().await.len(), 1);
    assert_eq!(db::notifications_for_owner(&h.pool, "U1").await.unwrap().len(), 1);

    let rule = db::fetch_rule(&h.pool, rule_id).await.unwrap().unwrap();
    assert_eq!(rule.last_match_at, Some(at(12, 1)));
}

#[tokio::test]
async fn stale_user_snapshots_cannot_overspend_quota() {
    let pool = setup_pool().await;
    seed_user(&pool, "U1", 9, 10).await;
    let rule_id = db::insert_rule(&pool, "U1", "sneakers", RuleStatus::Active)
        .await
        .unwrap();
    let h = harness_with(pool, FakeSearch::default(), RecordingSms::default(), settings(), None).await;
    let rule = db::fetch_rule(&h.pool, rule_id).await.unwrap().unwrap();
    // A scan and a webhook each loaded the user at 9/10.
    let mut scan_view = db::fetch_user(&h.pool, "U1").await.unwrap().unwrap();
    let mut webhook_view = db::fetch_user(&h.pool, "U1").await.unwrap().unwrap();

    let first = h
        .dispatcher
        .dispatch(&item("T1", "need sneakers", at(12, 0)), &rule, &mut scan_view, Content::Sms("a".into()), at(12, 1))
        .await;
    let second = h
        .dispatcher
        .dispatch(&item("T2", "sneakers please", at(12, 0)), &rule, &mut webhook_view, Content::Sms("b".into()), at(12, 1))
        .await;

    assert_eq!(first.outcome, Outcome::Sent);
    assert_eq!(second.outcome, Outcome::Suppressed);
    assert_eq!(second.reason, Some(SuppressReason::OverQuota));
    assert_eq!(h.sms.sent.lock().await.len(), 1);
    let user = db::fetch_user(&h.pool, "U1").await.unwrap().unwrap();
    assert_eq!(user.quota_used, 10);
}

#[tokio::test]
async fn queued_owner_lock_runs_from_its_own_start() {
    let pool = setup_pool().await;
    seed_user(&pool, "U1", 0, 10).await;
    seed_user(&pool, "U2", 0, 10).await;
    db::insert_rule(&pool, "U1", "sneakers", RuleStatus::Active)
        .await
        .unwrap();
    db::insert_rule(&pool, "U2", "sneakers", RuleStatus::Active)
        .await
        .unwrap();
    let search = FakeSearch {
        delay: Duration::from_millis(800),
        ..FakeSearch::default()
    };
    *search.items.lock().await = vec![item("T1", "need sneakers", Utc::now() - chrono::Duration::seconds(30))];
    let mut serial = settings();
    serial.worker_slots = 1;
    serial.owner_budget = Duration::from_millis(600);
    serial.lock_ttl = Duration::from_secs(1);
    let h = harness_with(pool, search, RecordingSms::default(), serial, None).await;

    // U1 scans first; U2 waits for the only slot and is mid-scan at 1.3s.
    let contender = DistributedLock::new(h.pool.clone());
    let (summary, stolen) = tokio::join!(h.coordinator.run_cycle(), async {
        tokio::time::sleep(Duration::from_millis(1300)).await;
        contender
            .acquire(&owner_lock_key("U2"), "U2", "second-trigger", Duration::from_secs(60))
            .await
            .unwrap()
    });
    let summary = summary.unwrap();

    assert!(!stolen, "U2's lock was taken over while it was being scanned");
    for report in &summary.owners {
        assert!(matches!(report.outcome, OwnerOutcome::Completed(_)), "{:?}", report);
    }
    assert!(db::fetch_lock(&h.pool, &owner_lock_key("U2"))
        .await
        .unwrap()
        .is_none());
}
