use super::model::{AiReplyLog, LockRow, UserSeed};
use crate::model::{
    BusinessProfile, Channel, NotificationRecord, NotifyMode, Outcome, Rule, RuleStatus, User,
};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use sqlx::SqlitePool;
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized)
        .await
        .with_context(|| format!("failed to open database {}", normalized))?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    // sqlx only creates the file when asked to.
    let mut rebuilt = format!("sqlite://{}", expanded_path);
    match query_part {
        Some(q) if q.contains("mode=") => {
            rebuilt.push('?');
            rebuilt.push_str(q);
        }
        Some(q) => {
            rebuilt.push('?');
            rebuilt.push_str(q);
            rebuilt.push_str("&mode=rwc");
        }
        None => rebuilt.push_str("?mode=rwc"),
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Collaborator-owned records: seeds and reads.

#[instrument(skip_all)]
pub async fn insert_business_profile(pool: &Pool, profile: &BusinessProfile) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO business_profiles (name, summary, safe_topics, tone) VALUES (?, ?, ?, ?) RETURNING id",
    )
    .bind(&profile.name)
    .bind(&profile.summary)
    .bind(profile.safe_topics.join(","))
    .bind(profile.tone.as_deref())
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

#[instrument(skip_all)]
pub async fn upsert_user(pool: &Pool, seed: &UserSeed) -> Result<()> {
    sqlx::query(
        "INSERT INTO users (id, phone, email, quota_used, quota_limit, quiet_start, quiet_end, utc_offset_minutes, notify_mode, business_profile_id) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET phone = excluded.phone, email = excluded.email, \
           quota_used = excluded.quota_used, quota_limit = excluded.quota_limit, \
           quiet_start = excluded.quiet_start, quiet_end = excluded.quiet_end, \
           utc_offset_minutes = excluded.utc_offset_minutes, notify_mode = excluded.notify_mode, \
           business_profile_id = excluded.business_profile_id",
    )
    .bind(&seed.id)
    .bind(seed.phone.as_deref())
    .bind(seed.email.as_deref())
    .bind(seed.quota_used)
    .bind(seed.quota_limit)
    .bind(seed.quiet_start.as_deref())
    .bind(seed.quiet_end.as_deref())
    .bind(seed.utc_offset_minutes)
    .bind(seed.notify_mode.as_str())
    .bind(seed.business_profile_id)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn insert_rule(
    pool: &Pool,
    owner_id: &str,
    query_string: &str,
    status: RuleStatus,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO rules (owner_id, query_string, status, created_at) VALUES (?, ?, ?, ?) RETURNING id",
    )
    .bind(owner_id)
    .bind(query_string)
    .bind(status.as_str())
    .bind(Utc::now())
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

/// Owners that have at least one active rule, in stable order.
#[instrument(skip_all)]
pub async fn owners_with_active_rules(pool: &Pool) -> Result<Vec<String>> {
    let owners = sqlx::query_scalar::<_, String>(
        "SELECT DISTINCT owner_id FROM rules WHERE status = 'active' ORDER BY owner_id",
    )
    .fetch_all(pool)
    .await?;
    Ok(owners)
}

#[instrument(skip_all)]
pub async fn active_rules_for_owner(pool: &Pool, owner_id: &str) -> Result<Vec<Rule>> {
    let rows = sqlx::query(
        "SELECT id, owner_id, query_string, status, created_at, last_match_at FROM rules \
         WHERE owner_id = ? AND status = 'active' ORDER BY id",
    )
    .bind(owner_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(rule_from_row).collect()
}

pub async fn fetch_rule(pool: &Pool, rule_id: i64) -> Result<Option<Rule>> {
    let row = sqlx::query(
        "SELECT id, owner_id, query_string, status, created_at, last_match_at FROM rules WHERE id = ?",
    )
    .bind(rule_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(rule_from_row).transpose()
}

fn rule_from_row(row: &SqliteRow) -> Result<Rule> {
    let id: i64 = row.get("id");
    let status_str: String = row.get("status");
    let status = RuleStatus::parse_status(&status_str)
        .ok_or_else(|| anyhow!("rule {} has unknown status {}", id, status_str))?;
    Ok(Rule {
        id,
        owner_id: row.get("owner_id"),
        query_string: row.get("query_string"),
        status,
        created_at: row.try_get("created_at").unwrap_or_else(|_| Utc::now()),
        last_match_at: row
            .try_get::<Option<DateTime<Utc>>, _>("last_match_at")
            .ok()
            .flatten(),
    })
}

#[instrument(skip_all)]
pub async fn fetch_user(pool: &Pool, user_id: &str) -> Result<Option<User>> {
    let row = sqlx::query(
        "SELECT u.id, u.phone, u.email, u.quota_used, u.quota_limit, u.quiet_start, u.quiet_end, \
                u.utc_offset_minutes, u.notify_mode, \
                p.id AS profile_id, p.name AS profile_name, p.summary AS profile_summary, \
                p.safe_topics AS profile_topics, p.tone AS profile_tone \
         FROM users u \
         LEFT JOIN business_profiles p ON u.business_profile_id = p.id \
         WHERE u.id = ?",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let mode_str: String = row.get("notify_mode");
    let notify_mode = NotifyMode::parse_mode(&mode_str)
        .ok_or_else(|| anyhow!("user {} has unknown notify_mode {}", user_id, mode_str))?;

    let business_profile = match row.try_get::<Option<i64>, _>("profile_id").ok().flatten() {
        Some(_) => {
            let topics: String = row.try_get("profile_topics").unwrap_or_default();
            Some(BusinessProfile {
                name: row.try_get("profile_name").unwrap_or_default(),
                summary: row.try_get("profile_summary").unwrap_or_default(),
                safe_topics: topics
                    .split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect(),
                tone: row.try_get::<Option<String>, _>("profile_tone").ok().flatten(),
            })
        }
        None => None,
    };

    Ok(Some(User {
        id: row.get("id"),
        phone: row.try_get::<Option<String>, _>("phone").ok().flatten(),
        email: row.try_get::<Option<String>, _>("email").ok().flatten(),
        quota_used: row.get("quota_used"),
        quota_limit: row.get("quota_limit"),
        quiet_start: row
            .try_get::<Option<String>, _>("quiet_start")
            .ok()
            .flatten()
            .filter(|s| !s.trim().is_empty()),
        quiet_end: row
            .try_get::<Option<String>, _>("quiet_end")
            .ok()
            .flatten()
            .filter(|s| !s.trim().is_empty()),
        utc_offset_minutes: row.get("utc_offset_minutes"),
        notify_mode,
        business_profile,
    }))
}

/// Take one send from the user's quota if any is left. `None` means the
/// quota is exhausted; the check and the increment are a single statement.
#[instrument(skip_all)]
pub async fn reserve_quota(pool: &Pool, user_id: &str) -> Result<Option<i64>> {
    let used: Option<i64> = sqlx::query_scalar(
        "UPDATE users SET quota_used = quota_used + 1 \
         WHERE id = ? AND quota_used < quota_limit RETURNING quota_used",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await
    .context("failed to reserve quota")?;
    Ok(used)
}

/// Give back a reservation whose send failed.
#[instrument(skip_all)]
pub async fn refund_quota(pool: &Pool, user_id: &str) -> Result<i64> {
    let used: i64 = sqlx::query_scalar(
        "UPDATE users SET quota_used = MAX(quota_used - 1, 0) WHERE id = ? RETURNING quota_used",
    )
    .bind(user_id)
    .fetch_one(pool)
    .await
    .context("failed to refund quota")?;
    Ok(used)
}

#[instrument(skip_all)]
pub async fn touch_rule_last_match(pool: &Pool, rule_id: i64, at: DateTime<Utc>) -> Result<()> {
    sqlx::query("UPDATE rules SET last_match_at = ? WHERE id = ?")
        .bind(at)
        .bind(rule_id)
        .execute(pool)
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Scan cursors.

#[instrument(skip_all)]
pub async fn get_cursor_ms(pool: &Pool, owner_id: &str) -> Result<Option<i64>> {
    let ms = sqlx::query_scalar::<_, i64>("SELECT since_at_ms FROM scan_cursors WHERE owner_id = ?")
        .bind(owner_id)
        .fetch_optional(pool)
        .await?;
    Ok(ms)
}

/// Upsert the watermark, never moving it backward. Returns the stored value.
#[instrument(skip_all)]
pub async fn advance_cursor_ms(pool: &Pool, owner_id: &str, since_at_ms: i64) -> Result<i64> {
    let stored: i64 = sqlx::query_scalar(
        "INSERT INTO scan_cursors (owner_id, since_at_ms, updated_at) VALUES (?, ?, CURRENT_TIMESTAMP) \
         ON CONFLICT(owner_id) DO UPDATE SET \
           since_at_ms = MAX(scan_cursors.since_at_ms, excluded.since_at_ms), \
           updated_at = CURRENT_TIMESTAMP \
         RETURNING since_at_ms",
    )
    .bind(owner_id)
    .bind(since_at_ms)
    .fetch_one(pool)
    .await?;
    Ok(stored)
}

// ---------------------------------------------------------------------------
// Scan locks.

/// Insert the lock row, or take over a row whose TTL has elapsed. A single
/// statement, so two racing callers cannot both succeed.
#[instrument(skip_all)]
pub async fn try_acquire_lock(
    pool: &Pool,
    lock_key: &str,
    owner_id: &str,
    holder_id: &str,
    now_ms: i64,
    expires_at_ms: i64,
) -> Result<bool> {
    let res = sqlx::query(
        "INSERT INTO scan_locks (lock_key, owner_id, holder_id, acquired_at_ms, expires_at_ms) \
         VALUES (?, ?, ?, ?, ?) \
         ON CONFLICT(lock_key) DO UPDATE SET \
           owner_id = excluded.owner_id, holder_id = excluded.holder_id, \
           acquired_at_ms = excluded.acquired_at_ms, expires_at_ms = excluded.expires_at_ms \
         WHERE scan_locks.expires_at_ms <= excluded.acquired_at_ms",
    )
    .bind(lock_key)
    .bind(owner_id)
    .bind(holder_id)
    .bind(now_ms)
    .bind(expires_at_ms)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

#[instrument(skip_all)]
pub async fn release_lock(pool: &Pool, lock_key: &str, holder_id: &str) -> Result<bool> {
    let res = sqlx::query("DELETE FROM scan_locks WHERE lock_key = ? AND holder_id = ?")
        .bind(lock_key)
        .bind(holder_id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() == 1)
}

#[instrument(skip_all)]
pub async fn reap_expired_locks(pool: &Pool, now_ms: i64) -> Result<u64> {
    let res = sqlx::query("DELETE FROM scan_locks WHERE expires_at_ms <= ?")
        .bind(now_ms)
        .execute(pool)
        .await?;
    Ok(res.rows_affected())
}

pub async fn fetch_lock(pool: &Pool, lock_key: &str) -> Result<Option<LockRow>> {
    let row = sqlx::query(
        "SELECT lock_key, owner_id, holder_id, acquired_at_ms, expires_at_ms FROM scan_locks WHERE lock_key = ?",
    )
    .bind(lock_key)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|row| LockRow {
        lock_key: row.get("lock_key"),
        owner_id: row.get("owner_id"),
        holder_id: row.get("holder_id"),
        acquired_at_ms: row.get("acquired_at_ms"),
        expires_at_ms: row.get("expires_at_ms"),
    }))
}

// ---------------------------------------------------------------------------
// Dedupe claims.

/// First writer wins. Returns true only for the insert that created the row.
#[instrument(skip_all)]
pub async fn insert_dedupe_claim(
    pool: &Pool,
    item_id: &str,
    owner_id: &str,
    at: DateTime<Utc>,
) -> Result<bool> {
    let res = sqlx::query(
        "INSERT INTO dedupe_records (item_id, owner_id, first_seen_at) VALUES (?, ?, ?) \
         ON CONFLICT(item_id, owner_id) DO NOTHING",
    )
    .bind(item_id)
    .bind(owner_id)
    .bind(at)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

pub async fn dedupe_claim_exists(pool: &Pool, item_id: &str, owner_id: &str) -> Result<bool> {
    let found = sqlx::query_scalar::<_, i64>(
        "SELECT 1 FROM dedupe_records WHERE item_id = ? AND owner_id = ?",
    )
    .bind(item_id)
    .bind(owner_id)
    .fetch_optional(pool)
    .await?;
    Ok(found.is_some())
}

// ---------------------------------------------------------------------------
// Audit logs.

#[instrument(skip_all)]
pub async fn insert_notification(pool: &Pool, record: &NotificationRecord) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO notification_records (item_id, rule_id, owner_id, channel, outcome, detail, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(&record.item_id)
    .bind(record.rule_id)
    .bind(&record.owner_id)
    .bind(record.channel.as_str())
    .bind(record.outcome.as_str())
    .bind(record.detail.as_deref())
    .bind(record.created_at)
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

pub async fn notifications_for_owner(pool: &Pool, owner_id: &str) -> Result<Vec<NotificationRecord>> {
    let rows = sqlx::query(
        "SELECT item_id, rule_id, owner_id, channel, outcome, detail, created_at \
         FROM notification_records WHERE owner_id = ? ORDER BY id",
    )
    .bind(owner_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|row| {
            let channel: String = row.get("channel");
            let outcome: String = row.get("outcome");
            Ok(NotificationRecord {
                item_id: row.get("item_id"),
                rule_id: row.get("rule_id"),
                owner_id: row.get("owner_id"),
                channel: Channel::parse_channel(&channel)
                    .ok_or_else(|| anyhow!("unknown channel {}", channel))?,
                outcome: Outcome::parse_outcome(&outcome)
                    .ok_or_else(|| anyhow!("unknown outcome {}", outcome))?,
                detail: row.try_get::<Option<String>, _>("detail").ok().flatten(),
                created_at: row.get("created_at"),
            })
        })
        .collect()
}

#[instrument(skip_all)]
pub async fn insert_ai_reply_log(pool: &Pool, log: &AiReplyLog) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO ai_reply_logs (item_id, rule_id, owner_id, relevant, errored, reason, reply_text, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(&log.item_id)
    .bind(log.rule_id)
    .bind(&log.owner_id)
    .bind(log.relevant)
    .bind(log.errored)
    .bind(&log.reason)
    .bind(log.reply_text.as_deref())
    .bind(log.created_at)
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

/// True when the model has already judged this item irrelevant for the owner.
#[instrument(skip_all)]
pub async fn ai_rejected(pool: &Pool, item_id: &str, owner_id: &str) -> Result<bool> {
    let rejected: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM ai_reply_logs \
         WHERE item_id = ? AND owner_id = ? AND relevant = 0 AND errored = 0)",
    )
    .bind(item_id)
    .bind(owner_id)
    .fetch_one(pool)
    .await?;
    Ok(rejected)
}

pub async fn count_ai_reply_logs(pool: &Pool, owner_id: &str) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ai_reply_logs WHERE owner_id = ?")
        .bind(owner_id)
        .fetch_one(pool)
        .await?;
    Ok(count)
}

// ---------------------------------------------------------------------------
// TTL key-value entries.

#[instrument(skip_all)]
pub async fn kv_put_if_absent(
    pool: &Pool,
    key: &str,
    value: &str,
    now_ms: i64,
    expires_at_ms: i64,
) -> Result<bool> {
    let res = sqlx::query(
        "INSERT INTO kv_entries (key, value, expires_at_ms) VALUES (?, ?, ?) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at_ms = excluded.expires_at_ms \
         WHERE kv_entries.expires_at_ms <= ?",
    )
    .bind(key)
    .bind(value)
    .bind(expires_at_ms)
    .bind(now_ms)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

pub async fn kv_get(pool: &Pool, key: &str, now_ms: i64) -> Result<Option<String>> {
    let value = sqlx::query_scalar::<_, String>(
        "SELECT value FROM kv_entries WHERE key = ? AND expires_at_ms > ?",
    )
    .bind(key)
    .bind(now_ms)
    .fetch_optional(pool)
    .await?;
    Ok(value)
}

pub async fn kv_delete(pool: &Pool, key: &str) -> Result<()> {
    sqlx::query("DELETE FROM kv_entries WHERE key = ?")
        .bind(key)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn kv_purge_expired(pool: &Pool, now_ms: i64) -> Result<u64> {
    let res = sqlx::query("DELETE FROM kv_entries WHERE expires_at_ms <= ?")
        .bind(now_ms)
        .execute(pool)
        .await?;
    Ok(res.rows_affected())
}
