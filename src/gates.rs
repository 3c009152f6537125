//! Pure policy predicates over user state.
use chrono::{DateTime, Duration, NaiveTime, Timelike, Utc};
use tracing::warn;

use crate::model::User;

/// True while the user still has paid sends left.
pub fn quota_allows(user: &User) -> bool {
    user.quota_used < user.quota_limit
}

/// Parse a strict `HH:MM` wall-clock value.
pub fn parse_hhmm(value: &str) -> Option<NaiveTime> {
    let (h, m) = value.trim().split_once(':')?;
    if h.is_empty() || h.len() > 2 || m.len() != 2 {
        return None;
    }
    let h: u32 = h.parse().ok()?;
    let m: u32 = m.parse().ok()?;
    NaiveTime::from_hms_opt(h, m, 0)
}

/// Quiet-window test at a local wall-clock time. Both ends are inclusive; a
/// window whose start is after its end wraps past midnight. Unset or
/// malformed bounds never make the user quiet.
pub fn is_quiet_at(quiet_start: Option<&str>, quiet_end: Option<&str>, now: NaiveTime) -> bool {
    let (Some(start_raw), Some(end_raw)) = (quiet_start, quiet_end) else {
        return false;
    };
    let (start, end) = match (parse_hhmm(start_raw), parse_hhmm(end_raw)) {
        (Some(s), Some(e)) => (s, e),
        _ => {
            warn!(
                quiet_start = start_raw,
                quiet_end = end_raw,
                "malformed quiet hours; treating as not quiet"
            );
            return false;
        }
    };
    // Minute resolution, matching the HH:MM bounds.
    let now = NaiveTime::from_hms_opt(now.hour(), now.minute(), 0).unwrap_or(now);
    if start > end {
        now >= start || now <= end
    } else {
        now >= start && now <= end
    }
}

/// Quiet-window test for a user at an absolute instant, evaluated in the
/// user's local time.
pub fn is_quiet(user: &User, now: DateTime<Utc>) -> bool {
    let local = now + Duration::minutes(i64::from(user.utc_offset_minutes));
    is_quiet_at(
        user.quiet_start.as_deref(),
        user.quiet_end.as_deref(),
        local.time(),
    )
}
