//! Rotating pool of search-provider API keys.
//!
//! Retry policy, usage accounting and the call itself are separate pieces:
//! `RetryPolicy` decides what a status code means, `CredentialAccounting`
//! counts requests, and `CredentialPool::execute` drives an arbitrary async
//! call through both.
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::config;
use crate::error::{ScoutError, ScoutResult};

#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub index: usize,
    pub key: String,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("index", &self.index)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    /// Credential rejected: switch keys and try again right away.
    Rotate,
    /// Rate limited: switch keys and wait before the next attempt.
    RotateAndBackoff,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &config::Retry) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
        }
    }

    /// `base × 2^attempt`, capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn classify(&self, err: &ScoutError) -> RetryAction {
        match err.status() {
            Some(401) | Some(403) => RetryAction::Rotate,
            Some(429) => RetryAction::RotateAndBackoff,
            _ => RetryAction::Fail,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&config::Retry::default())
    }
}

/// Per-credential request counters. Best-effort load spreading only; nothing
/// relies on these numbers for correctness.
pub trait CredentialAccounting: Send + Sync {
    fn record(&self, index: usize);
    fn snapshot(&self) -> Vec<u64>;
    fn reset(&self);
    fn last_reset_at(&self) -> DateTime<Utc>;
}

/// In-process accounting for single-instance deployments.
pub struct LocalAccounting {
    inner: Mutex<LocalCounts>,
}

struct LocalCounts {
    counts: Vec<u64>,
    reset_at: DateTime<Utc>,
}

impl LocalAccounting {
    pub fn new(size: usize) -> Self {
        Self {
            inner: Mutex::new(LocalCounts {
                counts: vec![0; size],
                reset_at: Utc::now(),
            }),
        }
    }
}

impl CredentialAccounting for LocalAccounting {
    fn record(&self, index: usize) {
        if let Ok(mut guard) = self.inner.lock() {
            if let Some(slot) = guard.counts.get_mut(index) {
                *slot += 1;
            }
        }
    }

    fn snapshot(&self) -> Vec<u64> {
        self.inner
            .lock()
            .map(|guard| guard.counts.clone())
            .unwrap_or_default()
    }

    fn reset(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.counts.iter_mut().for_each(|c| *c = 0);
            guard.reset_at = Utc::now();
        }
    }

    fn last_reset_at(&self) -> DateTime<Utc> {
        self.inner
            .lock()
            .map(|guard| guard.reset_at)
            .unwrap_or_else(|_| Utc::now())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialUsage {
    pub index: usize,
    pub requests: u64,
    pub current: bool,
}

pub struct CredentialPool {
    keys: Vec<String>,
    current: AtomicUsize,
    policy: RetryPolicy,
    accounting: Arc<dyn CredentialAccounting>,
}

impl fmt::Debug for CredentialPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialPool")
            .field("size", &self.keys.len())
            .field("current", &self.current.load(Ordering::SeqCst))
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl CredentialPool {
    pub fn new(keys: Vec<String>, policy: RetryPolicy) -> ScoutResult<Self> {
        let accounting = Arc::new(LocalAccounting::new(keys.len()));
        Self::with_accounting(keys, policy, accounting)
    }

    pub fn with_accounting(
        keys: Vec<String>,
        policy: RetryPolicy,
        accounting: Arc<dyn CredentialAccounting>,
    ) -> ScoutResult<Self> {
        let keys: Vec<String> = keys
            .into_iter()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect();
        if keys.is_empty() {
            return Err(ScoutError::Configuration(
                "credential pool needs at least one API key".into(),
            ));
        }
        Ok(Self {
            keys,
            current: AtomicUsize::new(0),
            policy,
            accounting,
        })
    }

    pub fn from_config(cfg: &config::Search) -> ScoutResult<Self> {
        Self::new(cfg.api_keys.clone(), RetryPolicy::from_config(&cfg.retry))
    }

    pub fn current(&self) -> Credential {
        let index = self.current.load(Ordering::SeqCst) % self.keys.len();
        Credential {
            index,
            key: self.keys[index].clone(),
        }
    }

    /// Advance to the next key, wrapping around. Counters are untouched.
    pub fn rotate(&self) -> Credential {
        let len = self.keys.len();
        let prev = self
            .current
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |i| Some((i + 1) % len))
            .unwrap_or(0);
        let index = (prev + 1) % len;
        debug!(from = prev, to = index, "rotated credential");
        Credential {
            index,
            key: self.keys[index].clone(),
        }
    }

    /// Run `call` with the current credential, rotating on 401/403 and
    /// rotating with exponential backoff on 429. Any other failure returns
    /// immediately. When attempts run out the last error is returned.
    pub async fn execute<T, F, Fut>(&self, mut call: F) -> ScoutResult<T>
    where
        F: FnMut(Credential) -> Fut,
        Fut: Future<Output = ScoutResult<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            let credential = self.current();
            self.accounting.record(credential.index);
            let err = match call(credential.clone()).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let action = self.policy.classify(&err);
            attempt += 1;
            if action == RetryAction::Fail || attempt >= self.policy.max_attempts {
                return Err(err);
            }

            warn!(
                credential = credential.index,
                status = err.status(),
                attempt,
                "credential rejected; rotating"
            );
            self.rotate();
            if action == RetryAction::RotateAndBackoff {
                tokio::time::sleep(self.policy.backoff(attempt - 1)).await;
            }
        }
    }

    pub fn usage_stats(&self) -> Vec<CredentialUsage> {
        let current = self.current().index;
        let counts = self.accounting.snapshot();
        (0..self.keys.len())
            .map(|index| CredentialUsage {
                index,
                requests: counts.get(index).copied().unwrap_or(0),
                current: index == current,
            })
            .collect()
    }

    pub fn reset_counts(&self) {
        self.accounting.reset();
    }

    /// Start of the current counting period.
    pub fn counting_since(&self) -> DateTime<Utc> {
        self.accounting.last_reset_at()
    }
}
