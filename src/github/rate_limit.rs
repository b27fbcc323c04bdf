//! Hourly-quota accounting from `X-RateLimit-*` response headers.
//!
//! The server reports a counter per resource class (`core`, `search`, ...)
//! on every response. [`RateLimiter`] keeps the latest snapshot per class
//! and refuses to dispatch once the remaining quota dips into a configured
//! safety buffer, so the monitor backs off before the server starts
//! returning 403s.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use tracing as log;

use crate::github::error::{GithubError, Result};

pub const DEFAULT_RATE_LIMIT_BUFFER: u64 = 100;
const DEFAULT_MAX_RETRY_WAIT: Duration = Duration::from_secs(3600);

fn unix_now() -> u64 {
    SystemTime::UNIX_EPOCH
        .elapsed()
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// The most recent quota snapshot for one resource class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimit {
    pub limit: u64,
    pub remaining: u64,
    /// Unix timestamp at which the window resets.
    pub reset: u64,
    pub used: u64,
    pub resource: String,
}

impl RateLimit {
    pub fn seconds_until_reset(&self) -> u64 {
        self.reset.saturating_sub(unix_now())
    }

    pub fn reset_datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.reset as i64, 0)
    }

    pub fn is_exceeded(&self) -> bool {
        self.remaining == 0
    }

    pub fn usage_percentage(&self) -> f64 {
        if self.limit == 0 {
            return 0.0;
        }
        (self.limit.saturating_sub(self.remaining) as f64 / self.limit as f64) * 100.0
    }
}

/// Tracks per-resource quota snapshots and gates dispatch.
#[derive(Debug)]
pub struct RateLimiter {
    buffer: u64,
    retry_after_reset: bool,
    max_retry_wait: Duration,
    limits: RwLock<HashMap<String, RateLimit>>,
}

impl RateLimiter {
    pub fn new(buffer: u64) -> Self {
        RateLimiter {
            buffer,
            retry_after_reset: true,
            max_retry_wait: DEFAULT_MAX_RETRY_WAIT,
            limits: RwLock::new(HashMap::new()),
        }
    }

    /// Latest snapshot for `resource`, if one has been observed.
    pub fn snapshot(&self, resource: &str) -> Option<RateLimit> {
        self.limits
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(resource)
            .cloned()
    }

    /// Record the quota state reported by a response.
    ///
    /// Responses without `X-RateLimit-Limit` are ignored. A missing or
    /// non-integer `limit`, `remaining` or `reset` discards the whole
    /// update; `used` defaults to 0 and `resource` to `core`.
    pub fn update_from_headers(&self, headers: &HeaderMap) {
        if !headers.contains_key("x-ratelimit-limit") {
            return;
        }
        let Some(limit) = header_u64(headers, "x-ratelimit-limit") else {
            return;
        };
        let Some(remaining) = header_u64(headers, "x-ratelimit-remaining") else {
            return;
        };
        let Some(reset) = header_u64(headers, "x-ratelimit-reset") else {
            return;
        };
        let used = match headers.get("x-ratelimit-used") {
            Some(_) => match header_u64(headers, "x-ratelimit-used") {
                Some(used) => used,
                None => return,
            },
            None => 0,
        };
        let resource = headers
            .get("x-ratelimit-resource")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("core")
            .to_string();

        let snapshot = RateLimit {
            limit,
            remaining,
            reset,
            used,
            resource: resource.clone(),
        };
        self.limits
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(resource, snapshot);
    }

    /// Pre-dispatch gate: fails with a rate-limit error once the remaining
    /// quota is inside the buffer and the window has not reset yet.
    pub fn check(&self, resource: &str) -> Result<()> {
        let Some(snapshot) = self.snapshot(resource) else {
            return Ok(());
        };
        if snapshot.remaining > self.buffer {
            return Ok(());
        }
        let until_reset = snapshot.seconds_until_reset();
        if self.retry_after_reset && until_reset > 0 {
            let wait = until_reset.min(self.max_retry_wait.as_secs());
            return Err(GithubError::RateLimit {
                message: format!(
                    "rate limit approaching for {resource}: {} remaining, resets in {wait}s",
                    snapshot.remaining
                ),
                reset: Some(snapshot.reset),
                remaining: snapshot.remaining,
                limit: snapshot.limit,
            });
        }
        Ok(())
    }

    /// Sleep until the window for `resource` resets. Returns immediately
    /// when the quota is not exhausted.
    pub async fn wait_for_reset(&self, resource: &str) {
        let Some(snapshot) = self.snapshot(resource) else {
            return;
        };
        if !snapshot.is_exceeded() {
            return;
        }
        let wait = Duration::from_secs(snapshot.seconds_until_reset() + 1).min(self.max_retry_wait);
        if !wait.is_zero() {
            log::debug!(
                "waiting {}s for {resource} rate limit reset",
                wait.as_secs()
            );
            tokio::time::sleep(wait).await;
        }
    }

    /// Whether usage for `resource` is past 80% of the quota.
    pub fn should_backoff(&self, resource: &str) -> bool {
        self.snapshot(resource)
            .is_some_and(|s| s.usage_percentage() > 80.0)
    }

    /// Suggested pause before the next call, scaled by quota usage.
    pub fn backoff_duration(&self, resource: &str) -> Duration {
        let Some(snapshot) = self.snapshot(resource) else {
            return Duration::ZERO;
        };
        let usage = snapshot.usage_percentage();
        if usage < 80.0 {
            Duration::ZERO
        } else if usage < 90.0 {
            Duration::from_secs(1)
        } else if usage < 95.0 {
            Duration::from_secs(5)
        } else {
            Duration::from_secs_f64((snapshot.seconds_until_reset() as f64 / 10.0).min(30.0))
        }
    }
}

pub(crate) fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
}
