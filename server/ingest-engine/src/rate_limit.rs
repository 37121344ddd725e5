//! Advisory fixed-window rate limiting.
//!
//! A decision never gates anything: callers log the overage and carry on. Counter store
//! failures also answer "allowed".

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::store::{with_timeout, CounterStore};
use crate::types::RateLimitDecision;

pub struct RateLimiter {
  counters: Arc<dyn CounterStore>,
  timeout: Duration,
}

impl RateLimiter {
  pub fn new(counters: Arc<dyn CounterStore>, timeout: Duration) -> Self {
    Self { counters, timeout }
  }

  pub async fn check(&self, subject: &str, limit: u64, window_secs: u64) -> RateLimitDecision {
    self.check_at(subject, limit, window_secs, Utc::now()).await
  }

  /// Count one call against `subject` in the window containing `now`.
  pub async fn check_at(
    &self,
    subject: &str,
    limit: u64,
    window_secs: u64,
    now: DateTime<Utc>,
  ) -> RateLimitDecision {
    let window_secs = window_secs.max(1);
    let epoch_secs = now.timestamp().max(0) as u64;
    let bucket = epoch_secs / window_secs;
    let reset_in_secs = window_secs - epoch_secs % window_secs;
    let key = format!("ratelimit:{}:{}", subject, bucket);

    let count = match with_timeout(
      self.timeout,
      self
        .counters
        .increment(&key, Some(Duration::from_secs(window_secs))),
    )
    .await
    {
      Ok(count) => count,
      Err(e) => {
        warn!(subject, error = %e, "rate limit counter unavailable; allowing");
        return RateLimitDecision {
          allowed: true,
          remaining: limit,
          reset_in_secs,
        };
      }
    };

    RateLimitDecision {
      allowed: count <= limit,
      remaining: limit.saturating_sub(count),
      reset_in_secs,
    }
  }
}
