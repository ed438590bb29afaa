//! Bounded retry with error-class backoff tiers.
//!
//! One `RetryPolicy` per LLM-backed stage. The policy owns the attempt budget
//! and a `Backoff` per `RetryCategory`; stages hand it a closure and get back
//! either the first success or `HarvestError::Exhausted`.
//!
//! ```text
//! attempt 0 ── Err(timeout) ── sleep timeout.delay(0) ──┐
//! attempt 1 ── Err(rate)    ── sleep rate_limit.delay(1) ┤
//! attempt 2 ── Ok(v) ───────────────────────────────────┴─→ Ok(v)
//! ```
//!
//! No sleep follows the final attempt.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::{HarvestError, RetryCategory};

/// Linear backoff: `base + attempt * step`, attempt counted from zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    #[serde(with = "crate::pacing::duration_secs")]
    pub base: Duration,
    #[serde(with = "crate::pacing::duration_secs")]
    pub step: Duration,
}

impl Backoff {
    pub const fn linear(base_secs: u64, step_secs: u64) -> Self {
        Self {
            base: Duration::from_secs(base_secs),
            step: Duration::from_secs(step_secs),
        }
    }

    pub const fn fixed(base_secs: u64) -> Self {
        Self::linear(base_secs, 0)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        self.base + self.step * attempt
    }
}

/// Attempt budget plus one backoff tier per error class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub timeout: Backoff,
    pub rate_limit: Backoff,
    pub transient: Backoff,
    pub parse_failure: Backoff,
}

impl RetryPolicy {
    /// Same backoff for every error class.
    pub fn uniform(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts,
            timeout: backoff,
            rate_limit: backoff,
            transient: backoff,
            parse_failure: backoff,
        }
    }

    /// Three tiers for transport errors; parse failures use `transient`.
    pub fn tiered(max_attempts: u32, timeout: Backoff, rate_limit: Backoff, transient: Backoff) -> Self {
        Self {
            max_attempts,
            timeout,
            rate_limit,
            transient,
            parse_failure: transient,
        }
    }

    pub fn with_parse_failure(mut self, backoff: Backoff) -> Self {
        self.parse_failure = backoff;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// How long to wait after `attempt` failed with an error of `category`.
    pub fn backoff_for(&self, category: RetryCategory, attempt: u32) -> Duration {
        let tier = match category {
            RetryCategory::Timeout => self.timeout,
            RetryCategory::RateLimit => self.rate_limit,
            RetryCategory::ParseFailure => self.parse_failure,
            RetryCategory::Transient | RetryCategory::Terminal => self.transient,
        };
        tier.delay(attempt)
    }

    /// Run `op` until it succeeds, fails terminally, or the budget is spent.
    ///
    /// `op` receives the zero-based attempt index. A policy with
    /// `max_attempts == 0` still makes one attempt.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, HarvestError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, HarvestError>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let category = err.retry_category();
            warn!(
                stage = label,
                attempt = attempt + 1,
                max_attempts = attempts,
                category = %category,
                error = %err.truncated(60),
                "attempt failed"
            );

            let last_attempt = attempt + 1 >= attempts;
            if last_attempt || !category.is_retriable() {
                return Err(HarvestError::Exhausted {
                    label: label.to_string(),
                    attempts: attempt + 1,
                    last: Box::new(err),
                });
            }

            tokio::time::sleep(self.backoff_for(category, attempt)).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    fn production_like() -> RetryPolicy {
        RetryPolicy::tiered(
            4,
            Backoff::linear(8, 4),
            Backoff::linear(15, 5),
            Backoff::linear(5, 3),
        )
    }

    #[test]
    fn backoff_tiers_follow_error_class() {
        let policy = production_like();
        assert_eq!(
            policy.backoff_for(RetryCategory::Timeout, 2),
            Duration::from_secs(16)
        );
        assert_eq!(
            policy.backoff_for(RetryCategory::RateLimit, 1),
            Duration::from_secs(20)
        );
        assert_eq!(
            policy.backoff_for(RetryCategory::Transient, 0),
            Duration::from_secs(5)
        );
        assert_eq!(
            policy.backoff_for(RetryCategory::ParseFailure, 3),
            Duration::from_secs(14)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = Cell::new(0u32);
        let start = tokio::time::Instant::now();
        let result = production_like()
            .run("classify", |attempt| {
                calls.set(calls.get() + 1);
                async move {
                    if attempt < 2 {
                        Err(HarvestError::Timeout("slow".into()))
                    } else {
                        Ok("SI")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "SI");
        assert_eq!(calls.get(), 3);
        // 8 + 12 seconds of timeout backoff
        assert_eq!(start.elapsed(), Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_budget_without_trailing_sleep() {
        let calls = Cell::new(0u32);
        let start = tokio::time::Instant::now();
        let policy = RetryPolicy::uniform(3, Backoff::linear(1, 1));
        let result: Result<(), _> = policy
            .run("format", |_| {
                calls.set(calls.get() + 1);
                async { Err(HarvestError::Request("boom".into())) }
            })
            .await;

        assert_eq!(calls.get(), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(1 + 2));
        match result {
            Err(HarvestError::Exhausted { attempts, label, .. }) => {
                assert_eq!(attempts, 3);
                assert_eq!(label, "format");
            }
            other => panic!("expected Exhausted, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_error_stops_immediately() {
        let calls = Cell::new(0u32);
        let result: Result<(), _> = production_like()
            .run("crm", |_| {
                calls.set(calls.get() + 1);
                async { Err(HarvestError::Configuration("no key".into())) }
            })
            .await;
        assert_eq!(calls.get(), 1);
        assert!(matches!(result, Err(HarvestError::Exhausted { attempts: 1, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_budget_still_tries_once() {
        let calls = Cell::new(0u32);
        let policy = RetryPolicy::uniform(0, Backoff::fixed(1));
        let result = policy
            .run("classify", |_| {
                calls.set(calls.get() + 1);
                async { Ok::<_, HarvestError>(1) }
            })
            .await;
        assert_eq!(result.unwrap(), 1);
        assert_eq!(calls.get(), 1);
    }
}
