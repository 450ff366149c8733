//! Bounded retry with exponential backoff
//!
//! Applied uniformly to idempotent exchange requests. Only transient
//! errors (connectivity, rate limits) are retried; everything else is
//! returned on the first attempt. With a budget set, a retry is skipped
//! once its backoff plus another attempt would no longer fit.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::ExchangeError;

/// Exponential backoff with jitter.
///
/// Formula: min(max_delay, base * 2^attempt) + random_jitter
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    max_delay: Duration,
    jitter_factor: f64,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max_delay: Duration, jitter_factor: f64) -> Self {
        Self {
            base,
            max_delay,
            jitter_factor: jitter_factor.clamp(0.0, 1.0),
            attempt: 0,
        }
    }

    /// Next delay; increments the attempt counter
    pub fn next_delay(&mut self) -> Duration {
        let exp_delay = self.base.saturating_mul(2u32.saturating_pow(self.attempt));
        let capped = exp_delay.min(self.max_delay);

        let jitter_range = capped.as_secs_f64() * self.jitter_factor;
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        self.attempt = self.attempt.saturating_add(1);
        Duration::from_secs_f64((capped.as_secs_f64() + jitter).max(0.0))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// Retry parameters shared by every adapter
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
    /// Wall-clock bound across all attempts and backoff sleeps
    pub budget: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
            jitter_factor: 0.1,
            budget: None,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            ..Default::default()
        }
    }

    /// Single attempt, no sleeping
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter_factor: 0.0,
            budget: None,
        }
    }

    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = Some(budget);
        self
    }

    /// Per-request timeout: an even share of the budget per attempt
    pub fn attempt_timeout(&self) -> Option<Duration> {
        self.budget.map(|budget| budget / self.max_attempts.max(1))
    }

    /// Whether sleeping `delay` and trying once more still fits the budget
    fn retry_fits(&self, started: Instant, delay: Duration) -> bool {
        match (self.budget, self.attempt_timeout()) {
            (Some(budget), Some(per_attempt)) => {
                started.elapsed() + delay + per_attempt <= budget
            }
            _ => true,
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(self.base_delay, self.max_delay, self.jitter_factor)
    }

    /// Delay before the next attempt. Rate limits wait longer than plain connectivity errors.
    fn delay_for(&self, backoff: &mut ExponentialBackoff, err: &ExchangeError) -> Duration {
        let delay = backoff.next_delay();
        match err {
            ExchangeError::RateLimited {
                retry_after: Some(after),
            } => (*after).max(delay),
            ExchangeError::RateLimited { retry_after: None } => delay.saturating_mul(2),
            _ => delay,
        }
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, ExchangeError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ExchangeError>>,
    {
        let mut backoff = self.backoff();
        let mut attempt = 1u32;
        let started = Instant::now();

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay_for(&mut backoff, &e);
                    if !self.retry_fits(started, delay) {
                        tracing::warn!(
                            request = %label,
                            attempt = attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Retry budget exhausted, giving up"
                        );
                        return Err(e);
                    }
                    tracing::warn!(
                        request = %label,
                        attempt = attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient exchange error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn make_fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            jitter_factor: 0.0,
            budget: None,
        }
    }

    fn make_budgeted_policy(budget_secs: u64) -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
            jitter_factor: 0.0,
            budget: None,
        }
        .with_budget(Duration::from_secs(budget_secs))
    }

    #[test]
    fn test_backoff_increases_exponentially() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60), 0.0);

        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        assert_eq!(backoff.attempt(), 3);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_caps_at_max() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(10), 0.0);
        for _ in 0..10 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = make_fast_policy(3);

        let c = calls.clone();
        let result = policy
            .run("ticker", move || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(ExchangeError::Connectivity("reset".into()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = make_fast_policy(3);

        let c = calls.clone();
        let result: Result<(), _> = policy
            .run("ticker", move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(ExchangeError::RateLimited { retry_after: None })
                }
            })
            .await;

        assert!(matches!(result, Err(ExchangeError::RateLimited { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = make_fast_policy(5);

        let c = calls.clone();
        let result: Result<(), _> = policy
            .run("order", move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(ExchangeError::RejectedByExchange("bad qty".into()))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_attempt_timeout_is_share_of_budget() {
        assert_eq!(make_budgeted_policy(6).attempt_timeout(), Some(Duration::from_secs(2)));
        assert_eq!(make_fast_policy(3).attempt_timeout(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_backoff_stays_within_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = make_budgeted_policy(5);
        let started = Instant::now();

        let c = calls.clone();
        let result: Result<(), _> = policy
            .run("ticker", move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(ExchangeError::RateLimited { retry_after: None })
                }
            })
            .await;

        // First retry waits 2s; the second would wait 4s and overrun 5s
        assert!(matches!(result, Err(ExchangeError::RateLimited { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(started.elapsed() <= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_attempt_is_retried_within_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = make_budgeted_policy(9);
        let per_attempt = policy.attempt_timeout().unwrap();
        let started = Instant::now();

        let c = calls.clone();
        let result = policy
            .run("ticker", move || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) == 0 {
                        tokio::time::sleep(per_attempt).await;
                        Err(ExchangeError::Connectivity("timeout".into()))
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(started.elapsed() < Duration::from_secs(9));
    }
}
