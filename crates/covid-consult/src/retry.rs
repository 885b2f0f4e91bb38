//! Bounded retry with fixed or exponential backoff for calls that can fail
//! transiently (LLM endpoints, the embedding endpoint, busy SQLite writers).

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::Transient;

/// Upper bound for a single backoff sleep.
const MAX_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay between every attempt.
    Fixed(Duration),
    /// `base * 2^(attempt-1)`, capped at 30s.
    Exponential(Duration),
}

impl Backoff {
    /// Delay before retry number `attempt` (1-based: the delay after the first
    /// failed attempt is `delay_for(1)`).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed(d) => d,
            Backoff::Exponential(base) => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                base.saturating_mul(factor).min(MAX_DELAY)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Always at least 1.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Fixed(Duration::from_secs(1)),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self { max_attempts: max_attempts.max(1), backoff }
    }

    /// A policy that makes exactly one attempt.
    pub fn none() -> Self {
        Self::new(1, Backoff::Fixed(Duration::ZERO))
    }

    /// Run `op`, retrying while the error reports itself as transient.
    pub async fn run<T, E, F, Fut>(&self, label: &str, op: F) -> Result<T, E>
    where
        E: Transient + std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run_if(label, |e: &E| e.is_transient(), op).await
    }

    /// Run `op`, retrying while `should_retry` accepts the error and attempts
    /// remain. The last error is returned unchanged.
    pub async fn run_if<T, E, F, Fut, P>(&self, label: &str, should_retry: P, mut op: F) -> Result<T, E>
    where
        E: std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("{} succeeded on attempt {}/{}", label, attempt, max_attempts);
                    }
                    return Ok(value);
                }
                Err(e) if attempt < max_attempts && should_retry(&e) => {
                    let delay = self.backoff.delay_for(attempt);
                    warn!(
                        "{} failed (attempt {}/{}): {}; retrying in {:?}",
                        label, attempt, max_attempts, e, delay
                    );
                    #[cfg(feature = "cli")]
                    crate::metrics::inc_retry(label);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
