//! Retry envelopes for component-level calls
//!
//! Queue-level retries live in `queue::Backoff`; this module only covers
//! in-process retries (PDF extraction strategies, AI calls).

use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Attempts plus a linear delay of `step * attempt` between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub step: Duration,
}

impl RetryPolicy {
    pub const fn linear(attempts: u32, step: Duration) -> Self {
        Self { attempts, step }
    }

    /// Same attempt count, no waiting. Used by tests.
    pub const fn immediate(attempts: u32) -> Self {
        Self {
            attempts,
            step: Duration::ZERO,
        }
    }

    /// Delay to wait after the given (1-based) failed attempt.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.step * attempt
    }

    /// Run `op` until it succeeds or attempts are exhausted; the last error is returned.
    pub async fn run<T, E, F, Fut>(&self, what: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= attempts => return Err(e),
                Err(e) => {
                    warn!("{} failed (attempt {}/{}): {}", what, attempt, attempts, e);
                    tokio::time::sleep(self.delay_after(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }
}
