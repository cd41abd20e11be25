//! Bounded exponential backoff shared by the market-data fetcher and the
//! model clients.

use std::time::Duration;

/// Total attempts (first try included) and the base backoff delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_backoff_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_backoff: Duration::from_millis(base_backoff_ms),
        }
    }

    /// No waiting between attempts. Used by tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, 0)
    }

    /// Delay before attempt `attempt` (1-based). The first attempt never
    /// waits; later ones wait `base * 2^(attempt - 2)`.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exp = (attempt - 2).min(16);
        self.base_backoff.saturating_mul(1u32 << exp)
    }

    /// Sleep for the backoff owed before `attempt`.
    pub async fn wait(&self, attempt: u32) {
        let delay = self.delay_before(attempt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}
