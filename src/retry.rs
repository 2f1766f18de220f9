use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Bounded retry with exponential backoff. `retries` counts attempts after
/// the first one, so `retries = 1` means at most two calls.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retries: u32,
    pub base_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(retries: u32, base_backoff: Duration) -> Self {
        Self {
            retries,
            base_backoff,
        }
    }

    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Backoff before retry number `retry` (1-based): base, 2x base, 4x base...
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base_backoff.saturating_mul(factor)
    }

    pub fn max_attempts(&self) -> u32 {
        self.retries + 1
    }

    /// Calls `op` until it yields an outcome `should_retry` rejects, or attempts
    /// run out. The last outcome is returned either way.
    pub async fn run<T, F, Fut, P>(&self, label: &str, mut op: F, should_retry: P) -> T
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = T>,
        P: Fn(&T) -> bool,
    {
        let max = self.max_attempts();
        let mut attempt = 1;
        loop {
            let outcome = op(attempt).await;
            if attempt >= max || !should_retry(&outcome) {
                return outcome;
            }
            let backoff = self.backoff(attempt);
            warn!(
                operation = label,
                attempt,
                max_attempts = max,
                backoff_ms = backoff.as_millis() as u64,
                "transient failure, retrying"
            );
            tokio::time::sleep(backoff).await;
            attempt += 1;
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(1, Duration::from_millis(500))
    }
}
