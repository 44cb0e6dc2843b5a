use backoff::backoff::Backoff;
use backoff::exponential::ExponentialBackoff;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Bounded-attempt exponential backoff, independent of what is being retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

/// Final result of a retried operation together with how many calls it took.
#[derive(Debug)]
pub struct Attempted<T, E> {
    pub result: Result<T, E>,
    pub attempts: u32,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay: base_delay.saturating_mul(32),
        }
    }

    fn backoff(&self) -> ExponentialBackoff<backoff::SystemClock> {
        ExponentialBackoff {
            current_interval: self.base_delay,
            initial_interval: self.base_delay,
            max_interval: self.max_delay,
            multiplier: 2.0,
            randomization_factor: 0.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    /// Call `op` until it succeeds, returns a non-retryable error, or the
    /// attempt budget is spent.
    pub async fn run<T, E, F, Fut>(&self, label: &str, is_retryable: impl Fn(&E) -> bool, mut op: F) -> Attempted<T, E>
    where
        E: std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut backoff = self.backoff();
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match op().await {
                Ok(value) => {
                    return Attempted { result: Ok(value), attempts: attempt };
                }
                Err(e) => {
                    if attempt >= max_attempts || !is_retryable(&e) {
                        return Attempted { result: Err(e), attempts: attempt };
                    }
                    let delay = backoff.next_backoff().unwrap_or(self.max_delay);
                    warn!(label, attempt, error = %e, "Attempt failed, retrying in {:?}", delay);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(2))
    }
}
