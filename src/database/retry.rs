use std::future::Future;
use std::time::Duration;

use tracing::warn;

use super::StoreResult;
use crate::config::RetryConfig;

/// Delay before retry `attempt` (1-based): `base * multiplier^(attempt-1)`, capped
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let delay = config
        .base_delay()
        .mul_f64(config.multiplier.powi(attempt.saturating_sub(1) as i32));
    delay.min(config.max_delay())
}

/// Consecutive-failure budget for agent loops that retry a whole iteration
/// rather than one store call
#[derive(Debug, Clone)]
pub struct LoopBackoff {
    config: RetryConfig,
    failures: u32,
}

impl LoopBackoff {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            failures: 0,
        }
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Count a failure; the delay before the next iteration, or `None` once
    /// `max_attempts` consecutive iterations have failed
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.failures += 1;
        (self.failures < self.config.max_attempts)
            .then(|| backoff_delay(&self.config, self.failures))
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

/// Run a store operation, retrying lock contention and dropped connections
/// with exponential backoff. Other errors are returned immediately.
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, operation: &str, mut op: F) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < config.max_attempts => {
                let delay = backoff_delay(config, attempt);
                warn!(
                    operation = operation,
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retrying store operation"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::StoreError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config() -> RetryConfig {
        RetryConfig {
            max_attempts: 4,
            base_delay_ms: 1,
            max_delay_ms: 4,
            multiplier: 2.0,
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = fast_config();
        assert_eq!(backoff_delay(&config, 1), Duration::from_millis(1));
        assert_eq!(backoff_delay(&config, 3), Duration::from_millis(4));
        assert_eq!(backoff_delay(&config, 10), Duration::from_millis(4));
    }

    #[tokio::test]
    async fn test_retries_contention_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&fast_config(), "claim", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(StoreError::LockContention("busy".into()))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts_and_skips_fatal_errors() {
        let calls = AtomicU32::new(0);
        let result: StoreResult<()> = with_retry(&fast_config(), "claim", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::ConnectionLost("reset".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        let calls = AtomicU32::new(0);
        let result: StoreResult<()> = with_retry(&fast_config(), "claim", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Conflict("dup".into()))
        })
        .await;
        assert!(matches!(result, Err(StoreError::Conflict(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_loop_backoff_budget_resets_on_success() {
        let mut backoff = LoopBackoff::new(fast_config());
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(1)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(2)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(4)));
        assert_eq!(backoff.next_delay(), None);

        backoff.reset();
        assert_eq!(backoff.failures(), 0);
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(1)));
    }
}
