//! Retry policy for processor calls
//!
//! Only transient errors are retried. Every money-moving request carries an
//! idempotency key, so a replay cannot duplicate the operation upstream.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use super::ProcessorError;
use crate::config::RetryConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        let base = config.base_delay_ms.max(1);
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(base),
            max_delay: Duration::from_millis(config.max_delay_ms.max(base)),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Same backoff, fewer attempts
    pub fn capped(self, max_attempts: u32) -> Self {
        Self {
            max_attempts: self.max_attempts.min(max_attempts.max(1)),
            ..self
        }
    }

    /// Backoff ceiling before the given retry (1-based)
    pub fn delay_cap(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.saturating_sub(1).min(20)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    pub async fn run<F, Fut, T>(&self, desc: &str, mut op: F) -> Result<T, ProcessorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProcessorError>>,
    {
        let mut attempt: u32 = 1;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    if !e.is_transient() || attempt >= self.max_attempts {
                        return Err(e);
                    }

                    // Exponential backoff with jitter between base and cap
                    let cap = self.delay_cap(attempt);
                    let delay = if cap > self.base_delay {
                        rand::thread_rng().gen_range(self.base_delay..=cap)
                    } else {
                        self.base_delay
                    };

                    warn!(
                        target: "stripe",
                        desc = %desc,
                        attempt = attempt,
                        max_attempts = self.max_attempts,
                        error = %e,
                        next_delay_ms = delay.as_millis() as u64,
                        "retrying transient processor error"
                    );

                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result = fast()
            .run("op", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ProcessorError::Http("reset".into()))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast()
            .run("op", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProcessorError::Http("down".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_definitive_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast()
            .run("op", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProcessorError::Precondition("bad"))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_delay_cap_grows_and_saturates() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(2000),
        };
        assert_eq!(policy.delay_cap(1), Duration::from_millis(100));
        assert_eq!(policy.delay_cap(2), Duration::from_millis(200));
        assert_eq!(policy.delay_cap(3), Duration::from_millis(400));
        assert_eq!(policy.delay_cap(9), Duration::from_millis(2000));
        assert_eq!(policy.capped(1).max_attempts, 1);
        assert_eq!(RetryPolicy::none().max_attempts, 1);
    }
}
