//! Connection retry with exponential backoff.
//!
//! Only initial connection setup is retried. Individual filesystem
//! operations never are.

use sftpfs_platform::{FsError, FsResult};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Retry configuration for the connection driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt. Zero means a single attempt.
    pub max_retries: u32,
    /// Delay before the first retry; doubles for each one after.
    pub initial_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of retries.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the delay before the first retry.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Total attempts this policy allows.
    pub fn attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Exponential backoff calculator: `d0`, `2·d0`, `4·d0`, ...
#[derive(Debug)]
pub struct ExponentialBackoff {
    initial: Duration,
    attempt: u32,
}

impl ExponentialBackoff {
    /// Starts a schedule at `initial`.
    pub fn new(initial: Duration) -> Self {
        Self {
            initial,
            attempt: 0,
        }
    }

    /// Delay after failed attempt `k` (zero based): `initial · 2^k`.
    pub fn delay_for(&self, k: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(k);
        self.initial.saturating_mul(multiplier)
    }

    /// Returns the next delay and advances the schedule.
    pub fn next_backoff(&mut self) -> Duration {
        let delay = self.delay_for(self.attempt);
        self.attempt += 1;
        delay
    }

    /// Delays handed out so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Restarts the schedule.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Runs `attempt_fn` until it succeeds or the policy is exhausted.
///
/// `attempt_fn` receives the zero-based attempt number and must release
/// anything it acquired before returning an error. Between attempts the
/// driver sleeps on the backoff schedule; there is no sleep after the last
/// attempt. On exhaustion the last error is returned inside
/// [`FsError::Connect`] with the number of attempts made.
pub async fn connect_with_retry<T, F, Fut>(policy: &RetryPolicy, mut attempt_fn: F) -> FsResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = FsResult<T>>,
{
    let attempts = policy.attempts();
    let mut backoff = ExponentialBackoff::new(policy.initial_delay);

    let mut attempt = 0;
    loop {
        debug!(attempt = attempt + 1, attempts, "connection attempt");
        let err = match attempt_fn(attempt).await {
            Ok(value) => {
                if attempt > 0 {
                    info!("connected on attempt {}", attempt + 1);
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        attempt += 1;
        if attempt >= attempts {
            warn!("connection failed after {} attempts: {}", attempts, err);
            return Err(FsError::Connect {
                attempts,
                source: Box::new(err),
            });
        }

        let delay = backoff.next_backoff();
        warn!(
            "connection attempt {}/{} failed: {} (retrying in {:?})",
            attempt, attempts, err, delay
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sftpfs_platform::ErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.initial_delay, Duration::from_secs(1));
        assert_eq!(policy.attempts(), 4);
    }

    #[test]
    fn test_retry_policy_builder() {
        let policy = RetryPolicy::new()
            .with_max_retries(5)
            .with_initial_delay(Duration::from_millis(250));
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.initial_delay, Duration::from_millis(250));
    }

    #[test]
    fn test_exponential_backoff() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(1));

        assert_eq!(backoff.next_backoff(), Duration::from_secs(1));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(2));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(4));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(8));
        assert_eq!(backoff.attempt(), 4);

        backoff.reset();
        assert_eq!(backoff.next_backoff(), Duration::from_secs(1));
        assert_eq!(backoff.delay_for(40), Duration::from_secs(u64::from(u32::MAX)));
    }

    #[tokio::test]
    async fn test_succeeds_after_failures() {
        let policy = RetryPolicy::new()
            .with_max_retries(3)
            .with_initial_delay(Duration::from_millis(5));
        let calls = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&calls);
        let value = connect_with_retry(&policy, |attempt| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if attempt < 2 {
                    Err(FsError::new(ErrorKind::TransportClosed, "refused"))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_attempts() {
        let policy = RetryPolicy::new()
            .with_max_retries(2)
            .with_initial_delay(Duration::from_millis(10));
        let calls = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&calls);
        let started = Instant::now();
        let err = connect_with_retry(&policy, |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(FsError::new(ErrorKind::AuthenticationFailed, "denied"))
            }
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 10ms + 20ms between the three attempts, none after the last.
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert_eq!(err.kind(), ErrorKind::AuthenticationFailed);
        match err {
            FsError::Connect { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_zero_retries_is_single_attempt() {
        let policy = RetryPolicy::new().with_max_retries(0);
        let calls = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&calls);
        let started = Instant::now();
        let result = connect_with_retry(&policy, |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(FsError::new(ErrorKind::TimedOut, "timeout"))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
