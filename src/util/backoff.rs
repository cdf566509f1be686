use std::cmp::min;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::select;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::util::random::Random;


/// Decides whether a failed relay call is worth retrying. Returning `false` makes the failure
///  fatal for the caller.
pub type RecoverablePredicate = Arc<dyn Fn(&anyhow::Error) -> bool + Send + Sync>;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// `None` retries recoverable failures until cancelled
    pub max_retries: Option<u32>,
}

/// Exponentially growing delays with 'equal jitter': half of each delay is fixed, the other half
///  is random. Growth is expressed in eighths to allow factors like 1.5.
pub struct ExponentialBackoff {
    attempt: u32,
    config_base_delay: Duration,
    config_max_delay: Duration,
    config_factor_eighths: u32,
}

impl ExponentialBackoff {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        let result = ExponentialBackoff {
            attempt: 0,
            config_base_delay: base_delay,
            config_max_delay: max_delay,
            config_factor_eighths: 8*2,
        };

        assert!(result.config_factor_eighths > 8);

        result
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    fn ceiling(&self) -> Duration {
        let mut delay = self.config_base_delay;
        for _ in 0..self.attempt {
            if delay >= self.config_max_delay {
                break;
            }
            delay = delay * self.config_factor_eighths / 8;
        }
        min(delay, self.config_max_delay)
    }

    #[must_use]
    pub fn next_delay(&mut self, random: &dyn Random) -> Duration {
        let half = self.ceiling() / 2;
        self.attempt = self.attempt.saturating_add(1);
        half + half.mul_f64(random.gen_f64_range(0.0..1.0))
    }
}


/// Runs `op` until it succeeds, fails with an error that `is_recoverable` rejects, or exceeds
///  the policy's retry budget. Returns `Ok(None)` if `cancel` fires first, both during a call and
///  during a backoff delay.
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    is_recoverable: &(dyn Fn(&anyhow::Error) -> bool + Send + Sync),
    random: &dyn Random,
    mut op: F,
) -> anyhow::Result<Option<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut backoff = ExponentialBackoff::new(policy.base_delay, policy.max_delay);
    loop {
        let result = select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            r = op() => r,
        };

        let e = match result {
            Ok(value) => return Ok(Some(value)),
            Err(e) => e,
        };

        if !is_recoverable(&e) {
            return Err(e);
        }
        if let Some(max_retries) = policy.max_retries {
            if backoff.attempt() >= max_retries {
                return Err(e.context(format!("giving up after {} retries", max_retries)));
            }
        }

        let delay = backoff.next_delay(random);
        debug!(attempt = backoff.attempt(), ?delay, "recoverable error, retrying: {:#}", e);

        select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            _ = sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use anyhow::anyhow;
    use rstest::rstest;
    use tokio::time::Instant;
    use crate::util::random::MockRandom;
    use super::*;

    fn random_returning(value: f64) -> MockRandom {
        let mut random = MockRandom::new();
        random.expect_gen_f64_range()
            .return_const(value);
        random
    }

    fn policy(max_retries: Option<u32>) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
            max_retries,
        }
    }

    #[rstest]
    #[case::first_min_jitter(0, 0.0, 25)]
    #[case::first_max_jitter(0, 1.0, 50)]
    #[case::second(1, 0.0, 50)]
    #[case::third(2, 0.5, 150)]
    #[case::fifth(4, 1.0, 800)]
    #[case::capped(5, 1.0, 1000)]
    #[case::capped_min_jitter(5, 0.0, 500)]
    #[case::far_beyond_cap(1000, 1.0, 1000)]
    fn test_next_delay(#[case] attempt: u32, #[case] jitter: f64, #[case] expected_millis: u64) {
        let mut backoff = ExponentialBackoff::new(Duration::from_millis(50), Duration::from_secs(1));
        backoff.attempt = attempt;

        assert_eq!(backoff.next_delay(&random_returning(jitter)), Duration::from_millis(expected_millis));
        assert_eq!(backoff.attempt(), attempt + 1);
    }

    #[test]
    fn test_reset() {
        let mut backoff = ExponentialBackoff::new(Duration::from_millis(50), Duration::from_secs(1));
        let random = random_returning(1.0);
        for _ in 0..5 {
            let _ = backoff.next_delay(&random);
        }
        backoff.reset();
        assert_eq!(backoff.next_delay(&random), Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers() {
        let calls = &AtomicU32::new(0);
        let start = Instant::now();

        let result = retry(&policy(None), &CancellationToken::new(), &|_| true, &random_returning(0.0), || async move {
            match calls.fetch_add(1, Ordering::SeqCst) {
                0 | 1 => Err(anyhow!("temporarily unavailable")),
                n => Ok(n),
            }
        }).await;

        assert_eq!(result.unwrap(), Some(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(75), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(80), "{:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_fatal() {
        let calls = &AtomicU32::new(0);

        let result: anyhow::Result<Option<()>> = retry(&policy(None), &CancellationToken::new(), &|_| false, &random_returning(0.0), || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(anyhow!("permission denied"))
        }).await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_exhausted() {
        let calls = &AtomicU32::new(0);

        let result: anyhow::Result<Option<()>> = retry(&policy(Some(2)), &CancellationToken::new(), &|_| true, &random_returning(0.0), || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(anyhow!("temporarily unavailable"))
        }).await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_cancelled_before_start() {
        let calls = &AtomicU32::new(0);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = retry(&policy(None), &cancel, &|_| true, &random_returning(0.0), || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }).await;

        assert_eq!(result.unwrap(), None);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_cancelled_during_backoff() {
        let cancel = CancellationToken::new();
        let cancel_later = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(300)).await;
            cancel_later.cancel();
        });

        let result: anyhow::Result<Option<()>> = retry(&policy(None), &cancel, &|_| true, &random_returning(1.0), || async {
            Err(anyhow!("temporarily unavailable"))
        }).await;

        assert_eq!(result.unwrap(), None);
    }
}
