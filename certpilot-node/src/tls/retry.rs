//! Backoff, in-call retries and cancellable waits

use super::acme::AcmeError;
use crate::defaults::{POLL_INITIAL_DELAY, POLL_MAX_DELAY, TRANSIENT_RETRY_DELAY};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Jittered exponential backoff. Each delay is the current step scaled by a
/// random factor in `[0.5, 1.0]`; the step doubles up to `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    step: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            step: initial.min(max),
            max,
        }
    }

    /// Delays between authorization/order polls.
    pub fn polling() -> Self {
        Self::new(POLL_INITIAL_DELAY, POLL_MAX_DELAY)
    }

    /// Delays between in-call retries of a transient failure.
    pub fn transient() -> Self {
        Self::new(TRANSIENT_RETRY_DELAY, POLL_MAX_DELAY)
    }

    pub fn next_delay(&mut self) -> Duration {
        let step = self.step;
        self.step = self.step.saturating_mul(2).min(self.max);
        step.mul_f64(rand::thread_rng().gen_range(0.5..=1.0))
    }
}

/// `min(initial * 2^(failures - 1), max)`; zero failures means no delay.
pub fn failure_delay(initial: Duration, max: Duration, consecutive_failures: u32) -> Duration {
    if consecutive_failures == 0 {
        return Duration::ZERO;
    }
    let factor = 2u32.saturating_pow(consecutive_failures.saturating_sub(1).min(31));
    initial.saturating_mul(factor).min(max)
}

/// Run `fut` unless `cancel` fires first.
pub async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, AcmeError>
where
    F: Future<Output = Result<T, AcmeError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AcmeError::Cancelled),
        result = fut => result,
    }
}

pub async fn sleep(cancel: &CancellationToken, duration: Duration) -> Result<(), AcmeError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AcmeError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Evaluate an authority call, retrying transient failures in place a bounded
/// number of times. The call expression is re-evaluated for every attempt so it
/// may borrow the order handle mutably.
macro_rules! retry_transient {
    ($cancel:expr, $what:expr, $call:expr) => {{
        let mut backoff = $crate::tls::retry::Backoff::transient();
        let mut attempt = 1u32;
        loop {
            match $crate::tls::retry::cancellable($cancel, $call).await {
                Err(e)
                    if e.is_transient()
                        && attempt < $crate::defaults::TRANSIENT_RETRY_ATTEMPTS =>
                {
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        call = $what,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient ACME failure, retrying"
                    );
                    $crate::tls::retry::sleep($cancel, delay).await?;
                    attempt += 1;
                }
                result => break result,
            }
        }
    }};
}

pub(crate) use retry_transient;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_doubles_up_to_max_with_jitter() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(350));
        let expected_steps = [100, 200, 350, 350];
        for step in expected_steps {
            let delay = backoff.next_delay().as_millis() as u64;
            assert!(
                delay >= step / 2 && delay <= step,
                "delay {delay}ms outside [{}, {step}]",
                step / 2
            );
        }
    }

    #[test]
    fn test_failure_delay_is_capped_exponential() {
        let initial = Duration::from_secs(60);
        let max = Duration::from_secs(600);
        assert_eq!(failure_delay(initial, max, 0), Duration::ZERO);
        assert_eq!(failure_delay(initial, max, 1), Duration::from_secs(60));
        assert_eq!(failure_delay(initial, max, 2), Duration::from_secs(120));
        assert_eq!(failure_delay(initial, max, 3), Duration::from_secs(240));
        assert_eq!(failure_delay(initial, max, 5), max);
        assert_eq!(failure_delay(initial, max, u32::MAX), max);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_returns_promptly_on_cancel() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let started = tokio::time::Instant::now();
        let result = sleep(&cancel, Duration::from_secs(3600)).await;
        assert!(matches!(result, Err(AcmeError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_cancellable_prefers_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = cancellable(&cancel, async { Ok::<_, AcmeError>(1) }).await;
        assert!(matches!(result, Err(AcmeError::Cancelled)));
    }

    async fn flaky(calls: &AtomicU32, fail_times: u32) -> Result<u32, AcmeError> {
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= fail_times {
            Err(AcmeError::Transient("connection reset".into()))
        } else {
            Ok(n)
        }
    }

    async fn run_flaky(
        cancel: &CancellationToken,
        calls: &AtomicU32,
        fail_times: u32,
    ) -> Result<u32, AcmeError> {
        retry_transient!(cancel, "flaky", flaky(calls, fail_times))
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_transient_recovers() {
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let result = run_flaky(&cancel, &calls, 2).await.unwrap();
        assert_eq!(result, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_transient_gives_up() {
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let result = run_flaky(&cancel, &calls, 10).await;
        assert!(matches!(result, Err(AcmeError::Transient(_))));
        assert_eq!(
            calls.load(Ordering::SeqCst),
            crate::defaults::TRANSIENT_RETRY_ATTEMPTS
        );
    }

    #[tokio::test]
    async fn test_retry_transient_does_not_retry_rejections() -> Result<(), AcmeError> {
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let result: Result<(), AcmeError> = retry_transient!(&cancel, "reject", async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(AcmeError::Rejected {
                problem: "malformed".into(),
                detail: "bad".into(),
            })
        });
        assert!(matches!(result, Err(AcmeError::Rejected { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        Ok(())
    }
}
