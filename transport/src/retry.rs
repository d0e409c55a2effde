use std::future::Future;
use std::time::Duration;
use anyhow::bail;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Bounded retries with a fixed pause between attempts. The same policy is used for delivering
///  the session ack and the per-train verdicts, so both paths give up after the same number of
///  attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// pause between two attempts - there is no pause after the last one
    pub backoff: Duration,
}

#[derive(Debug)]
pub enum RetryOutcome<T> {
    Succeeded { value: T, attempts: u32 },
    Exhausted { attempts: u32, last_error: anyhow::Error },
}

impl <T> RetryOutcome<T> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryOutcome::Succeeded { attempts, .. } => *attempts,
            RetryOutcome::Exhausted { attempts, .. } => *attempts,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RetryOutcome::Succeeded { .. })
    }
}

impl RetryPolicy {
    pub fn default_feedback() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            backoff: Duration::from_secs(1),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_attempts == 0 {
            bail!("retry policy needs at least one attempt");
        }
        Ok(())
    }

    /// Calls `op` with the 1-based attempt number until it succeeds or `max_attempts` is
    ///  reached. Errors are logged and swallowed, the last one is returned as part of
    ///  [`RetryOutcome::Exhausted`].
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => {
                    debug!("{}: succeeded after {} attempt(s)", what, attempt);
                    return RetryOutcome::Succeeded { value, attempts: attempt };
                }
                Err(e) => {
                    warn!("{}: attempt {} of {} failed: {}", what, attempt, self.max_attempts, e);
                    if attempt >= self.max_attempts {
                        return RetryOutcome::Exhausted { attempts: attempt, last_error: e };
                    }
                }
            }

            sleep(self.backoff).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use rstest::rstest;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_exhausts_attempts() {
        let policy = RetryPolicy { max_attempts: 3, backoff: Duration::from_secs(1) };
        let calls = AtomicU32::new(0);
        let call_times = std::sync::Mutex::new(Vec::new());

        let start = Instant::now();
        let outcome: RetryOutcome<()> = policy.run("test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            call_times.lock().unwrap().push(Instant::now() - start);
            async { Err(anyhow!("connection refused")) }
        }).await;

        assert!(!outcome.is_success());
        assert_eq!(outcome.attempts(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(*call_times.lock().unwrap(), vec![Duration::ZERO, Duration::from_secs(1), Duration::from_secs(2)]);
        assert_eq!(Instant::now() - start, Duration::from_secs(2));
    }

    #[rstest]
    #[case::first(3, 1, true, 1)]
    #[case::second(3, 2, true, 2)]
    #[case::last(3, 3, true, 3)]
    #[case::too_late(3, 4, false, 3)]
    #[case::single_attempt(1, 2, false, 1)]
    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_attempt(
        #[case] max_attempts: u32,
        #[case] succeed_on: u32,
        #[case] expected_success: bool,
        #[case] expected_attempts: u32,
    ) {
        let policy = RetryPolicy { max_attempts, backoff: Duration::from_millis(100) };

        let outcome = policy.run("test", |attempt| async move {
            if attempt == succeed_on {
                Ok(attempt)
            }
            else {
                Err(anyhow!("attempt {} fails", attempt))
            }
        }).await;

        assert_eq!(outcome.is_success(), expected_success);
        assert_eq!(outcome.attempts(), expected_attempts);
        if let RetryOutcome::Succeeded { value, .. } = outcome {
            assert_eq!(value, succeed_on);
        }
    }

    #[test]
    fn test_validate() {
        assert!(RetryPolicy { max_attempts: 0, backoff: Duration::ZERO }.validate().is_err());
        assert!(RetryPolicy::default_feedback().validate().is_ok());
    }
}
