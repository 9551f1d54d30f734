//! A bounded poll-until-done loop with progressive backoff.
//!
//! Used for media polling, conversation-page scraping and upload retries.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

use crate::error::MetaAiError;

/// Delay schedule between attempts: `base` for the first `fast_attempts` retries, then
/// doubling on each retry, never above `ceiling`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub fast_attempts: u32,
    pub ceiling: Duration,
}

impl Backoff {
    /// The same delay before every retry.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base: delay,
            fast_attempts: u32::MAX,
            ceiling: delay,
        }
    }

    /// `base`, `2 * base`, `4 * base`, ... capped at `ceiling`.
    pub fn exponential(base: Duration, ceiling: Duration) -> Self {
        Self {
            base,
            fast_attempts: 1,
            ceiling,
        }
    }

    /// Delay before retry number `retry` (1 is the wait before the second attempt).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = self.base.min(self.ceiling);
        if retry <= self.fast_attempts {
            return base;
        }
        let exponent = (retry - self.fast_attempts).min(16);
        base.checked_mul(1 << exponent)
            .unwrap_or(self.ceiling)
            .min(self.ceiling)
    }
}

/// Bounds for one polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub max_attempts: u32,
    /// Wait before the first attempt.
    pub initial_delay: Duration,
    pub backoff: Backoff,
}

/// What a single attempt produced.
#[derive(Debug)]
pub enum AttemptOutcome<T> {
    /// The attempt went through; the data may or may not complete the loop.
    Ready(T),
    /// The attempt failed in a way worth retrying; counts as "not ready yet".
    Failed(String),
    /// Stop polling immediately.
    Fatal(MetaAiError),
}

/// Summary of a finished loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PollReport {
    pub attempts: u32,
    pub completed: bool,
    /// Attempts that ended in [`AttemptOutcome::Failed`].
    pub failures: u32,
}

/// Runs `attempt` until `absorb` reports completion or `policy.max_attempts` is reached.
///
/// `attempt` sees the current state and the 1-based attempt number and returns a future
/// that must not borrow the state; `absorb` folds each successful result into the state
/// and returns `true` once nothing is left to do. Only [`AttemptOutcome::Fatal`] turns
/// into an error; running out of attempts is reported through [`PollReport::completed`].
pub async fn poll_until<S, T, F, Fut, A>(
    policy: &PollPolicy,
    label: &str,
    state: &mut S,
    mut attempt: F,
    mut absorb: A,
) -> Result<PollReport, MetaAiError>
where
    F: FnMut(&S, u32) -> Fut,
    Fut: Future<Output = AttemptOutcome<T>>,
    A: FnMut(&mut S, T) -> bool,
{
    let mut report = PollReport::default();
    if policy.max_attempts == 0 {
        return Ok(report);
    }
    if !policy.initial_delay.is_zero() {
        sleep(policy.initial_delay).await;
    }

    for number in 1..=policy.max_attempts {
        if number > 1 {
            sleep(policy.backoff.delay_for(number - 1)).await;
        }
        report.attempts = number;

        match attempt(&*state, number).await {
            AttemptOutcome::Ready(value) => {
                if absorb(state, value) {
                    report.completed = true;
                    debug!(label, attempts = number, "polling complete");
                    return Ok(report);
                }
                debug!(label, attempt = number, max = policy.max_attempts, "not ready yet");
            }
            AttemptOutcome::Failed(reason) => {
                report.failures += 1;
                debug!(label, attempt = number, %reason, "attempt failed");
            }
            AttemptOutcome::Fatal(err) => return Err(err),
        }
    }

    debug!(label, attempts = report.attempts, failures = report.failures, "polling exhausted");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick(max_attempts: u32) -> PollPolicy {
        PollPolicy {
            max_attempts,
            initial_delay: Duration::ZERO,
            backoff: Backoff::fixed(Duration::from_millis(1)),
        }
    }

    #[test]
    fn backoff_is_monotonic_and_bounded() {
        let backoffs = [
            Backoff {
                base: Duration::from_millis(500),
                fast_attempts: 3,
                ceiling: Duration::from_secs(8),
            },
            Backoff::exponential(Duration::from_secs(1), Duration::from_secs(4)),
            Backoff::fixed(Duration::from_secs(5)),
            Backoff {
                base: Duration::from_secs(10),
                fast_attempts: 0,
                ceiling: Duration::from_secs(3),
            },
        ];
        for backoff in backoffs {
            let mut previous = Duration::ZERO;
            for retry in 1..200 {
                let delay = backoff.delay_for(retry);
                assert!(delay >= previous, "{backoff:?} decreased at retry {retry}");
                assert!(delay <= backoff.ceiling);
                previous = delay;
            }
        }
    }

    #[test]
    fn exponential_backoff_doubles() {
        let backoff = Backoff::exponential(Duration::from_secs(1), Duration::from_secs(60));
        let delays: Vec<_> = (1..=4).map(|r| backoff.delay_for(r).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8]);
    }

    #[tokio::test]
    async fn stops_as_soon_as_absorb_completes() {
        let mut seen = Vec::new();
        let report = poll_until(
            &quick(10),
            "test",
            &mut seen,
            |_, number| async move { AttemptOutcome::Ready(number) },
            |seen: &mut Vec<u32>, number| {
                seen.push(number);
                number == 3
            },
        )
        .await
        .unwrap();

        assert!(report.completed);
        assert_eq!(report.attempts, 3);
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn failures_count_as_not_ready_and_max_attempts_is_respected() {
        let mut state = 0u32;
        let report = poll_until(
            &quick(4),
            "test",
            &mut state,
            |_, _| async { AttemptOutcome::<()>::Failed("boom".into()) },
            |_, _| true,
        )
        .await
        .unwrap();

        assert!(!report.completed);
        assert_eq!(report.attempts, 4);
        assert_eq!(report.failures, 4);
    }

    #[tokio::test]
    async fn fatal_outcome_aborts() {
        let mut state = ();
        let result = poll_until(
            &quick(5),
            "test",
            &mut state,
            |_, _| async {
                AttemptOutcome::<()>::Fatal(MetaAiError::AuthRefreshFailed {
                    reason: "nope".into(),
                })
            },
            |_, _| false,
        )
        .await;

        assert!(matches!(result, Err(MetaAiError::AuthRefreshFailed { .. })));
    }

    #[tokio::test]
    async fn zero_attempts_does_nothing() {
        let mut calls = 0u32;
        let report = poll_until(
            &quick(0),
            "test",
            &mut calls,
            |_, _| async { AttemptOutcome::Ready(()) },
            |calls: &mut u32, _| {
                *calls += 1;
                true
            },
        )
        .await
        .unwrap();
        assert_eq!(report.attempts, 0);
        assert_eq!(calls, 0);
    }
}
