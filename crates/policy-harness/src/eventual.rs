//! Bounded polling for cluster state that converges asynchronously.
//!
//! Workload readiness, policy programming and pod termination all complete
//! some time after the kubectl call that triggered them returns. Every such
//! wait goes through [`retry_until`], which polls at a fixed interval and
//! never blocks past its timeout.

use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::trace;

/// Categories of asynchronous convergence the harness waits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitKind {
    /// Pods selected by a workload reach Running + Ready.
    WorkloadReady,

    /// The enforcement layer reports a policy as programmed (or gone).
    PolicyConvergence,

    /// No pods owned by the scenario remain.
    Termination,
}

impl WaitKind {
    pub fn as_str(self) -> &'static str {
        match self {
            WaitKind::WorkloadReady => "workload readiness",
            WaitKind::PolicyConvergence => "policy convergence",
            WaitKind::Termination => "termination",
        }
    }
}

/// Fixed-interval retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

/// A wait that ran out of budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitTimeout {
    pub kind: WaitKind,
    pub waited: Duration,
    pub attempts: u32,
    /// What the final unsuccessful poll observed.
    pub last_observation: String,
}

/// Poll `condition` every `policy.interval` until it yields `Ok`, or fail once
/// `policy.timeout` has elapsed.
///
/// The condition returns `Err(observation)` while the awaited state has not
/// been reached; the observation of the last attempt is carried in the
/// timeout so callers can report what the cluster looked like when the
/// budget ran out. Transient control-plane failures should be folded into
/// the observation rather than aborting the wait.
///
/// The condition is always evaluated at least once, and a final attempt is
/// made right at the deadline.
pub async fn retry_until<T, F, Fut>(
    kind: WaitKind,
    policy: RetryPolicy,
    mut condition: F,
) -> Result<T, WaitTimeout>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, String>>,
{
    let start = Instant::now();
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let observation = match condition().await {
            Ok(value) => return Ok(value),
            Err(observation) => observation,
        };

        let elapsed = start.elapsed();
        if elapsed >= policy.timeout {
            return Err(WaitTimeout {
                kind,
                waited: elapsed,
                attempts,
                last_observation: observation,
            });
        }

        trace!(
            target: "harness.eventual",
            wait = kind.as_str(),
            attempts,
            observation = %observation,
            "Condition not met yet"
        );

        // Cap the sleep at the remaining budget
        let remaining = policy.timeout.saturating_sub(elapsed);
        sleep(policy.interval.min(remaining)).await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(Duration::from_secs(2), Duration::from_secs(10))
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_succeeds_immediately() {
        let result = retry_until(WaitKind::WorkloadReady, policy(), || async {
            Ok::<_, String>(7)
        })
        .await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_succeeds_after_retry() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let result = retry_until(WaitKind::PolicyConvergence, policy(), move || {
            let attempts = attempts_clone.clone();
            async move {
                let count = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                if count >= 3 {
                    Ok(count)
                } else {
                    Err(format!("pending after {count} polls"))
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_polls_at_fixed_interval() {
        let start = Instant::now();
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let _ = retry_until(WaitKind::WorkloadReady, policy(), move || {
            let attempts = attempts_clone.clone();
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) + 1 == 4 {
                    Ok(())
                } else {
                    Err("not yet".to_string())
                }
            }
        })
        .await;

        // Three sleeps of 2s before the fourth attempt
        assert_eq!(start.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_times_out_with_last_observation() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let err = retry_until(WaitKind::Termination, policy(), move || {
            let attempts = attempts_clone.clone();
            async move {
                let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                Err::<(), _>(format!("{n} pods remaining"))
            }
        })
        .await
        .expect_err("Should time out");

        assert_eq!(err.kind, WaitKind::Termination);
        assert_eq!(err.waited, Duration::from_secs(10));
        // Attempts at t=0,2,4,6,8,10
        assert_eq!(err.attempts, 6);
        assert_eq!(err.last_observation, "6 pods remaining");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_caps_sleep_at_deadline() {
        let policy = RetryPolicy::new(Duration::from_secs(4), Duration::from_secs(5));
        let start = Instant::now();

        let err = retry_until(WaitKind::WorkloadReady, policy, || async {
            Err::<(), _>("never".to_string())
        })
        .await
        .expect_err("Should time out");

        assert_eq!(start.elapsed(), Duration::from_secs(5));
        assert_eq!(err.attempts, 3);
    }
}
