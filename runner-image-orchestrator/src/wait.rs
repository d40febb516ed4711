//! Bounded polling for cloud state transitions.
//!
//! Every wait has a timeout and an interval and distinguishes "ran out of time"
//! from "observed a failure state". Time comes from `tokio::time`, so tests can
//! run these loops on a paused clock.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub timeout: Duration,
    pub interval: Duration,
}

impl PollPolicy {
    pub const fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }

    pub const fn secs(timeout: u64, interval: u64) -> Self {
        Self::new(Duration::from_secs(timeout), Duration::from_secs(interval))
    }
}

/// Result of one look at the resource being waited on.
#[derive(Debug)]
pub enum Probe<T> {
    Ready(T),
    Pending,
    /// Terminal failure state observed (e.g. server ERROR, image killed).
    Failed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum WaitError<E> {
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    #[error("{0}")]
    Failed(String),
    #[error("cancelled")]
    Cancelled,
    #[error(transparent)]
    Probe(E),
}

/// Call `probe` until it reports ready or failed, the policy's timeout elapses,
/// or `cancel` fires. The probe always runs at least once.
pub async fn poll_until<T, E, F, Fut>(
    what: &str,
    policy: PollPolicy,
    cancel: &CancellationToken,
    mut probe: F,
) -> Result<T, WaitError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Probe<T>, E>>,
{
    let started = Instant::now();
    let deadline = started + policy.timeout;
    let mut attempts: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(WaitError::Cancelled);
        }
        attempts += 1;
        match probe().await.map_err(WaitError::Probe)? {
            Probe::Ready(v) => {
                tracing::debug!(
                    "[wait] {} ready after {:?} ({} attempts)",
                    what,
                    started.elapsed(),
                    attempts
                );
                return Ok(v);
            }
            Probe::Failed(reason) => return Err(WaitError::Failed(reason)),
            Probe::Pending => {}
        }

        let now = Instant::now();
        if now >= deadline {
            tracing::warn!(
                "[wait] {} not ready after {:?} ({} attempts)",
                what,
                policy.timeout,
                attempts
            );
            return Err(WaitError::TimedOut(policy.timeout));
        }
        let nap = policy.interval.min(deadline - now);
        tokio::select! {
            _ = cancel.cancelled() => return Err(WaitError::Cancelled),
            _ = tokio::time::sleep(nap) => {}
        }
    }
}
