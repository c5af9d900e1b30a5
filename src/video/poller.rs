use log::debug;
use std::time::Duration;
use tokio::time::{ sleep, sleep_until, Instant };
use tokio_util::sync::CancellationToken;

use super::job::VideoError;
use crate::llm::video::{ Operation, OperationHandle, VideoGenerator };

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    /// `None` polls until the operation settles.
    pub timeout: Option<Duration>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            timeout: Some(DEFAULT_POLL_TIMEOUT),
        }
    }
}

impl PollPolicy {
    /// A timeout of zero seconds means no timeout.
    pub fn from_secs(interval_secs: u64, timeout_secs: u64) -> Self {
        Self {
            interval: Duration::from_secs(interval_secs.max(1)),
            timeout: (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs)),
        }
    }

    pub fn deadline_from(&self, started: Instant) -> Option<Instant> {
        self.timeout.map(|limit| started + limit)
    }

    fn timed_out(&self) -> VideoError {
        VideoError::TimedOut(self.timeout.map_or(0, |limit| limit.as_secs()))
    }
}

/// Resolves at `deadline`, or never when there is none.
pub async fn wait_for_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// The operation reports done; its content is not inspected here.
    Settled(Operation),
    Failed(VideoError),
    Cancelled,
}

/// Waits one interval, fetches the operation, repeats until it reports done.
/// `on_tick` sees every pending snapshot and stops the loop by returning
/// `false`. The timeout also bounds a fetch that never answers.
pub async fn poll_until_settled<F>(
    generator: &dyn VideoGenerator,
    handle: &OperationHandle,
    policy: &PollPolicy,
    cancel: &CancellationToken,
    mut on_tick: F
) -> PollOutcome
    where F: FnMut(&Operation) -> bool
{
    let deadline = policy.deadline_from(Instant::now());
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return PollOutcome::Cancelled,
            _ = wait_for_deadline(deadline) => return PollOutcome::Failed(policy.timed_out()),
            _ = sleep(policy.interval) => {}
        }

        let polled = tokio::select! {
            _ = cancel.cancelled() => return PollOutcome::Cancelled,
            _ = wait_for_deadline(deadline) => return PollOutcome::Failed(policy.timed_out()),
            polled = generator.poll(handle) => polled,
        };

        match polled {
            Ok(operation) if operation.done => {
                return PollOutcome::Settled(operation);
            }
            Ok(operation) => {
                debug!("Operation {} still running", handle.name());
                if !on_tick(&operation) {
                    return PollOutcome::Cancelled;
                }
            }
            Err(e) => {
                return PollOutcome::Failed(VideoError::Transport(e.to_string()));
            }
        }
    }
}
