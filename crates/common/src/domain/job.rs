use crate::domain::result::{DomainError, DomainResult};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Done,
}

/// Bounded exponential backoff used while waiting on a background job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub timeout: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(2),
            timeout: Duration::from_secs(300),
        }
    }
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait JobStatusSource: Send + Sync {
    async fn poll_status(&self, job_id: &str) -> DomainResult<JobState>;
}

/// Poll `job_id` until it reports `Done`, doubling the interval up to
/// `max_interval`. Fails with `Timeout` once `policy.timeout` has elapsed.
pub async fn wait_for_job(
    source: &dyn JobStatusSource,
    job_id: &str,
    policy: PollPolicy,
) -> DomainResult<()> {
    let started = Instant::now();
    let mut interval = policy.initial_interval;
    let mut polls = 0u32;

    loop {
        let state = source.poll_status(job_id).await?;
        polls += 1;
        debug!(job_id = %job_id, state = ?state, polls, "Polled job status");

        if state == JobState::Done {
            return Ok(());
        }

        let elapsed = started.elapsed();
        if elapsed >= policy.timeout {
            return Err(DomainError::Timeout(format!(
                "job {} not done after {:?} ({} polls)",
                job_id, elapsed, polls
            )));
        }

        let remaining = policy.timeout - elapsed;
        tokio::time::sleep(interval.min(remaining)).await;
        interval = (interval * 2).min(policy.max_interval);
    }
}
