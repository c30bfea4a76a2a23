//! Integration Job Queue state machine
//!
//! Pure transition logic for deferred work against external systems. Storage
//! adapters persist the jobs this engine produces; the backoff schedule lives
//! here and nowhere else.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::integration::{IntegrationJob, IntegrationJobId, JobStatus, NewIntegrationJob};

pub const BACKOFF_BASE_MINUTES: i64 = 1;
pub const BACKOFF_CAP_MINUTES: i64 = 480;

/// Delay before the next attempt after the `retry_count`-th consecutive failure:
/// `min(2^(retry_count - 1), 480)` minutes.
pub fn retry_backoff(retry_count: u32) -> Duration {
    let exponent = retry_count.saturating_sub(1);
    let minutes = if exponent >= 32 {
        BACKOFF_CAP_MINUTES
    } else {
        BACKOFF_BASE_MINUTES.saturating_mul(1_i64 << exponent).min(BACKOFF_CAP_MINUTES)
    };
    Duration::minutes(minutes)
}

#[derive(Clone, Debug)]
pub struct QueueEngineConfig {
    /// How long a claim may be held before the job is treated as timed out
    pub claim_timeout_seconds: i64,
}

impl Default for QueueEngineConfig {
    fn default() -> Self {
        Self { claim_timeout_seconds: 600 }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("invalid job transition for `{id}` from {from:?} to {to:?}")]
    InvalidTransition { id: IntegrationJobId, from: JobStatus, to: JobStatus },
    #[error("job `{0}` is not yet eligible")]
    NotYetEligible(IntegrationJobId),
}

/// How a processing attempt ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    Completed { result: Option<Value> },
    /// `retry = true` schedules another attempt with backoff; `false` is terminal.
    Failed { error: String, retry: bool },
}

impl JobOutcome {
    pub fn target_status(&self) -> JobStatus {
        match self {
            Self::Completed { .. } => JobStatus::Completed,
            Self::Failed { retry: true, .. } => JobStatus::Retry,
            Self::Failed { retry: false, .. } => JobStatus::Failed,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct IntegrationQueueEngine {
    config: QueueEngineConfig,
}

impl IntegrationQueueEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: QueueEngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &QueueEngineConfig {
        &self.config
    }

    /// Builds a `pending` job. Without a scheduled time it is eligible immediately.
    pub fn create_job(&self, new_job: NewIntegrationJob, now: DateTime<Utc>) -> IntegrationJob {
        IntegrationJob {
            id: IntegrationJobId(format!("JOB-{}", Uuid::new_v4().simple())),
            company_id: new_job.company_id,
            project_id: new_job.project_id,
            action_record_id: new_job.action_record_id,
            operation_type: new_job.operation_type,
            resource_type: new_job.resource_type,
            payload: new_job.payload,
            status: JobStatus::Pending,
            retry_count: 0,
            next_retry_at: new_job.scheduled_time,
            claimed_by: None,
            claimed_at: None,
            processed_at: None,
            result: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn claim(
        &self,
        mut job: IntegrationJob,
        worker_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<IntegrationJob, QueueError> {
        if !job.status.is_claimable() {
            return Err(QueueError::InvalidTransition {
                id: job.id.clone(),
                from: job.status,
                to: JobStatus::Processing,
            });
        }
        if !job.is_eligible(now) {
            return Err(QueueError::NotYetEligible(job.id.clone()));
        }

        job.status = JobStatus::Processing;
        job.claimed_by = Some(worker_id.into());
        job.claimed_at = Some(now);
        job.updated_at = now;
        Ok(job)
    }

    /// Records the end of an attempt. A retry recomputes `next_retry_at` from the
    /// incremented `retry_count`, so the schedule never drifts from [`retry_backoff`].
    pub fn apply_outcome(
        &self,
        mut job: IntegrationJob,
        outcome: JobOutcome,
        now: DateTime<Utc>,
    ) -> Result<IntegrationJob, QueueError> {
        if job.status.is_terminal() {
            return Err(QueueError::InvalidTransition {
                id: job.id.clone(),
                from: job.status,
                to: outcome.target_status(),
            });
        }

        job.status = outcome.target_status();
        job.claimed_by = None;
        job.claimed_at = None;
        job.updated_at = now;

        match outcome {
            JobOutcome::Completed { result } => {
                job.result = result;
                job.error_message = None;
                job.processed_at = Some(now);
            }
            JobOutcome::Failed { error, retry: true } => {
                job.retry_count += 1;
                job.next_retry_at = Some(now + retry_backoff(job.retry_count));
                job.error_message = Some(error);
            }
            JobOutcome::Failed { error, retry: false } => {
                job.error_message = Some(error);
                job.processed_at = Some(now);
            }
        }

        Ok(job)
    }

    pub fn claim_deadline(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::seconds(self.config.claim_timeout_seconds)
    }

    pub fn is_stale(&self, job: &IntegrationJob, now: DateTime<Utc>) -> bool {
        job.status == JobStatus::Processing
            && job.claimed_at.is_some_and(|claimed_at| claimed_at < self.claim_deadline(now))
    }
}
