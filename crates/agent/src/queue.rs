//! Integration Job Queue service and worker dispatch.
//!
//! Jobs are claimed atomically into `processing`, dispatched to the handler
//! registered for their `(operation, resource)` pair, and finalized through
//! the core engine so the backoff schedule is computed in one place only.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{error, info, warn};

use crewflow_core::domain::integration::{
    IntegrationJob, IntegrationJobId, JobStatus, NewIntegrationJob, OperationType, ResourceType,
};
use crewflow_core::{IntegrationQueueEngine, JobOutcome, QueueError};
use crewflow_db::repositories::{IntegrationJobRepository, RepositoryError};

use crate::integrations::{
    CommunicationRequest, CommunicationSender, CrmClient, IntegrationError,
};

#[derive(Debug, Error)]
pub enum JobQueueError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Transition(#[from] QueueError),
    #[error("claim on integration job `{0}` is no longer held")]
    ClaimLost(IntegrationJobId),
}

#[derive(Clone)]
pub struct IntegrationJobQueue {
    jobs: Arc<dyn IntegrationJobRepository>,
    engine: IntegrationQueueEngine,
}

impl IntegrationJobQueue {
    pub fn new(jobs: Arc<dyn IntegrationJobRepository>, engine: IntegrationQueueEngine) -> Self {
        Self { jobs, engine }
    }

    pub async fn enqueue(
        &self,
        new_job: NewIntegrationJob,
        now: DateTime<Utc>,
    ) -> Result<IntegrationJob, JobQueueError> {
        let job = self.engine.create_job(new_job, now);
        self.jobs.enqueue(&job).await?;
        info!(
            event_name = "queue.job.enqueued",
            job_id = %job.id,
            company_id = %job.company_id,
            operation_type = job.operation_type.as_str(),
            resource_type = job.resource_type.as_str(),
            action_record_id = job.action_record_id.as_ref().map(|id| id.0.as_str()).unwrap_or("none"),
            "integration job enqueued"
        );
        Ok(job)
    }

    /// Eligible jobs in `status`, oldest first, now held by `worker_id`.
    pub async fn claim_ready(
        &self,
        status: JobStatus,
        limit: u32,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<IntegrationJob>, JobQueueError> {
        Ok(self.jobs.claim_ready(status, limit, worker_id, now).await?)
    }

    /// Finalizes the attempt behind `claimed`, the job as returned by a claim.
    /// Fails with `ClaimLost` when the claim was recovered or reassigned since.
    pub async fn mark_result(
        &self,
        claimed: &IntegrationJob,
        outcome: JobOutcome,
        now: DateTime<Utc>,
    ) -> Result<IntegrationJob, JobQueueError> {
        let updated = self.engine.apply_outcome(claimed.clone(), outcome, now)?;

        if !self.jobs.update_outcome(claimed, &updated).await? {
            return Err(JobQueueError::ClaimLost(claimed.id.clone()));
        }

        match updated.status {
            JobStatus::Completed => info!(
                event_name = "queue.job.completed",
                job_id = %updated.id,
                "integration job completed"
            ),
            JobStatus::Retry => warn!(
                event_name = "queue.job.retry_scheduled",
                job_id = %updated.id,
                retry_count = updated.retry_count,
                next_retry_at = ?updated.next_retry_at,
                error = updated.error_message.as_deref().unwrap_or(""),
                "integration job failed; retry scheduled"
            ),
            _ => error!(
                event_name = "queue.job.failed",
                job_id = %updated.id,
                retry_count = updated.retry_count,
                error = updated.error_message.as_deref().unwrap_or(""),
                "integration job failed permanently"
            ),
        }
        Ok(updated)
    }

    /// Fails claims older than the claim timeout with retry intent.
    pub async fn recover_stale(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<usize, JobQueueError> {
        let stale = self.jobs.list_stale_claims(self.engine.claim_deadline(now), limit).await?;
        let mut recovered = 0;
        for job in stale {
            let worker = job.claimed_by.clone().unwrap_or_default();
            let outcome = JobOutcome::Failed {
                error: format!("claim by `{worker}` timed out"),
                retry: true,
            };
            match self.mark_result(&job, outcome, now).await {
                Ok(_) => recovered += 1,
                Err(JobQueueError::ClaimLost(job_id)) => {
                    info!(
                        event_name = "queue.job.stale_resolved",
                        job_id = %job_id,
                        "stale job was finalized by its worker first"
                    );
                }
                Err(queue_error) => return Err(queue_error),
            }
        }
        Ok(recovered)
    }

    pub async fn find(&self, job_id: &IntegrationJobId) -> Result<Option<IntegrationJob>, JobQueueError> {
        Ok(self.jobs.find_by_id(job_id).await?)
    }

    pub async fn list_by_status(
        &self,
        status: JobStatus,
        limit: u32,
    ) -> Result<Vec<IntegrationJob>, JobQueueError> {
        Ok(self.jobs.list_by_status(status, limit).await?)
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    fn operation_type(&self) -> OperationType;

    fn resource_type(&self) -> ResourceType;

    async fn handle(&self, job: &IntegrationJob) -> Result<Option<Value>, IntegrationError>;
}

/// Redelivers a communication whose first attempt failed.
pub struct CommunicationJobHandler {
    sender: Arc<dyn CommunicationSender>,
}

impl CommunicationJobHandler {
    pub fn new(sender: Arc<dyn CommunicationSender>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl JobHandler for CommunicationJobHandler {
    fn operation_type(&self) -> OperationType {
        OperationType::Write
    }

    fn resource_type(&self) -> ResourceType {
        ResourceType::Communication
    }

    async fn handle(&self, job: &IntegrationJob) -> Result<Option<Value>, IntegrationError> {
        let request: CommunicationRequest = serde_json::from_value(job.payload.clone())
            .map_err(|error| {
                IntegrationError::Permanent(format!("invalid communication payload: {error}"))
            })?;

        let response = self.sender.send(&request).await?;
        match response.failure() {
            None => Ok(Some(json!({"success": true, "details": response.details}))),
            Some(failure) => Err(failure),
        }
    }
}

pub struct ProjectWriteHandler {
    crm: Arc<dyn CrmClient>,
}

impl ProjectWriteHandler {
    pub fn new(crm: Arc<dyn CrmClient>) -> Self {
        Self { crm }
    }
}

#[async_trait]
impl JobHandler for ProjectWriteHandler {
    fn operation_type(&self) -> OperationType {
        OperationType::Write
    }

    fn resource_type(&self) -> ResourceType {
        ResourceType::Project
    }

    async fn handle(&self, job: &IntegrationJob) -> Result<Option<Value>, IntegrationError> {
        self.crm.write_project(&job.company_id, &job.payload).await.map(Some)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct WorkerReport {
    pub recovered: usize,
    pub claimed: usize,
    pub completed: usize,
    pub retried: usize,
    pub failed: usize,
}

pub struct IntegrationWorker {
    queue: IntegrationJobQueue,
    handlers: HashMap<(OperationType, ResourceType), Arc<dyn JobHandler>>,
    worker_id: String,
    batch_size: u32,
}

impl IntegrationWorker {
    pub fn new(queue: IntegrationJobQueue, worker_id: impl Into<String>, batch_size: u32) -> Self {
        Self { queue, handlers: HashMap::new(), worker_id: worker_id.into(), batch_size }
    }

    pub fn register<H>(&mut self, handler: H)
    where
        H: JobHandler + 'static,
    {
        self.handlers
            .insert((handler.operation_type(), handler.resource_type()), Arc::new(handler));
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// One polling pass: recover stale claims, then drain up to `batch_size`
    /// jobs from `pending` and from `retry`.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<WorkerReport, JobQueueError> {
        let mut report = WorkerReport {
            recovered: self.queue.recover_stale(now, self.batch_size).await?,
            ..WorkerReport::default()
        };

        for status in [JobStatus::Pending, JobStatus::Retry] {
            let claimed =
                self.queue.claim_ready(status, self.batch_size, &self.worker_id, now).await?;
            report.claimed += claimed.len();

            for job in claimed {
                let outcome = self.dispatch(&job).await;
                match self.queue.mark_result(&job, outcome, Utc::now()).await {
                    Ok(updated) => match updated.status {
                        JobStatus::Completed => report.completed += 1,
                        JobStatus::Retry => report.retried += 1,
                        _ => report.failed += 1,
                    },
                    Err(JobQueueError::ClaimLost(job_id)) => {
                        warn!(
                            event_name = "queue.job.claim_lost",
                            job_id = %job_id,
                            worker_id = %self.worker_id,
                            "claim was recovered by another worker; outcome discarded"
                        );
                    }
                    Err(queue_error) => {
                        error!(
                            event_name = "queue.job.mark_failed",
                            job_id = %job.id,
                            worker_id = %self.worker_id,
                            error = %queue_error,
                            "could not record integration job outcome"
                        );
                    }
                }
            }
        }

        Ok(report)
    }

    async fn dispatch(&self, job: &IntegrationJob) -> JobOutcome {
        let Some(handler) = self.handlers.get(&(job.operation_type, job.resource_type)) else {
            return JobOutcome::Failed {
                error: format!(
                    "no handler registered for {}/{}",
                    job.operation_type.as_str(),
                    job.resource_type.as_str()
                ),
                retry: false,
            };
        };

        match handler.handle(job).await {
            Ok(result) => JobOutcome::Completed { result },
            Err(failure) => JobOutcome::Failed {
                retry: failure.is_retryable(),
                error: failure.message().to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, Utc};
    use serde_json::json;

    use crewflow_core::domain::integration::{
        JobStatus, NewIntegrationJob, OperationType, ResourceType,
    };
    use crewflow_core::domain::project::CompanyId;
    use crewflow_core::{retry_backoff, IntegrationQueueEngine, JobOutcome};
    use crewflow_db::repositories::SqlIntegrationJobRepository;

    use super::{
        CommunicationJobHandler, IntegrationJobQueue, IntegrationWorker, ProjectWriteHandler,
    };
    use crate::integrations::{
        CommunicationResponse, IntegrationError, RecordingCommunicationSender, RecordingCrmClient,
    };
    use crate::test_support::setup_pool;

    fn project_write() -> NewIntegrationJob {
        NewIntegrationJob::new(
            CompanyId("acme".to_string()),
            OperationType::Write,
            ResourceType::Project,
            json!({"crm_id": "X123", "next_step": "Inspection"}),
        )
    }

    #[tokio::test]
    async fn repeated_failures_follow_the_backoff_schedule() {
        let pool = setup_pool().await;
        let queue = IntegrationJobQueue::new(
            Arc::new(SqlIntegrationJobRepository::new(pool.clone())),
            IntegrationQueueEngine::new(),
        );
        let start = Utc::now();
        let job = queue.enqueue(project_write(), start).await.expect("enqueue");

        let mut now = start;
        let mut status = JobStatus::Pending;
        for failure in 1..=10u32 {
            let claimed = queue.claim_ready(status, 1, "w", now).await.expect("claim");
            assert_eq!(claimed.len(), 1, "job must be claimable at attempt {failure}");

            let updated = queue
                .mark_result(
                    &claimed[0],
                    JobOutcome::Failed { error: "CRM 503".to_string(), retry: true },
                    now,
                )
                .await
                .expect("mark failure");

            assert_eq!(updated.retry_count, failure);
            assert_eq!(updated.next_retry_at, Some(now + retry_backoff(failure)));
            if failure == 3 {
                assert_eq!(updated.next_retry_at, Some(now + Duration::minutes(4)));
            }
            if failure == 10 {
                assert_eq!(updated.next_retry_at, Some(now + Duration::minutes(480)));
            }

            status = JobStatus::Retry;
            now = updated.next_retry_at.expect("scheduled");
        }

        pool.close().await;
    }

    #[tokio::test]
    async fn worker_dispatches_and_classifies_failures() {
        let pool = setup_pool().await;
        let queue = IntegrationJobQueue::new(
            Arc::new(SqlIntegrationJobRepository::new(pool.clone())),
            IntegrationQueueEngine::new(),
        );
        let now = Utc::now();
        let ok = queue.enqueue(project_write(), now - Duration::seconds(3)).await.expect("ok");
        let flaky = queue.enqueue(project_write(), now - Duration::seconds(2)).await.expect("flaky");
        let rejected =
            queue.enqueue(project_write(), now - Duration::seconds(1)).await.expect("rejected");
        let orphan = queue
            .enqueue(
                NewIntegrationJob::new(
                    CompanyId("acme".to_string()),
                    OperationType::Delete,
                    ResourceType::Note,
                    json!({}),
                ),
                now,
            )
            .await
            .expect("orphan");

        let crm = Arc::new(RecordingCrmClient::scripted([
            Ok(json!({"updated": true})),
            Err(IntegrationError::Retryable("CRM 503".to_string())),
            Err(IntegrationError::Permanent("CRM 422".to_string())),
        ]));
        let mut worker = IntegrationWorker::new(queue.clone(), "worker-1", 10);
        worker.register(ProjectWriteHandler::new(crm.clone()));

        let report = worker.run_once(now).await.expect("run once");
        assert_eq!(report.claimed, 4);
        assert_eq!(report.completed, 1);
        assert_eq!(report.retried, 1);
        assert_eq!(report.failed, 2);
        assert_eq!(crm.writes().len(), 3);

        let status_of = |id| {
            let queue = queue.clone();
            async move { queue.find(&id).await.expect("find").expect("exists").status }
        };
        assert_eq!(status_of(ok.id).await, JobStatus::Completed);
        assert_eq!(status_of(flaky.id).await, JobStatus::Retry);
        assert_eq!(status_of(rejected.id).await, JobStatus::Failed);

        let orphan = queue.find(&orphan.id).await.expect("find").expect("exists");
        assert_eq!(orphan.status, JobStatus::Failed);
        assert!(orphan.error_message.unwrap_or_default().contains("no handler"));

        let failed = queue.list_by_status(JobStatus::Failed, 10).await.expect("failed jobs");
        assert_eq!(failed.len(), 2);

        pool.close().await;
    }

    #[tokio::test]
    async fn stale_claims_are_released_for_retry() {
        let pool = setup_pool().await;
        let queue = IntegrationJobQueue::new(
            Arc::new(SqlIntegrationJobRepository::new(pool.clone())),
            IntegrationQueueEngine::new(),
        );
        let now = Utc::now();
        let job = queue.enqueue(project_write(), now - Duration::hours(1)).await.expect("enqueue");
        queue
            .claim_ready(JobStatus::Pending, 1, "crashed-worker", now - Duration::hours(1))
            .await
            .expect("claim");

        let recovered = queue.recover_stale(now, 10).await.expect("recover");
        assert_eq!(recovered, 1);

        let stored = queue.find(&job.id).await.expect("find").expect("exists");
        assert_eq!(stored.status, JobStatus::Retry);
        assert_eq!(stored.retry_count, 1);
        assert_eq!(stored.claimed_by, None);
        assert!(stored.error_message.unwrap_or_default().contains("crashed-worker"));

        pool.close().await;
    }

    #[tokio::test]
    async fn provider_rejection_fails_a_redelivery_for_good() {
        let pool = setup_pool().await;
        let queue = IntegrationJobQueue::new(
            Arc::new(SqlIntegrationJobRepository::new(pool.clone())),
            IntegrationQueueEngine::new(),
        );
        let now = Utc::now();
        let redelivery = |recipient: &str| {
            NewIntegrationJob::new(
                CompanyId("acme".to_string()),
                OperationType::Write,
                ResourceType::Communication,
                json!({
                    "actionId": format!("ACT-{recipient}"),
                    "messageContent": "Inspection moved to Tuesday",
                    "recipient": {"phone": recipient},
                    "channel": "sms",
                    "projectId": "PRJ-1",
                }),
            )
        };
        let blocked =
            queue.enqueue(redelivery("+15550100"), now - Duration::seconds(2)).await.expect("one");
        let busy =
            queue.enqueue(redelivery("+15550101"), now - Duration::seconds(1)).await.expect("two");

        let sender = Arc::new(RecordingCommunicationSender::scripted([
            Ok(CommunicationResponse::rejected("recipient opted out")),
            Ok(CommunicationResponse::deferred("carrier busy")),
        ]));
        let mut worker = IntegrationWorker::new(queue.clone(), "worker-1", 10);
        worker.register(CommunicationJobHandler::new(sender.clone()));

        let report = worker.run_once(now).await.expect("run once");
        assert_eq!(report.failed, 1);
        assert_eq!(report.retried, 1);

        let blocked = queue.find(&blocked.id).await.expect("find").expect("exists");
        assert_eq!(blocked.status, JobStatus::Failed);
        assert_eq!(blocked.error_message.as_deref(), Some("recipient opted out"));
        assert_eq!(blocked.next_retry_at, None);
        let busy = queue.find(&busy.id).await.expect("find").expect("exists");
        assert_eq!(busy.status, JobStatus::Retry);

        pool.close().await;
    }
}
