//! Action Executor and approval gate.
//!
//! Execution is idempotent on record status: only `approved` records, or
//! `pending` ones that need no approval, produce an external effect, and only
//! after a compare-and-set has moved them to `executing`. A failed delivery
//! marks the record `failed` and hands redelivery to the integration queue;
//! the record itself is never retried.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, warn};

use crewflow_core::domain::action::{
    ActionPayload, ActionRecord, ActionRecordId, ActionStatus, MessagePayload,
    TimelineUpdatePayload,
};
use crewflow_core::domain::integration::{
    IntegrationJobId, NewIntegrationJob, OperationType, ResourceType,
};
use crewflow_core::domain::project::{Project, ProjectId};
use crewflow_core::DomainError;
use crewflow_db::repositories::{ActionRecordRepository, ProjectRepository, RepositoryError};

use crate::integrations::{CommunicationRequest, CommunicationSender};
use crate::queue::{IntegrationJobQueue, JobQueueError};

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("action record `{0}` not found")]
    ActionNotFound(ActionRecordId),
    #[error("project `{0}` not found")]
    ProjectNotFound(ProjectId),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("action record `{0}` changed concurrently")]
    Conflict(ActionRecordId),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Queue(#[from] JobQueueError),
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Executed { result: Value },
    Failed { error: String, retry_job_id: Option<IntegrationJobId> },
    Skipped { reason: String },
}

pub struct ActionExecutor {
    actions: Arc<dyn ActionRecordRepository>,
    projects: Arc<dyn ProjectRepository>,
    queue: IntegrationJobQueue,
    sender: Arc<dyn CommunicationSender>,
}

impl ActionExecutor {
    pub fn new(
        actions: Arc<dyn ActionRecordRepository>,
        projects: Arc<dyn ProjectRepository>,
        queue: IntegrationJobQueue,
        sender: Arc<dyn CommunicationSender>,
    ) -> Self {
        Self { actions, projects, queue, sender }
    }

    pub async fn find(&self, id: &ActionRecordId) -> Result<ActionRecord, ExecutorError> {
        self.actions.find_by_id(id).await?.ok_or_else(|| ExecutorError::ActionNotFound(id.clone()))
    }

    pub async fn list_by_status(
        &self,
        status: ActionStatus,
        limit: u32,
    ) -> Result<Vec<ActionRecord>, ExecutorError> {
        Ok(self.actions.list_by_status(status, limit).await?)
    }

    pub async fn approve(
        &self,
        id: &ActionRecordId,
        now: DateTime<Utc>,
    ) -> Result<ActionRecord, ExecutorError> {
        let mut record = self.find(id).await?;
        let previous = record.status;
        record.approve(now).map_err(DomainError::from)?;
        self.persist(&record, previous).await?;
        info!(event_name = "action.approved", action_record_id = %record.id, "action approved");
        Ok(record)
    }

    pub async fn reject(
        &self,
        id: &ActionRecordId,
        now: DateTime<Utc>,
    ) -> Result<ActionRecord, ExecutorError> {
        let mut record = self.find(id).await?;
        let previous = record.status;
        record.reject(now).map_err(DomainError::from)?;
        self.persist(&record, previous).await?;
        info!(event_name = "action.rejected", action_record_id = %record.id, "action rejected");
        Ok(record)
    }

    pub async fn execute_action(
        &self,
        id: &ActionRecordId,
        now: DateTime<Utc>,
    ) -> Result<ExecutionOutcome, ExecutorError> {
        let record = self.find(id).await?;
        if !record.is_executable() {
            let reason = if record.status == ActionStatus::Pending {
                "action is awaiting approval".to_string()
            } else {
                format!("action is already {}", record.status.as_str())
            };
            info!(
                event_name = "action.execution_skipped",
                action_record_id = %record.id,
                status = record.status.as_str(),
                "action not executable"
            );
            return Ok(ExecutionOutcome::Skipped { reason });
        }

        match &record.payload {
            ActionPayload::HumanReview(_) => {
                return Ok(ExecutionOutcome::Skipped {
                    reason: "human review actions are resolved by an operator".to_string(),
                });
            }
            ActionPayload::SetFutureReminder(_) => {
                return Ok(ExecutionOutcome::Skipped {
                    reason: "reminders take effect when they are scheduled".to_string(),
                });
            }
            ActionPayload::Message(_) | ActionPayload::TimelineUpdate(_) => {}
        }

        let Some(record) = self.claim(record, now).await? else {
            info!(
                event_name = "action.execution_skipped",
                action_record_id = %id,
                "action was claimed by another executor"
            );
            return Ok(ExecutionOutcome::Skipped {
                reason: "action is already being executed".to_string(),
            });
        };

        let outcome = match record.payload.clone() {
            ActionPayload::Message(message) => self.send_message(record, message, now).await,
            ActionPayload::TimelineUpdate(update) => {
                self.push_timeline_update(record, update, now).await
            }
            ActionPayload::HumanReview(_) | ActionPayload::SetFutureReminder(_) => {
                Err(DomainError::InvariantViolation(format!(
                    "action record `{id}` has no automated execution"
                ))
                .into())
            }
        };

        if let Err(execution_error) = &outcome {
            self.release_claim(id, execution_error, now).await;
        }
        outcome
    }

    /// Moves the record to `executing`. `None` means another caller won.
    async fn claim(
        &self,
        mut record: ActionRecord,
        now: DateTime<Utc>,
    ) -> Result<Option<ActionRecord>, ExecutorError> {
        let previous = record.status;
        record.begin_execution(now).map_err(DomainError::from)?;
        if self.actions.save_transition(&record, previous).await? {
            Ok(Some(record))
        } else {
            Ok(None)
        }
    }

    /// Best-effort: a claimed record whose execution errored is marked `failed`
    /// rather than left `executing`.
    async fn release_claim(
        &self,
        id: &ActionRecordId,
        execution_error: &ExecutorError,
        now: DateTime<Utc>,
    ) {
        let released = match self.actions.find_by_id(id).await {
            Ok(Some(mut record)) if record.status == ActionStatus::Executing => {
                let result = json!({ "success": false, "error": execution_error.to_string() });
                match record.mark_failed(result, now) {
                    Ok(()) => self.actions.save_transition(&record, ActionStatus::Executing).await,
                    Err(_) => Ok(false),
                }
            }
            Ok(_) => Ok(false),
            Err(repo_error) => Err(repo_error),
        };

        if let Err(repo_error) = released {
            warn!(
                event_name = "action.claim_release_failed",
                action_record_id = %id,
                error = %repo_error,
                "claimed action could not be marked failed"
            );
        }
    }

    async fn send_message(
        &self,
        mut record: ActionRecord,
        message: MessagePayload,
        now: DateTime<Utc>,
    ) -> Result<ExecutionOutcome, ExecutorError> {
        let project = self.load_project(&record.project_id).await?;
        let channel = message.resolved_channel();
        let request = CommunicationRequest {
            action_id: record.id.clone(),
            message_content: message.message_content,
            recipient: message.recipient,
            channel,
            project_id: record.project_id.clone(),
        };

        let delivery = match self.sender.send(&request).await {
            Ok(response) if response.success => Ok(response.details),
            Ok(response) => {
                Err(response.error.unwrap_or_else(|| "delivery was not accepted".to_string()))
            }
            Err(integration_error) => Err(integration_error.to_string()),
        };

        let previous = record.status;
        match delivery {
            Ok(details) => {
                let result = json!({
                    "success": true,
                    "channel": channel.as_str(),
                    "details": details,
                });
                record.mark_executed(result.clone(), now).map_err(DomainError::from)?;
                self.persist(&record, previous).await?;
                info!(
                    event_name = "action.executed",
                    action_record_id = %record.id,
                    project_id = %record.project_id,
                    channel = channel.as_str(),
                    "message delivered"
                );
                Ok(ExecutionOutcome::Executed { result })
            }
            Err(error) => {
                let payload = serde_json::to_value(&request).map_err(|encode_error| {
                    DomainError::InvariantViolation(format!(
                        "communication request is not serializable: {encode_error}"
                    ))
                })?;
                let job = self
                    .queue
                    .enqueue(
                        NewIntegrationJob::new(
                            project.company_id.clone(),
                            OperationType::Write,
                            ResourceType::Communication,
                            payload,
                        )
                        .for_project(project.id.clone())
                        .for_action(record.id.clone()),
                        now,
                    )
                    .await?;

                let result = json!({
                    "success": false,
                    "channel": channel.as_str(),
                    "error": error,
                    "retry_job_id": job.id,
                });
                record.mark_failed(result, now).map_err(DomainError::from)?;
                self.persist(&record, previous).await?;
                warn!(
                    event_name = "action.delivery_failed",
                    action_record_id = %record.id,
                    project_id = %record.project_id,
                    job_id = %job.id,
                    error = %error,
                    "message delivery failed; redelivery queued"
                );
                Ok(ExecutionOutcome::Failed { error, retry_job_id: Some(job.id) })
            }
        }
    }

    async fn push_timeline_update(
        &self,
        mut record: ActionRecord,
        update: TimelineUpdatePayload,
        now: DateTime<Utc>,
    ) -> Result<ExecutionOutcome, ExecutorError> {
        let project = self.load_project(&record.project_id).await?;
        let job = self
            .queue
            .enqueue(
                NewIntegrationJob::new(
                    project.company_id.clone(),
                    OperationType::Write,
                    ResourceType::Project,
                    json!({
                        "crm_id": project.crm_id,
                        "next_step": update.next_step,
                        "note": update.note,
                        "fields": update.fields,
                    }),
                )
                .for_project(project.id.clone())
                .for_action(record.id.clone()),
                now,
            )
            .await?;

        if let Some(next_step) = &update.next_step {
            self.projects.update_next_step(&project.id, next_step, now).await?;
        }

        let previous = record.status;
        let result = json!({ "crm_job_id": job.id });
        record.mark_executed(result.clone(), now).map_err(DomainError::from)?;
        self.persist(&record, previous).await?;
        info!(
            event_name = "action.executed",
            action_record_id = %record.id,
            project_id = %record.project_id,
            job_id = %job.id,
            "timeline update queued for crm"
        );
        Ok(ExecutionOutcome::Executed { result })
    }

    async fn load_project(&self, id: &ProjectId) -> Result<Project, ExecutorError> {
        self.projects.find_by_id(id).await?.ok_or_else(|| ExecutorError::ProjectNotFound(id.clone()))
    }

    async fn persist(
        &self,
        record: &ActionRecord,
        expected: ActionStatus,
    ) -> Result<(), ExecutorError> {
        if self.actions.save_transition(record, expected).await? {
            Ok(())
        } else {
            Err(ExecutorError::Conflict(record.id.clone()))
        }
    }
}
