//! Webhook-driven pipeline: project upsert, summary refresh, action detection,
//! and execution of actions that need no approval.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info};

use crewflow_core::domain::action::ActionRecordId;
use crewflow_core::domain::project::ProjectId;
use crewflow_core::domain::prompt::PromptRunId;
use crewflow_core::WebhookEnvelope;
use crewflow_db::repositories::{ProjectRepository, RepositoryError};

use crate::detection::{ActionDetectionService, DetectionContext, DetectionError, DetectionOutcome};
use crate::executor::{ActionExecutor, ExecutionOutcome};
use crate::summary::{SummaryError, SummaryService};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Summary(#[from] SummaryError),
    #[error(transparent)]
    Detection(#[from] DetectionError),
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PipelineReport {
    pub correlation_id: String,
    pub project_id: ProjectId,
    pub created: bool,
    pub summary_prompt_run_id: Option<PromptRunId>,
    pub summary_updated: bool,
    pub decision: &'static str,
    pub action_record_id: Option<ActionRecordId>,
    pub next_check_date: Option<DateTime<Utc>>,
    pub execution: Option<ExecutionOutcome>,
}

pub struct ProjectPipeline {
    projects: Arc<dyn ProjectRepository>,
    summary: SummaryService,
    detection: Arc<ActionDetectionService>,
    executor: Arc<ActionExecutor>,
}

impl ProjectPipeline {
    pub fn new(
        projects: Arc<dyn ProjectRepository>,
        summary: SummaryService,
        detection: Arc<ActionDetectionService>,
        executor: Arc<ActionExecutor>,
    ) -> Self {
        Self { projects, summary, detection, executor }
    }

    pub async fn ingest_webhook(
        &self,
        envelope: &WebhookEnvelope,
        correlation_id: &str,
        now: DateTime<Utc>,
    ) -> Result<PipelineReport, PipelineError> {
        let (project, created) = self
            .projects
            .upsert_by_crm_id(&envelope.company_id, &envelope.crm_id, envelope.attributes(), now)
            .await?;
        info!(
            event_name = "pipeline.project.upserted",
            correlation_id,
            project_id = %project.id,
            crm_id = %project.crm_id,
            created,
            "project mirrored from crm event"
        );

        let summary = self.summary.refresh(project, envelope, correlation_id, now).await?;

        let context = DetectionContext {
            is_reminder_check: false,
            initiated_by: Some("webhook".to_string()),
            correlation_id: Some(correlation_id.to_string()),
        };
        let detection = self.detection.detect(&summary.project, &context, now).await?;

        let execution = match &detection.outcome {
            DetectionOutcome::ActionNeeded { record } if record.is_executable() => {
                match self.executor.execute_action(&record.id, now).await {
                    Ok(outcome) => Some(outcome),
                    Err(execution_error) => {
                        // The record stays pending for operators.
                        error!(
                            event_name = "pipeline.execution.failed",
                            correlation_id,
                            project_id = %summary.project.id,
                            action_record_id = %record.id,
                            error = %execution_error,
                            "auto-approved action could not be executed"
                        );
                        None
                    }
                }
            }
            _ => None,
        };

        let next_check_date = match &detection.outcome {
            DetectionOutcome::SetFutureReminder { next_check_date, .. } => Some(*next_check_date),
            _ => summary.project.next_check_date,
        };

        Ok(PipelineReport {
            correlation_id: correlation_id.to_string(),
            project_id: summary.project.id.clone(),
            created,
            summary_prompt_run_id: summary.run_id,
            summary_updated: summary.updated,
            decision: detection.outcome.kind().as_str(),
            action_record_id: detection.outcome.action_record().map(|record| record.id.clone()),
            next_check_date,
            execution,
        })
    }
}
