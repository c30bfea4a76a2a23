use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use thiserror::Error;

use crewflow_core::domain::action::{ActionRecord, ActionRecordId, ActionStatus};
use crewflow_core::domain::integration::{IntegrationJob, IntegrationJobId, JobStatus};
use crewflow_core::domain::project::{CompanyId, Project, ProjectAttributes, ProjectId};
use crewflow_core::domain::prompt::{
    PromptRun, PromptRunId, PromptRunResult, PromptType, WorkflowPrompt,
};

pub mod action_record;
pub mod integration_job;
pub mod project;
pub mod prompt_run;
pub mod workflow_prompt;

pub use action_record::SqlActionRecordRepository;
pub use integration_job::SqlIntegrationJobRepository;
pub use project::SqlProjectRepository;
pub use prompt_run::SqlPromptRunRepository;
pub use workflow_prompt::SqlWorkflowPromptRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("{entity} `{id}` not found")]
    NotFound { entity: &'static str, id: String },
}

#[async_trait]
pub trait ProjectRepository: Send + Sync {
    async fn find_by_id(&self, id: &ProjectId) -> Result<Option<Project>, RepositoryError>;

    async fn find_by_crm_id(
        &self,
        company_id: &CompanyId,
        crm_id: &str,
    ) -> Result<Option<Project>, RepositoryError>;

    /// Creates the project on first sight of `(company_id, crm_id)`, otherwise
    /// overlays the provided attributes. Returns the stored project and whether
    /// this call created it.
    async fn upsert_by_crm_id(
        &self,
        company_id: &CompanyId,
        crm_id: &str,
        attributes: ProjectAttributes,
        now: DateTime<Utc>,
    ) -> Result<(Project, bool), RepositoryError>;

    /// Writes only the summary; the check date belongs to the reminder scheduler.
    async fn update_summary(
        &self,
        id: &ProjectId,
        summary: &str,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;

    async fn update_next_step(
        &self,
        id: &ProjectId,
        next_step: &str,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;

    async fn set_next_check_date(
        &self,
        id: &ProjectId,
        next_check_date: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;

    /// Atomically clears the check date of up to `limit` projects due at `now`
    /// and returns them. Each due project is handed to one caller.
    async fn claim_due_for_check(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Project>, RepositoryError>;
}

#[async_trait]
pub trait WorkflowPromptRepository: Send + Sync {
    async fn latest_by_type(
        &self,
        prompt_type: PromptType,
    ) -> Result<Option<WorkflowPrompt>, RepositoryError>;

    async fn save(&self, prompt: WorkflowPrompt) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait PromptRunRepository: Send + Sync {
    async fn insert(&self, run: &PromptRun) -> Result<(), RepositoryError>;

    async fn find_by_id(&self, id: &PromptRunId) -> Result<Option<PromptRun>, RepositoryError>;

    /// Moves a `PENDING` run to its terminal status. Returns `false` when the run
    /// was missing or already terminal; nothing is written in that case.
    async fn finalize(
        &self,
        id: &PromptRunId,
        result: &PromptRunResult,
        completed_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;

    async fn list_for_project(&self, project_id: &ProjectId)
        -> Result<Vec<PromptRun>, RepositoryError>;
}

#[async_trait]
pub trait ActionRecordRepository: Send + Sync {
    async fn insert(&self, record: &ActionRecord) -> Result<(), RepositoryError>;

    async fn find_by_id(&self, id: &ActionRecordId)
        -> Result<Option<ActionRecord>, RepositoryError>;

    /// Compare-and-set write of a transitioned record. Returns `false` if the
    /// stored status no longer equals `expected`.
    async fn save_transition(
        &self,
        record: &ActionRecord,
        expected: ActionStatus,
    ) -> Result<bool, RepositoryError>;

    async fn list_by_status(
        &self,
        status: ActionStatus,
        limit: u32,
    ) -> Result<Vec<ActionRecord>, RepositoryError>;

    async fn list_for_project(
        &self,
        project_id: &ProjectId,
    ) -> Result<Vec<ActionRecord>, RepositoryError>;
}

#[async_trait]
pub trait IntegrationJobRepository: Send + Sync {
    async fn enqueue(&self, job: &IntegrationJob) -> Result<(), RepositoryError>;

    async fn find_by_id(
        &self,
        id: &IntegrationJobId,
    ) -> Result<Option<IntegrationJob>, RepositoryError>;

    /// Atomically moves up to `limit` eligible jobs in `status` to `processing`
    /// for `worker_id`, oldest first. A job is returned to at most one caller.
    async fn claim_ready(
        &self,
        status: JobStatus,
        limit: u32,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<IntegrationJob>, RepositoryError>;

    /// Persists the result of the attempt that `claimed` represents. The write
    /// only lands while the stored row still carries that exact claim
    /// (`processing`, same claimant, claim time and retry count); otherwise
    /// nothing is written and `false` is returned.
    async fn update_outcome(
        &self,
        claimed: &IntegrationJob,
        job: &IntegrationJob,
    ) -> Result<bool, RepositoryError>;

    async fn list_stale_claims(
        &self,
        claimed_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<IntegrationJob>, RepositoryError>;

    async fn list_by_status(
        &self,
        status: JobStatus,
        limit: u32,
    ) -> Result<Vec<IntegrationJob>, RepositoryError>;

    async fn list_for_action(
        &self,
        action_record_id: &ActionRecordId,
    ) -> Result<Vec<IntegrationJob>, RepositoryError>;
}

/// Fixed-width UTC encoding so lexical order in SQL matches chronological order.
pub fn encode_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn encode_optional_timestamp(value: Option<DateTime<Utc>>) -> Option<String> {
    value.map(encode_timestamp)
}

pub(crate) fn parse_u32(column: &str, value: i64) -> Result<u32, RepositoryError> {
    u32::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!(
            "invalid value for `{column}` (expected non-negative u32): {value}"
        ))
    })
}

pub(crate) fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}

pub(crate) fn parse_optional_timestamp(
    column: &str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    value.map(|timestamp| parse_timestamp(column, timestamp)).transpose()
}

pub(crate) fn parse_json(column: &str, value: &str) -> Result<Value, RepositoryError> {
    serde_json::from_str(value)
        .map_err(|error| RepositoryError::Decode(format!("invalid JSON in `{column}`: {error}")))
}

pub(crate) fn parse_optional_json(
    column: &str,
    value: Option<String>,
) -> Result<Option<Value>, RepositoryError> {
    value.map(|raw| parse_json(column, &raw)).transpose()
}
