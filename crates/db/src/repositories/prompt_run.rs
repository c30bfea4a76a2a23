use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use crewflow_core::domain::project::ProjectId;
use crewflow_core::domain::prompt::{
    PromptRun, PromptRunId, PromptRunResult, PromptRunStatus, WorkflowPromptId,
};

use super::{
    encode_optional_timestamp, encode_timestamp, parse_optional_timestamp, parse_timestamp,
    PromptRunRepository, RepositoryError,
};
use crate::DbPool;

const PROMPT_RUN_COLUMNS: &str = "id, project_id, workflow_prompt_id, prompt_input, prompt_output,
     error_message, status, ai_provider, ai_model, created_at, completed_at, initiated_by";

pub struct SqlPromptRunRepository {
    pool: DbPool,
}

impl SqlPromptRunRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl PromptRunRepository for SqlPromptRunRepository {
    async fn insert(&self, run: &PromptRun) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO prompt_runs (
                id, project_id, workflow_prompt_id, prompt_input, prompt_output,
                error_message, status, ai_provider, ai_model, created_at, completed_at, initiated_by
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&run.id.0)
        .bind(run.project_id.as_ref().map(|id| id.0.as_str()))
        .bind(run.workflow_prompt_id.as_ref().map(|id| id.0.as_str()))
        .bind(&run.prompt_input)
        .bind(run.prompt_output.as_deref())
        .bind(run.error_message.as_deref())
        .bind(run.status.as_str())
        .bind(&run.ai_provider)
        .bind(&run.ai_model)
        .bind(encode_timestamp(run.created_at))
        .bind(encode_optional_timestamp(run.completed_at))
        .bind(run.initiated_by.as_deref())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_by_id(&self, id: &PromptRunId) -> Result<Option<PromptRun>, RepositoryError> {
        let row =
            sqlx::query(&format!("SELECT {PROMPT_RUN_COLUMNS} FROM prompt_runs WHERE id = ?"))
                .bind(&id.0)
                .fetch_optional(&self.pool)
                .await?;

        row.map(prompt_run_from_row).transpose()
    }

    async fn finalize(
        &self,
        id: &PromptRunId,
        result: &PromptRunResult,
        completed_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let (output, error) = match result {
            PromptRunResult::Output(output) => (Some(output.as_str()), None),
            PromptRunResult::Error(error) => (None, Some(error.as_str())),
        };

        let updated = sqlx::query(
            "UPDATE prompt_runs
             SET status = ?, prompt_output = ?, error_message = ?, completed_at = ?
             WHERE id = ? AND status = ?",
        )
        .bind(result.status().as_str())
        .bind(output)
        .bind(error)
        .bind(encode_timestamp(completed_at))
        .bind(&id.0)
        .bind(PromptRunStatus::Pending.as_str())
        .execute(&self.pool)
        .await?;

        Ok(updated.rows_affected() == 1)
    }

    async fn list_for_project(
        &self,
        project_id: &ProjectId,
    ) -> Result<Vec<PromptRun>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {PROMPT_RUN_COLUMNS}
             FROM prompt_runs
             WHERE project_id = ?
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(&project_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(prompt_run_from_row).collect()
    }
}

fn prompt_run_from_row(row: SqliteRow) -> Result<PromptRun, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = PromptRunStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown prompt run status `{status_raw}`")))?;

    Ok(PromptRun {
        id: PromptRunId(row.try_get("id")?),
        project_id: row.try_get::<Option<String>, _>("project_id")?.map(ProjectId),
        workflow_prompt_id: row
            .try_get::<Option<String>, _>("workflow_prompt_id")?
            .map(WorkflowPromptId),
        prompt_input: row.try_get("prompt_input")?,
        prompt_output: row.try_get("prompt_output")?,
        error_message: row.try_get("error_message")?,
        status,
        ai_provider: row.try_get("ai_provider")?,
        ai_model: row.try_get("ai_model")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        completed_at: parse_optional_timestamp("completed_at", row.try_get("completed_at")?)?,
        initiated_by: row.try_get("initiated_by")?,
    })
}
