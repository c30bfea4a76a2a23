use sqlx::{sqlite::SqliteRow, Row};

use crewflow_core::domain::prompt::{PromptType, WorkflowPrompt, WorkflowPromptId};

use super::{encode_timestamp, parse_timestamp, RepositoryError, WorkflowPromptRepository};
use crate::DbPool;

pub struct SqlWorkflowPromptRepository {
    pool: DbPool,
}

impl SqlWorkflowPromptRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl WorkflowPromptRepository for SqlWorkflowPromptRepository {
    async fn latest_by_type(
        &self,
        prompt_type: PromptType,
    ) -> Result<Option<WorkflowPrompt>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, prompt_type, name, prompt_text, created_at
             FROM workflow_prompts
             WHERE prompt_type = ?
             ORDER BY created_at DESC, id DESC
             LIMIT 1",
        )
        .bind(prompt_type.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(prompt_from_row).transpose()
    }

    async fn save(&self, prompt: WorkflowPrompt) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO workflow_prompts (id, prompt_type, name, prompt_text, created_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                prompt_type = excluded.prompt_type,
                name = excluded.name,
                prompt_text = excluded.prompt_text",
        )
        .bind(&prompt.id.0)
        .bind(prompt.prompt_type.as_str())
        .bind(&prompt.name)
        .bind(&prompt.prompt_text)
        .bind(encode_timestamp(prompt.created_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn prompt_from_row(row: SqliteRow) -> Result<WorkflowPrompt, RepositoryError> {
    let type_raw = row.try_get::<String, _>("prompt_type")?;
    let prompt_type = PromptType::parse(&type_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown prompt type `{type_raw}`")))?;

    Ok(WorkflowPrompt {
        id: WorkflowPromptId(row.try_get("id")?),
        prompt_type,
        name: row.try_get("name")?,
        prompt_text: row.try_get("prompt_text")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}
