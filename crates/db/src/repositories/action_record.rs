use sqlx::{sqlite::SqliteRow, Row};

use crewflow_core::domain::action::{
    ActionPayload, ActionRecord, ActionRecordId, ActionStatus, ActionType,
};
use crewflow_core::domain::project::ProjectId;
use crewflow_core::domain::prompt::PromptRunId;

use super::{
    encode_optional_timestamp, encode_timestamp, parse_optional_json, parse_optional_timestamp,
    parse_timestamp, ActionRecordRepository, RepositoryError,
};
use crate::DbPool;

const ACTION_RECORD_COLUMNS: &str = "id, project_id, prompt_run_id, action_type, action_payload,
     status, requires_approval, executed_at, execution_result, created_at, updated_at";

pub struct SqlActionRecordRepository {
    pool: DbPool,
}

impl SqlActionRecordRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ActionRecordRepository for SqlActionRecordRepository {
    async fn insert(&self, record: &ActionRecord) -> Result<(), RepositoryError> {
        let payload = encode_payload(&record.payload)?;
        let execution_result = encode_result(record)?;

        sqlx::query(
            "INSERT INTO action_records (
                id, project_id, prompt_run_id, action_type, action_payload, status,
                requires_approval, executed_at, execution_result, created_at, updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id.0)
        .bind(&record.project_id.0)
        .bind(record.prompt_run_id.as_ref().map(|id| id.0.as_str()))
        .bind(record.action_type().as_str())
        .bind(payload)
        .bind(record.status.as_str())
        .bind(record.requires_approval)
        .bind(encode_optional_timestamp(record.executed_at))
        .bind(execution_result)
        .bind(encode_timestamp(record.created_at))
        .bind(encode_timestamp(record.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_by_id(
        &self,
        id: &ActionRecordId,
    ) -> Result<Option<ActionRecord>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {ACTION_RECORD_COLUMNS} FROM action_records WHERE id = ?"
        ))
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(action_record_from_row).transpose()
    }

    async fn save_transition(
        &self,
        record: &ActionRecord,
        expected: ActionStatus,
    ) -> Result<bool, RepositoryError> {
        let payload = encode_payload(&record.payload)?;
        let execution_result = encode_result(record)?;

        let updated = sqlx::query(
            "UPDATE action_records
             SET status = ?, action_payload = ?, executed_at = ?, execution_result = ?,
                 updated_at = ?
             WHERE id = ? AND status = ?",
        )
        .bind(record.status.as_str())
        .bind(payload)
        .bind(encode_optional_timestamp(record.executed_at))
        .bind(execution_result)
        .bind(encode_timestamp(record.updated_at))
        .bind(&record.id.0)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;

        Ok(updated.rows_affected() == 1)
    }

    async fn list_by_status(
        &self,
        status: ActionStatus,
        limit: u32,
    ) -> Result<Vec<ActionRecord>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {ACTION_RECORD_COLUMNS}
             FROM action_records
             WHERE status = ?
             ORDER BY created_at ASC, id ASC
             LIMIT ?"
        ))
        .bind(status.as_str())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(action_record_from_row).collect()
    }

    async fn list_for_project(
        &self,
        project_id: &ProjectId,
    ) -> Result<Vec<ActionRecord>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {ACTION_RECORD_COLUMNS}
             FROM action_records
             WHERE project_id = ?
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(&project_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(action_record_from_row).collect()
    }
}

fn encode_payload(payload: &ActionPayload) -> Result<String, RepositoryError> {
    serde_json::to_string(payload)
        .map_err(|error| RepositoryError::Decode(format!("could not encode action payload: {error}")))
}

fn encode_result(record: &ActionRecord) -> Result<Option<String>, RepositoryError> {
    record
        .execution_result
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|error| {
            RepositoryError::Decode(format!("could not encode execution result: {error}"))
        })
}

fn action_record_from_row(row: SqliteRow) -> Result<ActionRecord, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = ActionStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown action status `{status_raw}`")))?;

    let type_raw = row.try_get::<String, _>("action_type")?;
    let action_type = ActionType::parse(&type_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown action type `{type_raw}`")))?;

    let payload_raw = row.try_get::<String, _>("action_payload")?;
    let payload: ActionPayload = serde_json::from_str(&payload_raw).map_err(|error| {
        RepositoryError::Decode(format!("invalid action payload `{payload_raw}`: {error}"))
    })?;
    if payload.action_type() != action_type {
        return Err(RepositoryError::Decode(format!(
            "action payload type `{}` does not match column `{}`",
            payload.action_type().as_str(),
            action_type.as_str()
        )));
    }

    Ok(ActionRecord {
        id: ActionRecordId(row.try_get("id")?),
        project_id: ProjectId(row.try_get("project_id")?),
        prompt_run_id: row.try_get::<Option<String>, _>("prompt_run_id")?.map(PromptRunId),
        payload,
        status,
        requires_approval: row.try_get("requires_approval")?,
        executed_at: parse_optional_timestamp("executed_at", row.try_get("executed_at")?)?,
        execution_result: parse_optional_json("execution_result", row.try_get("execution_result")?)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}
