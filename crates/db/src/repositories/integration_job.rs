use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use crewflow_core::domain::action::ActionRecordId;
use crewflow_core::domain::integration::{
    IntegrationJob, IntegrationJobId, JobStatus, OperationType, ResourceType,
};
use crewflow_core::domain::project::{CompanyId, ProjectId};

use super::{
    encode_optional_timestamp, encode_timestamp, parse_json, parse_optional_json,
    parse_optional_timestamp, parse_timestamp, parse_u32, IntegrationJobRepository,
    RepositoryError,
};
use crate::DbPool;

const JOB_COLUMNS: &str = "id, company_id, project_id, action_record_id, operation_type,
     resource_type, payload, status, retry_count, next_retry_at, claimed_by, claimed_at,
     processed_at, result, error_message, created_at, updated_at";

pub struct SqlIntegrationJobRepository {
    pool: DbPool,
}

impl SqlIntegrationJobRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl IntegrationJobRepository for SqlIntegrationJobRepository {
    async fn enqueue(&self, job: &IntegrationJob) -> Result<(), RepositoryError> {
        let payload = encode_json("payload", &job.payload)?;
        let result = job.result.as_ref().map(|value| encode_json("result", value)).transpose()?;

        sqlx::query(
            "INSERT INTO integration_job_queue (
                id, company_id, project_id, action_record_id, operation_type, resource_type,
                payload, status, retry_count, next_retry_at, claimed_by, claimed_at,
                processed_at, result, error_message, created_at, updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&job.id.0)
        .bind(&job.company_id.0)
        .bind(job.project_id.as_ref().map(|id| id.0.as_str()))
        .bind(job.action_record_id.as_ref().map(|id| id.0.as_str()))
        .bind(job.operation_type.as_str())
        .bind(job.resource_type.as_str())
        .bind(payload)
        .bind(job.status.as_str())
        .bind(i64::from(job.retry_count))
        .bind(encode_optional_timestamp(job.next_retry_at))
        .bind(job.claimed_by.as_deref())
        .bind(encode_optional_timestamp(job.claimed_at))
        .bind(encode_optional_timestamp(job.processed_at))
        .bind(result)
        .bind(job.error_message.as_deref())
        .bind(encode_timestamp(job.created_at))
        .bind(encode_timestamp(job.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_by_id(
        &self,
        id: &IntegrationJobId,
    ) -> Result<Option<IntegrationJob>, RepositoryError> {
        let row =
            sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM integration_job_queue WHERE id = ?"))
                .bind(&id.0)
                .fetch_optional(&self.pool)
                .await?;

        row.map(job_from_row).transpose()
    }

    async fn claim_ready(
        &self,
        status: JobStatus,
        limit: u32,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<IntegrationJob>, RepositoryError> {
        if !status.is_claimable() || limit == 0 {
            return Ok(Vec::new());
        }

        let now_encoded = encode_timestamp(now);
        // Selection and status flip happen in one statement; the outer status
        // predicate keeps a concurrent claimer from taking the same row.
        let rows = sqlx::query(&format!(
            "UPDATE integration_job_queue
             SET status = ?, claimed_by = ?, claimed_at = ?, updated_at = ?
             WHERE id IN (
                SELECT id FROM integration_job_queue
                WHERE status = ? AND (next_retry_at IS NULL OR next_retry_at <= ?)
                ORDER BY created_at ASC, id ASC
                LIMIT ?
             )
             AND status = ?
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(JobStatus::Processing.as_str())
        .bind(worker_id)
        .bind(&now_encoded)
        .bind(&now_encoded)
        .bind(status.as_str())
        .bind(&now_encoded)
        .bind(i64::from(limit))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut jobs = rows.into_iter().map(job_from_row).collect::<Result<Vec<_>, _>>()?;
        // RETURNING order is unspecified in SQLite.
        jobs.sort_by(|left, right| {
            left.created_at.cmp(&right.created_at).then_with(|| left.id.0.cmp(&right.id.0))
        });
        Ok(jobs)
    }

    async fn update_outcome(
        &self,
        claimed: &IntegrationJob,
        job: &IntegrationJob,
    ) -> Result<bool, RepositoryError> {
        let result = job.result.as_ref().map(|value| encode_json("result", value)).transpose()?;

        let updated = sqlx::query(
            "UPDATE integration_job_queue
             SET status = ?, retry_count = ?, next_retry_at = ?, claimed_by = ?, claimed_at = ?,
                 processed_at = ?, result = ?, error_message = ?, updated_at = ?
             WHERE id = ? AND status = 'processing' AND retry_count = ?
               AND claimed_by IS ? AND claimed_at IS ?",
        )
        .bind(job.status.as_str())
        .bind(i64::from(job.retry_count))
        .bind(encode_optional_timestamp(job.next_retry_at))
        .bind(job.claimed_by.as_deref())
        .bind(encode_optional_timestamp(job.claimed_at))
        .bind(encode_optional_timestamp(job.processed_at))
        .bind(result)
        .bind(job.error_message.as_deref())
        .bind(encode_timestamp(job.updated_at))
        .bind(&job.id.0)
        .bind(i64::from(claimed.retry_count))
        .bind(claimed.claimed_by.as_deref())
        .bind(encode_optional_timestamp(claimed.claimed_at))
        .execute(&self.pool)
        .await?;

        Ok(updated.rows_affected() == 1)
    }

    async fn list_stale_claims(
        &self,
        claimed_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<IntegrationJob>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS}
             FROM integration_job_queue
             WHERE status = 'processing' AND claimed_at < ?
             ORDER BY claimed_at ASC, id ASC
             LIMIT ?"
        ))
        .bind(encode_timestamp(claimed_before))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(job_from_row).collect()
    }

    async fn list_by_status(
        &self,
        status: JobStatus,
        limit: u32,
    ) -> Result<Vec<IntegrationJob>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS}
             FROM integration_job_queue
             WHERE status = ?
             ORDER BY created_at ASC, id ASC
             LIMIT ?"
        ))
        .bind(status.as_str())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(job_from_row).collect()
    }

    async fn list_for_action(
        &self,
        action_record_id: &ActionRecordId,
    ) -> Result<Vec<IntegrationJob>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS}
             FROM integration_job_queue
             WHERE action_record_id = ?
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(&action_record_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(job_from_row).collect()
    }
}

fn encode_json(column: &str, value: &serde_json::Value) -> Result<String, RepositoryError> {
    serde_json::to_string(value)
        .map_err(|error| RepositoryError::Decode(format!("could not encode `{column}`: {error}")))
}

fn job_from_row(row: SqliteRow) -> Result<IntegrationJob, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = JobStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown job status `{status_raw}`")))?;

    let operation_raw = row.try_get::<String, _>("operation_type")?;
    let operation_type = OperationType::parse(&operation_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown operation type `{operation_raw}`"))
    })?;

    let resource_raw = row.try_get::<String, _>("resource_type")?;
    let resource_type = ResourceType::parse(&resource_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown resource type `{resource_raw}`")))?;

    let payload_raw = row.try_get::<String, _>("payload")?;

    Ok(IntegrationJob {
        id: IntegrationJobId(row.try_get("id")?),
        company_id: CompanyId(row.try_get("company_id")?),
        project_id: row.try_get::<Option<String>, _>("project_id")?.map(ProjectId),
        action_record_id: row
            .try_get::<Option<String>, _>("action_record_id")?
            .map(ActionRecordId),
        operation_type,
        resource_type,
        payload: parse_json("payload", &payload_raw)?,
        status,
        retry_count: parse_u32("retry_count", row.try_get("retry_count")?)?,
        next_retry_at: parse_optional_timestamp("next_retry_at", row.try_get("next_retry_at")?)?,
        claimed_by: row.try_get("claimed_by")?,
        claimed_at: parse_optional_timestamp("claimed_at", row.try_get("claimed_at")?)?,
        processed_at: parse_optional_timestamp("processed_at", row.try_get("processed_at")?)?,
        result: parse_optional_json("result", row.try_get("result")?)?,
        error_message: row.try_get("error_message")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, Utc};
    use serde_json::json;

    use crewflow_core::domain::integration::{
        IntegrationJob, JobStatus, NewIntegrationJob, OperationType, ResourceType,
    };
    use crewflow_core::domain::project::CompanyId;
    use crewflow_core::{IntegrationQueueEngine, JobOutcome};

    use super::SqlIntegrationJobRepository;
    use crate::repositories::test_support::{parse_ts, setup_pool};
    use crate::repositories::IntegrationJobRepository;

    fn job_at(engine: &IntegrationQueueEngine, created_at: DateTime<Utc>) -> IntegrationJob {
        engine.create_job(
            NewIntegrationJob::new(
                CompanyId("acme".to_string()),
                OperationType::Write,
                ResourceType::Project,
                json!({"crm_id": "X123", "next_step": "Inspection"}),
            ),
            created_at,
        )
    }

    #[tokio::test]
    async fn claim_is_fifo_and_exclusive() {
        let pool = setup_pool().await;
        let repo = SqlIntegrationJobRepository::new(pool.clone());
        let engine = IntegrationQueueEngine::new();
        let now = parse_ts("2026-03-02T09:00:00Z");

        let older = job_at(&engine, now - Duration::minutes(10));
        let newer = job_at(&engine, now - Duration::minutes(5));
        repo.enqueue(&newer).await.expect("enqueue newer");
        repo.enqueue(&older).await.expect("enqueue older");

        let first = repo.claim_ready(JobStatus::Pending, 1, "worker-a", now).await.expect("claim");
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id, older.id);
        assert_eq!(first[0].status, JobStatus::Processing);
        assert_eq!(first[0].claimed_by.as_deref(), Some("worker-a"));
        assert_eq!(first[0].claimed_at, Some(now));

        let second =
            repo.claim_ready(JobStatus::Pending, 10, "worker-b", now).await.expect("claim rest");
        assert_eq!(second.iter().map(|job| job.id.clone()).collect::<Vec<_>>(), vec![newer.id]);

        let nothing =
            repo.claim_ready(JobStatus::Pending, 10, "worker-c", now).await.expect("empty claim");
        assert!(nothing.is_empty());

        pool.close().await;
    }

    #[tokio::test]
    async fn retry_jobs_wait_for_their_backoff() {
        let pool = setup_pool().await;
        let repo = SqlIntegrationJobRepository::new(pool.clone());
        let engine = IntegrationQueueEngine::new();
        let now = parse_ts("2026-03-02T09:00:00Z");

        let job = job_at(&engine, now);
        repo.enqueue(&job).await.expect("enqueue");
        let claimed = repo.claim_ready(JobStatus::Pending, 1, "w", now).await.expect("claim");
        let retried = engine
            .apply_outcome(
                claimed[0].clone(),
                JobOutcome::Failed { error: "503 from CRM".to_string(), retry: true },
                now,
            )
            .expect("retry outcome");
        assert!(repo.update_outcome(&claimed[0], &retried).await.expect("persist retry"));

        let early = repo
            .claim_ready(JobStatus::Retry, 10, "w", now + Duration::seconds(30))
            .await
            .expect("early claim");
        assert!(early.is_empty(), "job must not be claimed before next_retry_at");

        let due = repo
            .claim_ready(JobStatus::Retry, 10, "w", now + Duration::minutes(1))
            .await
            .expect("due claim");
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].retry_count, 1);
        assert_eq!(due[0].error_message.as_deref(), Some("503 from CRM"));

        pool.close().await;
    }

    #[tokio::test]
    async fn terminal_jobs_are_not_overwritten() {
        let pool = setup_pool().await;
        let repo = SqlIntegrationJobRepository::new(pool.clone());
        let engine = IntegrationQueueEngine::new();
        let now = parse_ts("2026-03-02T09:00:00Z");

        let job = job_at(&engine, now);
        repo.enqueue(&job).await.expect("enqueue");
        let claimed = repo.claim_ready(JobStatus::Pending, 1, "w", now).await.expect("claim");
        let completed = engine
            .apply_outcome(
                claimed[0].clone(),
                JobOutcome::Completed { result: Some(json!({"crm_status": 200})) },
                now,
            )
            .expect("complete");
        assert!(repo.update_outcome(&claimed[0], &completed).await.expect("persist completion"));

        let mut late_failure = claimed[0].clone();
        late_failure.status = JobStatus::Failed;
        late_failure.error_message = Some("late".to_string());
        assert!(!repo.update_outcome(&claimed[0], &late_failure).await.expect("refused"));

        let stored = repo.find_by_id(&job.id).await.expect("find").expect("exists");
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.result, Some(json!({"crm_status": 200})));
        assert_eq!(stored.processed_at, Some(now));
        assert_eq!(stored.claimed_by, None);

        pool.close().await;
    }

    #[tokio::test]
    async fn outcome_from_a_lost_claim_is_refused() {
        let pool = setup_pool().await;
        let repo = SqlIntegrationJobRepository::new(pool.clone());
        let engine = IntegrationQueueEngine::new();
        let now = parse_ts("2026-03-02T09:00:00Z");

        let job = job_at(&engine, now - Duration::hours(1));
        repo.enqueue(&job).await.expect("enqueue");
        let slow = repo
            .claim_ready(JobStatus::Pending, 1, "worker-a", now - Duration::hours(1))
            .await
            .expect("first claim")
            .remove(0);

        let timed_out = engine
            .apply_outcome(
                slow.clone(),
                JobOutcome::Failed { error: "claim timed out".to_string(), retry: true },
                now - Duration::minutes(5),
            )
            .expect("recover");
        assert!(repo.update_outcome(&slow, &timed_out).await.expect("recover stale claim"));
        let fresh = repo
            .claim_ready(JobStatus::Retry, 1, "worker-b", now)
            .await
            .expect("second claim")
            .remove(0);

        let late = engine
            .apply_outcome(
                slow.clone(),
                JobOutcome::Failed { error: "CRM 503".to_string(), retry: true },
                now,
            )
            .expect("late outcome");
        assert!(!repo.update_outcome(&slow, &late).await.expect("late write refused"));

        let completed = engine
            .apply_outcome(fresh.clone(), JobOutcome::Completed { result: None }, now)
            .expect("complete");
        assert!(repo.update_outcome(&fresh, &completed).await.expect("current claim wins"));
        assert!(!repo.update_outcome(&slow, &late).await.expect("still refused"));

        let stored = repo.find_by_id(&job.id).await.expect("find").expect("exists");
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.retry_count, 1);

        pool.close().await;
    }

    #[tokio::test]
    async fn stale_claims_and_status_listing() {
        let pool = setup_pool().await;
        let repo = SqlIntegrationJobRepository::new(pool.clone());
        let engine = IntegrationQueueEngine::new();
        let now = parse_ts("2026-03-02T09:00:00Z");

        let stale = job_at(&engine, now - Duration::hours(2));
        let fresh = job_at(&engine, now - Duration::minutes(1));
        repo.enqueue(&stale).await.expect("enqueue stale");
        repo.enqueue(&fresh).await.expect("enqueue fresh");

        repo.claim_ready(JobStatus::Pending, 1, "crashed", now - Duration::hours(1))
            .await
            .expect("old claim");
        repo.claim_ready(JobStatus::Pending, 1, "alive", now).await.expect("new claim");

        let stale_claims = repo
            .list_stale_claims(engine.claim_deadline(now), 10)
            .await
            .expect("stale claims");
        assert_eq!(stale_claims.len(), 1);
        assert_eq!(stale_claims[0].id, stale.id);
        assert_eq!(stale_claims[0].claimed_by.as_deref(), Some("crashed"));

        let processing =
            repo.list_by_status(JobStatus::Processing, 10).await.expect("processing jobs");
        assert_eq!(processing.len(), 2);
        assert!(repo.list_by_status(JobStatus::Pending, 10).await.expect("pending").is_empty());

        pool.close().await;
    }
}
