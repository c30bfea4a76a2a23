use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use crewflow_core::domain::project::{CompanyId, Project, ProjectAttributes, ProjectId};

use super::{
    encode_optional_timestamp, encode_timestamp, parse_optional_timestamp, parse_timestamp,
    ProjectRepository, RepositoryError,
};
use crate::DbPool;

const PROJECT_COLUMNS: &str = "id, company_id, crm_id, name, summary, next_step, project_track,
     next_check_date, created_at, updated_at";

pub struct SqlProjectRepository {
    pool: DbPool,
}

impl SqlProjectRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ProjectRepository for SqlProjectRepository {
    async fn find_by_id(&self, id: &ProjectId) -> Result<Option<Project>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(project_from_row).transpose()
    }

    async fn find_by_crm_id(
        &self,
        company_id: &CompanyId,
        crm_id: &str,
    ) -> Result<Option<Project>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {PROJECT_COLUMNS} FROM projects WHERE company_id = ? AND crm_id = ?"
        ))
        .bind(&company_id.0)
        .bind(crm_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(project_from_row).transpose()
    }

    async fn upsert_by_crm_id(
        &self,
        company_id: &CompanyId,
        crm_id: &str,
        attributes: ProjectAttributes,
        now: DateTime<Utc>,
    ) -> Result<(Project, bool), RepositoryError> {
        let candidate = Project::new(company_id.clone(), crm_id, attributes, now);

        // Single statement so concurrent webhooks for the same CRM record converge
        // on one row; the returned id tells us whether our insert won.
        let row = sqlx::query(&format!(
            "INSERT INTO projects (
                id, company_id, crm_id, name, summary, next_step, project_track,
                next_check_date, created_at, updated_at
             ) VALUES (?, ?, ?, ?, '', ?, ?, NULL, ?, ?)
             ON CONFLICT(company_id, crm_id) DO UPDATE SET
                name = COALESCE(excluded.name, projects.name),
                next_step = COALESCE(excluded.next_step, projects.next_step),
                project_track = COALESCE(excluded.project_track, projects.project_track),
                updated_at = excluded.updated_at
             RETURNING {PROJECT_COLUMNS}"
        ))
        .bind(&candidate.id.0)
        .bind(&candidate.company_id.0)
        .bind(&candidate.crm_id)
        .bind(candidate.name.as_deref())
        .bind(candidate.next_step.as_deref())
        .bind(candidate.project_track.as_deref())
        .bind(encode_timestamp(now))
        .bind(encode_timestamp(now))
        .fetch_one(&self.pool)
        .await?;

        let project = project_from_row(row)?;
        let created = project.id == candidate.id;
        Ok((project, created))
    }

    async fn update_summary(
        &self,
        id: &ProjectId,
        summary: &str,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE projects SET summary = ?, updated_at = ? WHERE id = ?")
            .bind(summary)
            .bind(encode_timestamp(now))
            .bind(&id.0)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound { entity: "project", id: id.0.clone() });
        }
        Ok(())
    }

    async fn update_next_step(
        &self,
        id: &ProjectId,
        next_step: &str,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE projects SET next_step = ?, updated_at = ? WHERE id = ?")
            .bind(next_step)
            .bind(encode_timestamp(now))
            .bind(&id.0)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound { entity: "project", id: id.0.clone() });
        }
        Ok(())
    }

    async fn set_next_check_date(
        &self,
        id: &ProjectId,
        next_check_date: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let result =
            sqlx::query("UPDATE projects SET next_check_date = ?, updated_at = ? WHERE id = ?")
                .bind(encode_optional_timestamp(next_check_date))
                .bind(encode_timestamp(now))
                .bind(&id.0)
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound { entity: "project", id: id.0.clone() });
        }
        Ok(())
    }

    async fn claim_due_for_check(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Project>, RepositoryError> {
        // Clearing the date is the claim: a project comes back from at most one
        // overlapping sweep.
        let rows = sqlx::query(&format!(
            "UPDATE projects
             SET next_check_date = NULL, updated_at = ?
             WHERE id IN (
                SELECT id FROM projects
                WHERE next_check_date IS NOT NULL AND next_check_date <= ?
                ORDER BY next_check_date ASC, id ASC
                LIMIT ?
             )
             AND next_check_date IS NOT NULL AND next_check_date <= ?
             RETURNING {PROJECT_COLUMNS}"
        ))
        .bind(encode_timestamp(now))
        .bind(encode_timestamp(now))
        .bind(i64::from(limit))
        .bind(encode_timestamp(now))
        .fetch_all(&self.pool)
        .await?;

        let mut projects = rows.into_iter().map(project_from_row).collect::<Result<Vec<_>, _>>()?;
        projects.sort_by(|left, right| left.id.0.cmp(&right.id.0));
        Ok(projects)
    }
}

fn project_from_row(row: SqliteRow) -> Result<Project, RepositoryError> {
    Ok(Project {
        id: ProjectId(row.try_get("id")?),
        company_id: CompanyId(row.try_get("company_id")?),
        crm_id: row.try_get("crm_id")?,
        name: row.try_get("name")?,
        summary: row.try_get("summary")?,
        next_step: row.try_get("next_step")?,
        project_track: row.try_get("project_track")?,
        next_check_date: parse_optional_timestamp(
            "next_check_date",
            row.try_get("next_check_date")?,
        )?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use crewflow_core::domain::project::{CompanyId, ProjectAttributes, ProjectId};

    use super::SqlProjectRepository;
    use crate::repositories::test_support::{parse_ts, setup_pool};
    use crate::repositories::{ProjectRepository, RepositoryError};

    fn acme() -> CompanyId {
        CompanyId("acme".to_string())
    }

    #[tokio::test]
    async fn upsert_creates_once_then_updates_in_place() {
        let pool = setup_pool().await;
        let repo = SqlProjectRepository::new(pool.clone());
        let now = parse_ts("2026-03-02T09:00:00Z");

        let (first, created) = repo
            .upsert_by_crm_id(
                &acme(),
                "X123",
                ProjectAttributes {
                    name: Some("Kitchen remodel".to_string()),
                    next_step: Some("Design".to_string()),
                    project_track: None,
                },
                now,
            )
            .await
            .expect("first upsert");
        assert!(created);
        assert_eq!(first.summary, "");

        let later = now + Duration::hours(2);
        let (second, created_again) = repo
            .upsert_by_crm_id(
                &acme(),
                "X123",
                ProjectAttributes { next_step: Some("Permitting".to_string()), ..Default::default() },
                later,
            )
            .await
            .expect("second upsert");

        assert!(!created_again);
        assert_eq!(second.id, first.id);
        assert_eq!(second.name.as_deref(), Some("Kitchen remodel"));
        assert_eq!(second.next_step.as_deref(), Some("Permitting"));
        assert_eq!(second.created_at, now);
        assert_eq!(second.updated_at, later);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM projects WHERE crm_id = 'X123'")
            .fetch_one(&pool)
            .await
            .expect("count");
        assert_eq!(count, 1);

        pool.close().await;
    }

    #[tokio::test]
    async fn same_crm_id_in_another_company_is_a_different_project() {
        let pool = setup_pool().await;
        let repo = SqlProjectRepository::new(pool.clone());
        let now = parse_ts("2026-03-02T09:00:00Z");

        let (acme_project, _) = repo
            .upsert_by_crm_id(&acme(), "X1", ProjectAttributes::default(), now)
            .await
            .expect("acme");
        let (other_project, created) = repo
            .upsert_by_crm_id(&CompanyId("globex".to_string()), "X1", Default::default(), now)
            .await
            .expect("globex");

        assert!(created);
        assert_ne!(acme_project.id, other_project.id);
        let found = repo.find_by_crm_id(&acme(), "X1").await.expect("find");
        assert_eq!(found.map(|project| project.id), Some(acme_project.id));

        pool.close().await;
    }

    #[tokio::test]
    async fn targeted_updates_leave_the_check_date_alone() {
        let pool = setup_pool().await;
        let repo = SqlProjectRepository::new(pool.clone());
        let now = parse_ts("2026-03-02T09:00:00Z");

        let (project, _) =
            repo.upsert_by_crm_id(&acme(), "X9", Default::default(), now).await.expect("upsert");
        let check = now + Duration::days(3);
        repo.set_next_check_date(&project.id, Some(check), now).await.expect("schedule");

        let later = now + Duration::minutes(5);
        repo.update_summary(&project.id, "Framing done; waiting on inspection.", later)
            .await
            .expect("summary");
        repo.update_next_step(&project.id, "Inspection", later).await.expect("next step");

        let found = repo.find_by_id(&project.id).await.expect("find").expect("exists");
        assert_eq!(found.summary, "Framing done; waiting on inspection.");
        assert_eq!(found.next_step.as_deref(), Some("Inspection"));
        assert_eq!(found.next_check_date, Some(check));
        assert_eq!(found.updated_at, later);

        let missing = repo
            .update_summary(&ProjectId("PRJ-missing".to_string()), "x", later)
            .await
            .expect_err("missing project");
        assert!(matches!(missing, RepositoryError::NotFound { entity: "project", .. }));

        pool.close().await;
    }

    #[tokio::test]
    async fn due_projects_are_claimed_once() {
        let pool = setup_pool().await;
        let repo = SqlProjectRepository::new(pool.clone());
        let now = parse_ts("2026-03-02T09:00:00Z");

        let (due, _) =
            repo.upsert_by_crm_id(&acme(), "DUE", Default::default(), now).await.expect("due");
        let (future, _) =
            repo.upsert_by_crm_id(&acme(), "LATER", Default::default(), now).await.expect("later");
        let (cleared, _) =
            repo.upsert_by_crm_id(&acme(), "CLEARED", Default::default(), now).await.expect("c");

        repo.set_next_check_date(&due.id, Some(now - Duration::minutes(5)), now).await.expect("set");
        repo.set_next_check_date(&future.id, Some(now + Duration::days(1)), now).await.expect("set");
        repo.set_next_check_date(&cleared.id, Some(now - Duration::days(1)), now).await.expect("set");
        repo.set_next_check_date(&cleared.id, None, now).await.expect("clear");

        let claimed = repo.claim_due_for_check(now, 10).await.expect("claim due");
        let ids: Vec<ProjectId> = claimed.iter().map(|project| project.id.clone()).collect();
        assert_eq!(ids, vec![due.id.clone()]);
        assert_eq!(claimed[0].next_check_date, None);

        assert!(repo.claim_due_for_check(now, 10).await.expect("second claim").is_empty());
        let untouched = repo.find_by_id(&future.id).await.expect("find").expect("exists");
        assert_eq!(untouched.next_check_date, Some(now + Duration::days(1)));

        pool.close().await;
    }

    #[tokio::test]
    async fn setting_check_date_on_unknown_project_is_not_found() {
        let pool = setup_pool().await;
        let repo = SqlProjectRepository::new(pool.clone());

        let error = repo
            .set_next_check_date(
                &ProjectId("PRJ-missing".to_string()),
                None,
                parse_ts("2026-03-02T09:00:00Z"),
            )
            .await
            .expect_err("missing project");

        assert!(matches!(error, RepositoryError::NotFound { entity: "project", .. }));
        pool.close().await;
    }
}
