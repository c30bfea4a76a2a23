use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crewflow_core::domain::project::Project;
use crewflow_core::domain::prompt::{PromptRunId, PromptType};
use crewflow_core::{PromptVariables, WebhookEnvelope};
use crewflow_db::repositories::{ProjectRepository, RepositoryError};

use crate::prompt_runs::{PromptRequest, PromptRunError, PromptRunner};

#[derive(Debug, Error)]
pub enum SummaryError {
    #[error(transparent)]
    Prompt(#[from] PromptRunError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

#[derive(Clone, Debug)]
pub struct SummaryOutcome {
    pub project: Project,
    pub prompt_type: PromptType,
    pub run_id: Option<PromptRunId>,
    /// `false` when the AI step failed or answered with nothing; the previous
    /// summary is kept in that case.
    pub updated: bool,
}

pub struct SummaryService {
    runner: PromptRunner,
    projects: Arc<dyn ProjectRepository>,
}

impl SummaryService {
    pub fn new(runner: PromptRunner, projects: Arc<dyn ProjectRepository>) -> Self {
        Self { runner, projects }
    }

    pub async fn refresh(
        &self,
        mut project: Project,
        envelope: &WebhookEnvelope,
        correlation_id: &str,
        now: DateTime<Utc>,
    ) -> Result<SummaryOutcome, SummaryError> {
        let prompt_type = if project.has_summary() {
            PromptType::SummaryUpdate
        } else {
            PromptType::SummaryGeneration
        };

        let execution = self
            .runner
            .run(PromptRequest {
                prompt_type,
                variables: summary_variables(&project, envelope, now),
                project_id: Some(project.id.clone()),
                initiated_by: Some("webhook".to_string()),
            })
            .await?;

        let summary = execution.output().map(str::trim).filter(|text| !text.is_empty());
        let updated = match summary {
            Some(summary) => {
                self.projects.update_summary(&project.id, summary, now).await?;
                project.summary = summary.to_string();
                project.updated_at = now;
                info!(
                    event_name = "pipeline.summary.updated",
                    correlation_id,
                    project_id = %project.id,
                    prompt_type = prompt_type.as_str(),
                    "project summary refreshed"
                );
                true
            }
            None => {
                warn!(
                    event_name = "pipeline.summary.skipped",
                    correlation_id,
                    project_id = %project.id,
                    prompt_type = prompt_type.as_str(),
                    "summary step produced no output; keeping previous summary"
                );
                false
            }
        };

        Ok(SummaryOutcome { project, prompt_type, run_id: execution.run_id, updated })
    }
}

fn summary_variables(
    project: &Project,
    envelope: &WebhookEnvelope,
    now: DateTime<Utc>,
) -> PromptVariables {
    let event_data = match &envelope.data {
        Value::Null => String::new(),
        data => serde_json::to_string_pretty(data).unwrap_or_default(),
    };
    let mut variables = PromptVariables::new()
        .with("company_id", project.company_id.0.clone())
        .with("crm_id", project.crm_id.clone())
        .with("previous_summary", project.summary.clone())
        .with("event_type", envelope.event_type_or_default().to_string())
        .with("event_data", event_data)
        .with("current_date", now.format("%Y-%m-%d").to_string());
    variables.set_text("project_name", project.name.as_deref());
    variables.set_text("next_step", project.next_step.as_deref());
    variables.set_text("track_name", project.project_track.as_deref());
    variables
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use chrono::Duration;

    use crewflow_core::domain::project::CompanyId;
    use crewflow_core::domain::prompt::{PromptRunStatus, PromptType};
    use crewflow_core::WebhookEnvelope;
    use crewflow_db::repositories::{ProjectRepository, SqlProjectRepository};

    use crate::llm::ScriptedLlmClient;
    use crate::test_support::{find_run, parse_ts, prompt_runner, seed_project, setup_pool};

    use super::SummaryService;

    fn envelope(crm_id: &str) -> WebhookEnvelope {
        WebhookEnvelope {
            company_id: CompanyId("acme".to_string()),
            crm_id: crm_id.to_string(),
            event_type: Some("stage.changed".to_string()),
            name: None,
            next_step: Some("Rough-in inspection".to_string()),
            project_track: None,
            data: json!({"inspector": "City of Springfield"}),
        }
    }

    #[tokio::test]
    async fn empty_summary_is_generated_then_updated() {
        let pool = setup_pool().await;
        let project = seed_project(&pool, "X123").await;
        let projects = Arc::new(SqlProjectRepository::new(pool.clone()));
        let llm = Arc::new(ScriptedLlmClient::replying([
            "  Framing done; rough-in inspection next.  ",
            "Rough-in passed; insulation next.",
        ]));
        let service = SummaryService::new(prompt_runner(&pool, llm.clone()), projects.clone());
        let now = parse_ts("2026-03-02T09:00:00Z");

        let first = service.refresh(project, &envelope("X123"), "corr-1", now).await.expect("first");
        assert_eq!(first.prompt_type, PromptType::SummaryGeneration);
        assert!(first.updated);
        assert_eq!(first.project.summary, "Framing done; rough-in inspection next.");

        let second =
            service.refresh(first.project, &envelope("X123"), "corr-2", now).await.expect("second");
        assert_eq!(second.prompt_type, PromptType::SummaryUpdate);
        assert!(llm.prompts()[1].contains("Framing done; rough-in inspection next."));

        let stored = projects.find_by_id(&second.project.id).await.expect("find").expect("exists");
        assert_eq!(stored.summary, "Rough-in passed; insulation next.");

        pool.close().await;
    }

    #[tokio::test]
    async fn ai_failure_keeps_previous_summary() {
        let pool = setup_pool().await;
        let mut project = seed_project(&pool, "X123").await;
        let projects = Arc::new(SqlProjectRepository::new(pool.clone()));
        project.summary = "Waiting on permit.".to_string();
        projects
            .update_summary(&project.id, &project.summary, parse_ts("2026-03-01T09:00:00Z"))
            .await
            .expect("seed summary");

        let llm = Arc::new(ScriptedLlmClient::new([Err("rate limited".to_string())]));
        let service = SummaryService::new(prompt_runner(&pool, llm), projects.clone());
        let outcome = service
            .refresh(project, &envelope("X123"), "corr-1", parse_ts("2026-03-02T09:00:00Z"))
            .await
            .expect("refresh");

        assert!(!outcome.updated);
        assert_eq!(outcome.project.summary, "Waiting on permit.");
        let run = find_run(&pool, outcome.run_id.as_ref().expect("tracked")).await;
        assert_eq!(run.status, PromptRunStatus::Error);

        pool.close().await;
    }

    #[tokio::test]
    async fn summary_write_keeps_a_check_date_scheduled_meanwhile() {
        let pool = setup_pool().await;
        let snapshot = seed_project(&pool, "X123").await;
        let projects = Arc::new(SqlProjectRepository::new(pool.clone()));
        let now = parse_ts("2026-03-02T09:00:00Z");
        let check = now + Duration::days(3);
        projects.set_next_check_date(&snapshot.id, Some(check), now).await.expect("schedule");

        let llm = Arc::new(ScriptedLlmClient::replying(["Cabinets on order."]));
        let service = SummaryService::new(prompt_runner(&pool, llm), projects.clone());
        let outcome =
            service.refresh(snapshot, &envelope("X123"), "corr-1", now).await.expect("refresh");
        assert!(outcome.updated);

        let stored = projects.find_by_id(&outcome.project.id).await.expect("find").expect("exists");
        assert_eq!(stored.summary, "Cabinets on order.");
        assert_eq!(stored.next_check_date, Some(check));

        pool.close().await;
    }
}
