//! Prompt Run Engine
//!
//! Every AI invocation is logged as a `PENDING` run before the call and
//! finalized exactly once afterwards. Tracking is best-effort: a failure to
//! write the run never prevents the AI call itself.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{error, info, warn};

use crewflow_core::domain::project::ProjectId;
use crewflow_core::domain::prompt::{NewPromptRun, PromptRun, PromptRunId, PromptRunResult, PromptType};
use crewflow_core::template::{decision_contract, default_template, render_prompt};
use crewflow_core::PromptVariables;
use crewflow_db::repositories::{PromptRunRepository, RepositoryError, WorkflowPromptRepository};

use crate::llm::LlmClient;

#[derive(Debug, Error)]
pub enum PromptRunError {
    #[error("workflow prompt lookup failed: {0}")]
    Repository(#[from] RepositoryError),
}

#[derive(Clone)]
pub struct PromptRunService {
    runs: Arc<dyn PromptRunRepository>,
}

impl PromptRunService {
    pub fn new(runs: Arc<dyn PromptRunRepository>) -> Self {
        Self { runs }
    }

    /// Opens a `PENDING` run. Returns `None` when the run could not be stored;
    /// callers carry on without tracking.
    pub async fn log_prompt_run(&self, new_run: NewPromptRun) -> Option<PromptRunId> {
        let run = PromptRun::pending(new_run, Utc::now());

        match self.runs.insert(&run).await {
            Ok(()) => {
                info!(
                    event_name = "prompt_run.created",
                    prompt_run_id = %run.id,
                    project_id = run.project_id.as_ref().map(|id| id.0.as_str()).unwrap_or("none"),
                    ai_provider = %run.ai_provider,
                    ai_model = %run.ai_model,
                    "prompt run logged"
                );
                Some(run.id)
            }
            Err(repo_error) => {
                error!(
                    event_name = "prompt_run.create_failed",
                    error = %repo_error,
                    "prompt run could not be logged; continuing without tracking"
                );
                None
            }
        }
    }

    /// Performs the single `PENDING -> COMPLETED | ERROR` transition. Returns
    /// whether the run transitioned; a run that was already terminal is logged
    /// and left untouched.
    pub async fn update_prompt_run_with_result(
        &self,
        run_id: &PromptRunId,
        result: PromptRunResult,
    ) -> bool {
        let status = result.status();
        match self.runs.finalize(run_id, &result, Utc::now()).await {
            Ok(true) => {
                info!(
                    event_name = "prompt_run.finalized",
                    prompt_run_id = %run_id,
                    status = status.as_str(),
                    "prompt run finalized"
                );
                true
            }
            Ok(false) => {
                warn!(
                    event_name = "prompt_run.finalize_rejected",
                    prompt_run_id = %run_id,
                    status = status.as_str(),
                    "prompt run is missing or already terminal; result not recorded"
                );
                false
            }
            Err(repo_error) => {
                error!(
                    event_name = "prompt_run.finalize_failed",
                    prompt_run_id = %run_id,
                    error = %repo_error,
                    "prompt run result could not be stored"
                );
                false
            }
        }
    }

    pub async fn find(&self, run_id: &PromptRunId) -> Result<Option<PromptRun>, RepositoryError> {
        self.runs.find_by_id(run_id).await
    }

    pub async fn list_for_project(
        &self,
        project_id: &ProjectId,
    ) -> Result<Vec<PromptRun>, RepositoryError> {
        self.runs.list_for_project(project_id).await
    }
}

#[derive(Clone, Debug)]
pub struct PromptRequest {
    pub prompt_type: PromptType,
    pub variables: PromptVariables,
    pub project_id: Option<ProjectId>,
    pub initiated_by: Option<String>,
}

/// Result of one tracked invocation. `run_id` is `None` when tracking failed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PromptExecution {
    pub run_id: Option<PromptRunId>,
    pub result: PromptRunResult,
}

impl PromptExecution {
    pub fn output(&self) -> Option<&str> {
        match &self.result {
            PromptRunResult::Output(output) => Some(output),
            PromptRunResult::Error(_) => None,
        }
    }
}

/// Template lookup, rendering, run logging, and the AI call in one step.
#[derive(Clone)]
pub struct PromptRunner {
    prompts: Arc<dyn WorkflowPromptRepository>,
    runs: PromptRunService,
    llm: Arc<dyn LlmClient>,
}

impl PromptRunner {
    pub fn new(
        prompts: Arc<dyn WorkflowPromptRepository>,
        runs: PromptRunService,
        llm: Arc<dyn LlmClient>,
    ) -> Self {
        Self { prompts, runs, llm }
    }

    pub fn runs(&self) -> &PromptRunService {
        &self.runs
    }

    pub async fn run(&self, request: PromptRequest) -> Result<PromptExecution, PromptRunError> {
        let stored = self.prompts.latest_by_type(request.prompt_type).await?;
        let (workflow_prompt_id, template) = match stored {
            Some(prompt) => (Some(prompt.id), prompt.prompt_text),
            None => (None, default_template(request.prompt_type).to_string()),
        };

        let rendered = render_prompt(&template, &request.variables).map(|mut prompt_input| {
            if is_decision_prompt(request.prompt_type) {
                prompt_input.push_str("\n\n");
                prompt_input.push_str(decision_contract());
            }
            prompt_input
        });

        let run_id = self
            .runs
            .log_prompt_run(NewPromptRun {
                project_id: request.project_id,
                workflow_prompt_id,
                prompt_input: rendered.as_ref().map_or_else(|_| template.clone(), |input| input.clone()),
                ai_provider: self.llm.provider().to_string(),
                ai_model: self.llm.model().to_string(),
                initiated_by: request.initiated_by,
            })
            .await;

        // A template that does not render is recorded as a failed run and never
        // reaches the model.
        let prompt_input = match rendered {
            Ok(prompt_input) => prompt_input,
            Err(template_error) => {
                error!(
                    event_name = "prompt_run.render_failed",
                    prompt_type = request.prompt_type.as_str(),
                    error = %template_error,
                    "workflow prompt could not be rendered"
                );
                let result = PromptRunResult::Error(template_error.to_string());
                if let Some(run_id) = &run_id {
                    self.runs.update_prompt_run_with_result(run_id, result.clone()).await;
                }
                return Ok(PromptExecution { run_id, result });
            }
        };

        let result = match self.llm.complete(&prompt_input).await {
            Ok(output) => PromptRunResult::Output(output),
            Err(llm_error) => {
                warn!(
                    event_name = "prompt_run.ai_failed",
                    prompt_type = request.prompt_type.as_str(),
                    error = %llm_error,
                    "ai invocation failed"
                );
                PromptRunResult::Error(format!("{llm_error:#}"))
            }
        };

        if let Some(run_id) = &run_id {
            self.runs.update_prompt_run_with_result(run_id, result.clone()).await;
        }

        Ok(PromptExecution { run_id, result })
    }
}

fn is_decision_prompt(prompt_type: PromptType) -> bool {
    matches!(prompt_type, PromptType::ActionDetection | PromptType::ActionDetectionExecution)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;

    use crewflow_core::domain::prompt::{
        NewPromptRun, PromptRunResult, PromptRunStatus, PromptType, WorkflowPrompt,
        WorkflowPromptId,
    };
    use crewflow_core::PromptVariables;
    use crewflow_db::repositories::{
        SqlPromptRunRepository, SqlWorkflowPromptRepository, WorkflowPromptRepository,
    };

    use super::{PromptRequest, PromptRunService, PromptRunner};
    use crate::llm::ScriptedLlmClient;
    use crate::test_support::setup_pool;

    fn new_run() -> NewPromptRun {
        NewPromptRun {
            project_id: None,
            workflow_prompt_id: None,
            prompt_input: "hello".to_string(),
            ai_provider: "scripted".to_string(),
            ai_model: "scripted-model".to_string(),
            initiated_by: None,
        }
    }

    #[tokio::test]
    async fn run_is_finalized_exactly_once() {
        let pool = setup_pool().await;
        let service = PromptRunService::new(Arc::new(SqlPromptRunRepository::new(pool.clone())));

        let run_id = service.log_prompt_run(new_run()).await.expect("run logged");
        assert!(
            service
                .update_prompt_run_with_result(&run_id, PromptRunResult::Output("ok".to_string()))
                .await
        );
        assert!(
            !service
                .update_prompt_run_with_result(&run_id, PromptRunResult::Error("late".to_string()))
                .await
        );

        let run = service.find(&run_id).await.expect("find").expect("exists");
        assert_eq!(run.status, PromptRunStatus::Completed);
        assert_eq!(run.prompt_output.as_deref(), Some("ok"));
        assert_eq!(run.error_message, None);
        assert!(run.completed_at.is_some());

        pool.close().await;
    }

    #[tokio::test]
    async fn logging_failure_returns_no_id() {
        let pool = setup_pool().await;
        let service = PromptRunService::new(Arc::new(SqlPromptRunRepository::new(pool.clone())));
        pool.close().await;

        assert_eq!(service.log_prompt_run(new_run()).await, None);
    }

    #[tokio::test]
    async fn runner_prefers_stored_prompt_and_records_output() {
        let pool = setup_pool().await;
        let prompts = Arc::new(SqlWorkflowPromptRepository::new(pool.clone()));
        prompts
            .save(WorkflowPrompt {
                id: WorkflowPromptId("WP-1".to_string()),
                prompt_type: PromptType::SummaryGeneration,
                name: "summary v1".to_string(),
                prompt_text: "Summarize {{ project_name }} at {{ next_step }}".to_string(),
                created_at: Utc::now(),
            })
            .await
            .expect("save prompt");
        let llm = Arc::new(ScriptedLlmClient::replying(["Framing is underway."]));
        let runner = PromptRunner::new(
            prompts,
            PromptRunService::new(Arc::new(SqlPromptRunRepository::new(pool.clone()))),
            llm.clone(),
        );

        let execution = runner
            .run(PromptRequest {
                prompt_type: PromptType::SummaryGeneration,
                variables: PromptVariables::new()
                    .with("project_name", "Kitchen remodel")
                    .with("next_step", "Framing"),
                project_id: None,
                initiated_by: Some("test".to_string()),
            })
            .await
            .expect("run");

        assert_eq!(execution.output(), Some("Framing is underway."));
        assert_eq!(llm.prompts(), vec!["Summarize Kitchen remodel at Framing"]);

        let run_id = execution.run_id.expect("tracked");
        let run = runner.runs().find(&run_id).await.expect("find").expect("exists");
        assert_eq!(run.workflow_prompt_id, Some(WorkflowPromptId("WP-1".to_string())));
        assert_eq!(run.prompt_input, "Summarize Kitchen remodel at Framing");
        assert_eq!(run.ai_provider, "scripted");
        assert_eq!(run.initiated_by.as_deref(), Some("test"));

        pool.close().await;
    }

    #[tokio::test]
    async fn ai_failure_is_recorded_as_error_run() {
        let pool = setup_pool().await;
        let runner = PromptRunner::new(
            Arc::new(SqlWorkflowPromptRepository::new(pool.clone())),
            PromptRunService::new(Arc::new(SqlPromptRunRepository::new(pool.clone()))),
            Arc::new(ScriptedLlmClient::new([Err("provider timeout".to_string())])),
        );

        let execution = runner
            .run(PromptRequest {
                prompt_type: PromptType::ActionDetectionExecution,
                variables: PromptVariables::new().with("summary", "Waiting on permit"),
                project_id: None,
                initiated_by: None,
            })
            .await
            .expect("run");

        assert_eq!(execution.result, PromptRunResult::Error("provider timeout".to_string()));
        let run = runner
            .runs()
            .find(execution.run_id.as_ref().expect("tracked"))
            .await
            .expect("find")
            .expect("exists");
        assert_eq!(run.status, PromptRunStatus::Error);
        assert_eq!(run.prompt_output, None);
        assert_eq!(run.workflow_prompt_id, None);
        assert!(run.prompt_input.contains("Waiting on permit"));
        assert!(run.prompt_input.contains("NO_ACTION"), "decision contract is appended");

        pool.close().await;
    }

    #[tokio::test]
    async fn unrenderable_stored_prompt_is_an_error_run_without_ai_call() {
        let pool = setup_pool().await;
        let prompts = Arc::new(SqlWorkflowPromptRepository::new(pool.clone()));
        prompts
            .save(WorkflowPrompt {
                id: WorkflowPromptId("WP-2".to_string()),
                prompt_type: PromptType::ActionDetectionExecution,
                name: "detection v2".to_string(),
                prompt_text: "Check {{ milestone_instructions }} for {{ project_name }}".to_string(),
                created_at: Utc::now(),
            })
            .await
            .expect("save prompt");
        let llm = Arc::new(ScriptedLlmClient::replying(["unused"]));
        let runner = PromptRunner::new(
            prompts,
            PromptRunService::new(Arc::new(SqlPromptRunRepository::new(pool.clone()))),
            llm.clone(),
        );

        let execution = runner
            .run(PromptRequest {
                prompt_type: PromptType::ActionDetectionExecution,
                variables: PromptVariables::new().with("project_name", "Kitchen remodel"),
                project_id: None,
                initiated_by: None,
            })
            .await
            .expect("render failure is not an error");

        let PromptRunResult::Error(message) = &execution.result else {
            panic!("expected an error result");
        };
        assert!(message.contains("milestone_instructions"));
        assert!(llm.prompts().is_empty());

        let run = runner
            .runs()
            .find(execution.run_id.as_ref().expect("tracked"))
            .await
            .expect("find")
            .expect("exists");
        assert_eq!(run.status, PromptRunStatus::Error);
        assert_eq!(run.workflow_prompt_id, Some(WorkflowPromptId("WP-2".to_string())));
        assert!(run.prompt_input.contains("{{ milestone_instructions }}"));

        pool.close().await;
    }
}
