//! Action Detection Service
//!
//! Renders the decision prompt for a project, runs it through the Prompt Run
//! Engine, and turns the parsed decision into exactly one outcome. Anything
//! the model says that cannot be parsed is treated as `NO_ACTION`; the raw
//! output stays on the prompt run for audit.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use crewflow_core::config::DetectionConfig;
use crewflow_core::domain::action::{
    ActionPayload, ActionRecord, HumanReviewPayload, ReminderPayload,
};
use crewflow_core::domain::project::Project;
use crewflow_core::domain::prompt::{PromptRunId, PromptRunResult, PromptType};
use crewflow_core::{parse_decision, Decision, DecisionKind, PromptVariables};
use crewflow_db::repositories::{ActionRecordRepository, RepositoryError};

use crate::integrations::KnowledgeBase;
use crate::prompt_runs::{PromptRequest, PromptRunError, PromptRunner};
use crate::reminders::{ReminderError, ReminderScheduler};

/// Knowledge-base lookups allowed per detection before a further request is
/// downgraded to `NO_ACTION`.
pub const MAX_KNOWLEDGE_BASE_QUERIES: usize = 1;

#[derive(Debug, Error)]
pub enum DetectionError {
    #[error(transparent)]
    Prompt(#[from] PromptRunError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Reminder(#[from] ReminderError),
}

#[derive(Clone, Debug, Default)]
pub struct DetectionContext {
    pub is_reminder_check: bool,
    pub initiated_by: Option<String>,
    pub correlation_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DetectionOutcome {
    NoAction { reason: Option<String> },
    ActionNeeded { record: ActionRecord },
    SetFutureReminder { next_check_date: DateTime<Utc>, record: ActionRecord },
    RequestHumanReview { record: ActionRecord },
}

impl DetectionOutcome {
    pub fn kind(&self) -> DecisionKind {
        match self {
            Self::NoAction { .. } => DecisionKind::NoAction,
            Self::ActionNeeded { .. } => DecisionKind::ActionNeeded,
            Self::SetFutureReminder { .. } => DecisionKind::SetFutureReminder,
            Self::RequestHumanReview { .. } => DecisionKind::RequestHumanReview,
        }
    }

    pub fn action_record(&self) -> Option<&ActionRecord> {
        match self {
            Self::NoAction { .. } => None,
            Self::ActionNeeded { record }
            | Self::SetFutureReminder { record, .. }
            | Self::RequestHumanReview { record } => Some(record),
        }
    }

    fn no_action(reason: impl Into<String>) -> Self {
        Self::NoAction { reason: Some(reason.into()) }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DetectionReport {
    pub outcome: DetectionOutcome,
    /// Every run made for this detection, including a knowledge-base round.
    pub prompt_run_ids: Vec<PromptRunId>,
}

pub struct ActionDetectionService {
    runner: PromptRunner,
    actions: Arc<dyn ActionRecordRepository>,
    reminders: ReminderScheduler,
    knowledge_base: Option<Arc<dyn KnowledgeBase>>,
    config: DetectionConfig,
}

impl ActionDetectionService {
    pub fn new(
        runner: PromptRunner,
        actions: Arc<dyn ActionRecordRepository>,
        reminders: ReminderScheduler,
        knowledge_base: Option<Arc<dyn KnowledgeBase>>,
        config: DetectionConfig,
    ) -> Self {
        Self { runner, actions, reminders, knowledge_base, config }
    }

    pub async fn detect(
        &self,
        project: &Project,
        context: &DetectionContext,
        now: DateTime<Utc>,
    ) -> Result<DetectionReport, DetectionError> {
        let correlation_id = context.correlation_id.as_deref().unwrap_or("none");
        let mut prompt_run_ids = Vec::new();
        let mut knowledge_base_context: Option<String> = None;
        let mut queries_made = 0;

        let (decision, run_id) = loop {
            let execution = self
                .runner
                .run(PromptRequest {
                    prompt_type: PromptType::ActionDetectionExecution,
                    variables: detection_variables(
                        project,
                        context,
                        knowledge_base_context.as_deref(),
                        now,
                    ),
                    project_id: Some(project.id.clone()),
                    initiated_by: context.initiated_by.clone(),
                })
                .await?;
            prompt_run_ids.extend(execution.run_id.clone());

            let raw = match &execution.result {
                PromptRunResult::Output(output) => output,
                PromptRunResult::Error(message) => {
                    warn!(
                        event_name = "pipeline.detection.prompt_failed",
                        correlation_id,
                        project_id = %project.id,
                        error = %message,
                        "detection prompt failed; treating as NO_ACTION"
                    );
                    return Ok(DetectionReport {
                        outcome: DetectionOutcome::no_action(format!("prompt run failed: {message}")),
                        prompt_run_ids,
                    });
                }
            };

            let decision = match parse_decision(raw) {
                Ok(decision) => decision,
                Err(parse_error) => {
                    warn!(
                        event_name = "pipeline.detection.unparseable",
                        correlation_id,
                        project_id = %project.id,
                        prompt_run_id = execution.run_id.as_ref().map(|id| id.0.as_str()).unwrap_or("none"),
                        error = %parse_error,
                        "ai decision could not be parsed; treating as NO_ACTION"
                    );
                    return Ok(DetectionReport {
                        outcome: DetectionOutcome::no_action(format!(
                            "unparseable decision: {parse_error}"
                        )),
                        prompt_run_ids,
                    });
                }
            };

            let query = match decision {
                Decision::QueryKnowledgeBase { query } => query,
                other => break (other, execution.run_id),
            };

            if queries_made >= MAX_KNOWLEDGE_BASE_QUERIES {
                warn!(
                    event_name = "pipeline.detection.requery_limit",
                    correlation_id,
                    project_id = %project.id,
                    "knowledge base requested again after a re-query; treating as NO_ACTION"
                );
                return Ok(DetectionReport {
                    outcome: DetectionOutcome::no_action("knowledge base re-query limit reached"),
                    prompt_run_ids,
                });
            }
            let Some(knowledge_base) = &self.knowledge_base else {
                warn!(
                    event_name = "pipeline.detection.knowledge_base_unavailable",
                    correlation_id,
                    project_id = %project.id,
                    "knowledge base requested but none is configured"
                );
                return Ok(DetectionReport {
                    outcome: DetectionOutcome::no_action("knowledge base is not configured"),
                    prompt_run_ids,
                });
            };

            queries_made += 1;
            match knowledge_base.query(&project.company_id, &query).await {
                Ok(answer) => {
                    info!(
                        event_name = "pipeline.detection.knowledge_base_queried",
                        correlation_id,
                        project_id = %project.id,
                        "knowledge base context folded into detection"
                    );
                    knowledge_base_context = Some(answer);
                }
                Err(kb_error) => {
                    warn!(
                        event_name = "pipeline.detection.knowledge_base_failed",
                        correlation_id,
                        project_id = %project.id,
                        error = %kb_error,
                        "knowledge base lookup failed; treating as NO_ACTION"
                    );
                    return Ok(DetectionReport {
                        outcome: DetectionOutcome::no_action("knowledge base lookup failed"),
                        prompt_run_ids,
                    });
                }
            }
        };

        let outcome = self.apply_decision(project, decision, run_id, now).await?;
        info!(
            event_name = "pipeline.detection.decided",
            correlation_id,
            project_id = %project.id,
            decision = outcome.kind().as_str(),
            action_record_id = outcome.action_record().map(|record| record.id.0.as_str()).unwrap_or("none"),
            is_reminder_check = context.is_reminder_check,
            "action detection completed"
        );
        Ok(DetectionReport { outcome, prompt_run_ids })
    }

    async fn apply_decision(
        &self,
        project: &Project,
        decision: Decision,
        run_id: Option<PromptRunId>,
        now: DateTime<Utc>,
    ) -> Result<DetectionOutcome, DetectionError> {
        match decision {
            Decision::NoAction { reason } => Ok(DetectionOutcome::NoAction { reason }),
            Decision::ActionNeeded { payload, .. } => {
                let requires_approval = !self.config.is_auto_approved(payload.action_type());
                let record = ActionRecord::proposed(
                    project.id.clone(),
                    run_id,
                    payload,
                    requires_approval,
                    now,
                );
                self.actions.insert(&record).await?;
                Ok(DetectionOutcome::ActionNeeded { record })
            }
            Decision::SetFutureReminder { days_until_check, check_reason } => {
                let next_check_date = now + Duration::days(i64::from(days_until_check));
                self.reminders.set_next_check_date(&project.id, Some(next_check_date), now).await?;

                let record = ActionRecord::executed(
                    project.id.clone(),
                    run_id,
                    ActionPayload::SetFutureReminder(ReminderPayload {
                        days_until_check,
                        check_reason,
                        next_check_date,
                    }),
                    json!({ "next_check_date": next_check_date }),
                    now,
                );
                self.actions.insert(&record).await?;
                Ok(DetectionOutcome::SetFutureReminder { next_check_date, record })
            }
            Decision::RequestHumanReview { reason } => {
                let record = ActionRecord::proposed(
                    project.id.clone(),
                    run_id,
                    ActionPayload::HumanReview(HumanReviewPayload::new(reason)),
                    true,
                    now,
                );
                self.actions.insert(&record).await?;
                Ok(DetectionOutcome::RequestHumanReview { record })
            }
            // Resolved by the query loop before a decision is applied.
            Decision::QueryKnowledgeBase { .. } => {
                Ok(DetectionOutcome::no_action("knowledge base re-query limit reached"))
            }
        }
    }
}

fn detection_variables(
    project: &Project,
    context: &DetectionContext,
    knowledge_base_context: Option<&str>,
    now: DateTime<Utc>,
) -> PromptVariables {
    let mut variables = PromptVariables::new()
        .with("company_id", project.company_id.0.clone())
        .with("crm_id", project.crm_id.clone())
        .with("summary", project.summary.clone())
        .with("current_date", now.format("%Y-%m-%d").to_string())
        .with("is_reminder_check", context.is_reminder_check);
    variables.set_text("project_name", project.name.as_deref());
    variables.set_text("next_step", project.next_step.as_deref());
    variables.set_text("track_name", project.project_track.as_deref());
    variables.set_text("knowledge_base_context", knowledge_base_context);
    variables
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;

    use crewflow_core::config::DetectionConfig;
    use crewflow_core::domain::action::{ActionPayload, ActionStatus, ActionType};
    use crewflow_core::domain::prompt::{
        PromptRunStatus, PromptType, WorkflowPrompt, WorkflowPromptId,
    };
    use crewflow_core::DecisionKind;
    use crewflow_db::repositories::{
        ActionRecordRepository, ProjectRepository, SqlActionRecordRepository,
        SqlProjectRepository, SqlWorkflowPromptRepository, WorkflowPromptRepository,
    };

    use super::{DetectionContext, DetectionOutcome};
    use crate::integrations::StaticKnowledgeBase;
    use crate::llm::ScriptedLlmClient;
    use crate::test_support::{detection_service, parse_ts, seed_project, setup_pool};

    #[tokio::test]
    async fn reminder_decision_sets_check_date_and_executed_audit_record() {
        let pool = setup_pool().await;
        let project = seed_project(&pool, "X123").await;
        let llm = Arc::new(ScriptedLlmClient::replying([
            r#"{"decision": "SET_FUTURE_REMINDER", "days_until_check": 3, "check_reason": "permit pending"}"#,
        ]));
        let service = detection_service(&pool, llm, None, DetectionConfig::default());
        let day = parse_ts("2026-03-02T09:00:00Z");

        let report =
            service.detect(&project, &DetectionContext::default(), day).await.expect("detect");

        let DetectionOutcome::SetFutureReminder { next_check_date, record } = &report.outcome
        else {
            panic!("expected reminder outcome, got {:?}", report.outcome);
        };
        assert_eq!(*next_check_date, day + Duration::days(3));
        assert_eq!(record.status, ActionStatus::Executed);
        assert_eq!(record.action_type(), ActionType::SetFutureReminder);

        let stored = SqlProjectRepository::new(pool.clone())
            .find_by_id(&project.id)
            .await
            .expect("find")
            .expect("exists");
        assert_eq!(stored.next_check_date, Some(day + Duration::days(3)));

        let records = SqlActionRecordRepository::new(pool.clone())
            .list_for_project(&project.id)
            .await
            .expect("records");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, ActionStatus::Executed);

        pool.close().await;
    }

    #[tokio::test]
    async fn unparseable_output_is_no_action_with_raw_output_kept() {
        let pool = setup_pool().await;
        let project = seed_project(&pool, "X123").await;
        let llm = Arc::new(ScriptedLlmClient::replying(["I think you should call the client."]));
        let service = detection_service(&pool, llm, None, DetectionConfig::default());

        let report = service
            .detect(&project, &DetectionContext::default(), parse_ts("2026-03-02T09:00:00Z"))
            .await
            .expect("detect");

        assert_eq!(report.outcome.kind(), DecisionKind::NoAction);
        let run_id = report.prompt_run_ids.first().expect("run tracked");
        let run = crate::test_support::find_run(&pool, run_id).await;
        assert_eq!(run.status, PromptRunStatus::Completed);
        assert_eq!(run.prompt_output.as_deref(), Some("I think you should call the client."));

        let records = SqlActionRecordRepository::new(pool.clone())
            .list_for_project(&project.id)
            .await
            .expect("records");
        assert!(records.is_empty());

        pool.close().await;
    }

    #[tokio::test]
    async fn stored_prompt_with_unknown_placeholder_degrades_to_no_action() {
        let pool = setup_pool().await;
        let project = seed_project(&pool, "X123").await;
        SqlWorkflowPromptRepository::new(pool.clone())
            .save(WorkflowPrompt {
                id: WorkflowPromptId("WP-9".to_string()),
                prompt_type: PromptType::ActionDetectionExecution,
                name: "operator edit".to_string(),
                prompt_text: "{{ summary }}\n{{ milestone_instructions }}".to_string(),
                created_at: parse_ts("2026-03-01T09:00:00Z"),
            })
            .await
            .expect("save prompt");
        let llm = Arc::new(ScriptedLlmClient::replying(["unused"]));
        let service = detection_service(&pool, llm.clone(), None, DetectionConfig::default());

        let report = service
            .detect(&project, &DetectionContext::default(), parse_ts("2026-03-02T09:00:00Z"))
            .await
            .expect("detect degrades instead of failing");

        let DetectionOutcome::NoAction { reason } = &report.outcome else {
            panic!("expected NO_ACTION, got {:?}", report.outcome);
        };
        assert!(reason.as_deref().unwrap_or_default().contains("milestone_instructions"));
        assert!(llm.prompts().is_empty());

        let run = crate::test_support::find_run(&pool, &report.prompt_run_ids[0]).await;
        assert_eq!(run.status, PromptRunStatus::Error);
        assert!(SqlActionRecordRepository::new(pool.clone())
            .list_for_project(&project.id)
            .await
            .expect("records")
            .is_empty());

        pool.close().await;
    }

    #[tokio::test]
    async fn action_needed_respects_auto_approval_policy() {
        let pool = setup_pool().await;
        let project = seed_project(&pool, "X123").await;
        let decision = r#"{"decision": "ACTION_NEEDED", "action_type": "timeline_update", "next_step": "Inspection"}"#;

        let gated = detection_service(
            &pool,
            Arc::new(ScriptedLlmClient::replying([decision])),
            None,
            DetectionConfig::default(),
        );
        let auto = detection_service(
            &pool,
            Arc::new(ScriptedLlmClient::replying([decision])),
            None,
            DetectionConfig { auto_approved_action_types: vec![ActionType::TimelineUpdate] },
        );
        let now = parse_ts("2026-03-02T09:00:00Z");

        let gated_report =
            gated.detect(&project, &DetectionContext::default(), now).await.expect("gated");
        let auto_report =
            auto.detect(&project, &DetectionContext::default(), now).await.expect("auto");

        let gated_record = gated_report.outcome.action_record().expect("record");
        assert!(gated_record.requires_approval);
        assert_eq!(gated_record.status, ActionStatus::Pending);
        assert!(matches!(gated_record.payload, ActionPayload::TimelineUpdate(_)));

        let auto_record = auto_report.outcome.action_record().expect("record");
        assert!(!auto_record.requires_approval);
        assert!(auto_record.is_executable());

        pool.close().await;
    }

    #[tokio::test]
    async fn human_review_is_gated_and_flagged() {
        let pool = setup_pool().await;
        let project = seed_project(&pool, "X123").await;
        let llm = Arc::new(ScriptedLlmClient::replying([
            r#"Sure. {"decision": "REQUEST_HUMAN_REVIEW", "reason": "client disputes invoice"}"#,
        ]));
        let service = detection_service(&pool, llm, None, DetectionConfig::default());

        let report = service
            .detect(&project, &DetectionContext::default(), parse_ts("2026-03-02T09:00:00Z"))
            .await
            .expect("detect");

        let record = report.outcome.action_record().expect("record");
        assert!(record.requires_approval);
        let ActionPayload::HumanReview(payload) = &record.payload else {
            panic!("expected human review payload");
        };
        assert!(payload.requires_human_review);
        assert_eq!(payload.reason, "client disputes invoice");

        pool.close().await;
    }

    #[tokio::test]
    async fn knowledge_base_is_queried_at_most_once() {
        let pool = setup_pool().await;
        let project = seed_project(&pool, "X123").await;
        let query = r#"{"decision": "QUERY_KNOWLEDGE_BASE", "query": "permit follow-up policy"}"#;
        let llm = Arc::new(ScriptedLlmClient::replying([query, query]));
        let knowledge_base = Arc::new(StaticKnowledgeBase::new("Follow up on permits weekly."));
        let service = detection_service(
            &pool,
            llm.clone(),
            Some(knowledge_base.clone()),
            DetectionConfig::default(),
        );

        let report = service
            .detect(&project, &DetectionContext::default(), parse_ts("2026-03-02T09:00:00Z"))
            .await
            .expect("detect");

        assert_eq!(report.outcome.kind(), DecisionKind::NoAction);
        assert_eq!(report.prompt_run_ids.len(), 2);
        assert_eq!(knowledge_base.queries(), vec!["permit follow-up policy"]);
        let prompts = llm.prompts();
        assert!(!prompts[0].contains("Follow up on permits weekly."));
        assert!(prompts[1].contains("Follow up on permits weekly."));

        pool.close().await;
    }

    #[tokio::test]
    async fn knowledge_base_context_feeds_the_second_round() {
        let pool = setup_pool().await;
        let project = seed_project(&pool, "X123").await;
        let llm = Arc::new(ScriptedLlmClient::replying([
            r#"{"decision": "QUERY_KNOWLEDGE_BASE", "query": "reminder cadence"}"#,
            r#"{"decision": "SET_FUTURE_REMINDER", "days_until_check": 7}"#,
        ]));
        let service = detection_service(
            &pool,
            llm,
            Some(Arc::new(StaticKnowledgeBase::new("Check stalled permits every 7 days."))),
            DetectionConfig::default(),
        );

        let report = service
            .detect(&project, &DetectionContext::default(), parse_ts("2026-03-02T09:00:00Z"))
            .await
            .expect("detect");

        assert_eq!(report.outcome.kind(), DecisionKind::SetFutureReminder);
        let record = report.outcome.action_record().expect("record");
        assert_eq!(record.prompt_run_id.as_ref(), report.prompt_run_ids.last());

        pool.close().await;
    }

    #[tokio::test]
    async fn reminder_checks_are_flagged_in_the_prompt() {
        let pool = setup_pool().await;
        let project = seed_project(&pool, "X123").await;
        let llm = Arc::new(ScriptedLlmClient::replying([r#"{"decision": "NO_ACTION"}"#]));
        let service = detection_service(&pool, llm.clone(), None, DetectionConfig::default());

        service
            .detect(
                &project,
                &DetectionContext { is_reminder_check: true, ..DetectionContext::default() },
                parse_ts("2026-03-02T09:00:00Z"),
            )
            .await
            .expect("detect");

        assert!(llm.prompts()[0].contains("scheduled follow-up check"));
        pool.close().await;
    }

    #[tokio::test]
    async fn ai_failure_is_no_action() {
        let pool = setup_pool().await;
        let project = seed_project(&pool, "X123").await;
        let llm = Arc::new(ScriptedLlmClient::new([Err("timeout".to_string())]));
        let service = detection_service(&pool, llm, None, DetectionConfig::default());

        let report = service
            .detect(&project, &DetectionContext::default(), parse_ts("2026-03-02T09:00:00Z"))
            .await
            .expect("detect");

        assert_eq!(report.outcome.kind(), DecisionKind::NoAction);
        let run = crate::test_support::find_run(&pool, &report.prompt_run_ids[0]).await;
        assert_eq!(run.status, PromptRunStatus::Error);
        assert_eq!(run.error_message.as_deref(), Some("timeout"));

        pool.close().await;
    }
}
