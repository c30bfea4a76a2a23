use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::project::ProjectId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowPromptId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PromptRunId(pub String);

impl PromptRunId {
    pub fn generate() -> Self {
        Self(format!("RUN-{}", Uuid::new_v4().simple()))
    }
}

impl std::fmt::Display for PromptRunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptType {
    SummaryGeneration,
    SummaryUpdate,
    ActionDetection,
    ActionExecution,
    ActionDetectionExecution,
}

impl PromptType {
    pub const ALL: [PromptType; 5] = [
        Self::SummaryGeneration,
        Self::SummaryUpdate,
        Self::ActionDetection,
        Self::ActionExecution,
        Self::ActionDetectionExecution,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SummaryGeneration => "summary_generation",
            Self::SummaryUpdate => "summary_update",
            Self::ActionDetection => "action_detection",
            Self::ActionExecution => "action_execution",
            Self::ActionDetectionExecution => "action_detection_execution",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "summary_generation" => Some(Self::SummaryGeneration),
            "summary_update" => Some(Self::SummaryUpdate),
            "action_detection" => Some(Self::ActionDetection),
            "action_execution" => Some(Self::ActionExecution),
            "action_detection_execution" => Some(Self::ActionDetectionExecution),
            _ => None,
        }
    }
}

/// A named prompt template holding `{{ variable }}` placeholders.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowPrompt {
    pub id: WorkflowPromptId,
    pub prompt_type: PromptType,
    pub name: String,
    pub prompt_text: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PromptRunStatus {
    Pending,
    Completed,
    Error,
}

impl PromptRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Completed => "COMPLETED",
            Self::Error => "ERROR",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Some(Self::Pending),
            "COMPLETED" => Some(Self::Completed),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Final result of an AI invocation as recorded on its run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PromptRunResult {
    Output(String),
    Error(String),
}

impl PromptRunResult {
    pub fn status(&self) -> PromptRunStatus {
        match self {
            Self::Output(_) => PromptRunStatus::Completed,
            Self::Error(_) => PromptRunStatus::Error,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("prompt run `{run_id}` is already {status:?}")]
pub struct PromptRunTransitionError {
    pub run_id: PromptRunId,
    pub status: PromptRunStatus,
}

/// One logged AI invocation. Created in `Pending` and finalized exactly once.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptRun {
    pub id: PromptRunId,
    pub project_id: Option<ProjectId>,
    pub workflow_prompt_id: Option<WorkflowPromptId>,
    pub prompt_input: String,
    pub prompt_output: Option<String>,
    pub error_message: Option<String>,
    pub status: PromptRunStatus,
    pub ai_provider: String,
    pub ai_model: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub initiated_by: Option<String>,
}

/// Inputs for opening a run before the AI call is made.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewPromptRun {
    pub project_id: Option<ProjectId>,
    pub workflow_prompt_id: Option<WorkflowPromptId>,
    pub prompt_input: String,
    pub ai_provider: String,
    pub ai_model: String,
    pub initiated_by: Option<String>,
}

impl PromptRun {
    pub fn pending(new_run: NewPromptRun, now: DateTime<Utc>) -> Self {
        Self {
            id: PromptRunId::generate(),
            project_id: new_run.project_id,
            workflow_prompt_id: new_run.workflow_prompt_id,
            prompt_input: new_run.prompt_input,
            prompt_output: None,
            error_message: None,
            status: PromptRunStatus::Pending,
            ai_provider: new_run.ai_provider,
            ai_model: new_run.ai_model,
            created_at: now,
            completed_at: None,
            initiated_by: new_run.initiated_by,
        }
    }

    /// Performs the single allowed transition out of `Pending`.
    pub fn finalize(
        &mut self,
        result: PromptRunResult,
        now: DateTime<Utc>,
    ) -> Result<(), PromptRunTransitionError> {
        if self.status.is_terminal() {
            return Err(PromptRunTransitionError { run_id: self.id.clone(), status: self.status });
        }

        self.status = result.status();
        match result {
            PromptRunResult::Output(output) => self.prompt_output = Some(output),
            PromptRunResult::Error(error) => self.error_message = Some(error),
        }
        self.completed_at = Some(now);
        Ok(())
    }
}
