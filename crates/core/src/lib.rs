pub mod config;
pub mod decision;
pub mod domain;
pub mod errors;
pub mod integration_queue;
pub mod template;
pub mod webhook;

pub use decision::{parse_decision, Decision, DecisionKind, DecisionParseError};
pub use domain::action::{
    ActionPayload, ActionRecord, ActionRecordId, ActionStatus, ActionTransitionError, ActionType,
    Channel, HumanReviewPayload, MessagePayload, Recipient, ReminderPayload, TimelineUpdatePayload,
};
pub use domain::integration::{
    IntegrationJob, IntegrationJobId, JobStatus, NewIntegrationJob, OperationType, ResourceType,
};
pub use domain::project::{CompanyId, Project, ProjectAttributes, ProjectId};
pub use domain::prompt::{
    NewPromptRun, PromptRun, PromptRunId, PromptRunResult, PromptRunStatus,
    PromptRunTransitionError, PromptType, WorkflowPrompt, WorkflowPromptId,
};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use integration_queue::{
    retry_backoff, IntegrationQueueEngine, JobOutcome, QueueEngineConfig, QueueError,
};
pub use template::{default_template, render_prompt, PromptVariables, TemplateError};
pub use webhook::{WebhookEnvelope, WebhookError};
