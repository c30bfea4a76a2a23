use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::project::ProjectId;
use crate::domain::prompt::PromptRunId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionRecordId(pub String);

impl ActionRecordId {
    pub fn generate() -> Self {
        Self(format!("ACT-{}", Uuid::new_v4().simple()))
    }
}

impl std::fmt::Display for ActionRecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Message,
    SetFutureReminder,
    TimelineUpdate,
    HumanReview,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::SetFutureReminder => "set_future_reminder",
            Self::TimelineUpdate => "timeline_update",
            Self::HumanReview => "human_review",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "message" => Some(Self::Message),
            "set_future_reminder" => Some(Self::SetFutureReminder),
            "timeline_update" => Some(Self::TimelineUpdate),
            "human_review" => Some(Self::HumanReview),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    Approved,
    Rejected,
    /// Claimed by an executor; the external effect is in flight.
    Executing,
    Executed,
    Failed,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Executing => "executing",
            Self::Executed => "executed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "executing" => Some(Self::Executing),
            "executed" => Some(Self::Executed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Sms,
    Email,
    Call,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sms => "sms",
            Self::Email => "email",
            Self::Call => "call",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sms" | "text" => Some(Self::Sms),
            "email" => Some(Self::Email),
            "call" | "phone" => Some(Self::Call),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub id: Option<String>,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
}

impl Recipient {
    pub fn is_empty(&self) -> bool {
        self.id.is_none() && self.name.is_none() && self.phone.is_none() && self.email.is_none()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message_content: String,
    pub recipient: Recipient,
    pub channel: Option<Channel>,
}

impl MessagePayload {
    /// Explicit channel wins; otherwise email when only an email address is known,
    /// sms in every other case.
    pub fn resolved_channel(&self) -> Channel {
        if let Some(channel) = self.channel {
            return channel;
        }
        match (&self.recipient.email, &self.recipient.phone) {
            (Some(_), None) => Channel::Email,
            _ => Channel::Sms,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReminderPayload {
    pub days_until_check: u32,
    pub check_reason: Option<String>,
    pub next_check_date: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineUpdatePayload {
    pub next_step: Option<String>,
    pub note: Option<String>,
    #[serde(default)]
    pub fields: Value,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HumanReviewPayload {
    pub reason: String,
    pub requires_human_review: bool,
}

impl HumanReviewPayload {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into(), requires_human_review: true }
    }
}

/// Data needed to carry out an action, one shape per [`ActionType`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action_type", rename_all = "snake_case")]
pub enum ActionPayload {
    Message(MessagePayload),
    SetFutureReminder(ReminderPayload),
    TimelineUpdate(TimelineUpdatePayload),
    HumanReview(HumanReviewPayload),
}

impl ActionPayload {
    pub fn action_type(&self) -> ActionType {
        match self {
            Self::Message(_) => ActionType::Message,
            Self::SetFutureReminder(_) => ActionType::SetFutureReminder,
            Self::TimelineUpdate(_) => ActionType::TimelineUpdate,
            Self::HumanReview(_) => ActionType::HumanReview,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("invalid action transition for `{id}` from {from:?} to {to:?}")]
pub struct ActionTransitionError {
    pub id: ActionRecordId,
    pub from: ActionStatus,
    pub to: ActionStatus,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub id: ActionRecordId,
    pub project_id: ProjectId,
    pub prompt_run_id: Option<PromptRunId>,
    pub payload: ActionPayload,
    pub status: ActionStatus,
    pub requires_approval: bool,
    pub executed_at: Option<DateTime<Utc>>,
    pub execution_result: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ActionRecord {
    pub fn proposed(
        project_id: ProjectId,
        prompt_run_id: Option<PromptRunId>,
        payload: ActionPayload,
        requires_approval: bool,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ActionRecordId::generate(),
            project_id,
            prompt_run_id,
            payload,
            status: ActionStatus::Pending,
            requires_approval,
            executed_at: None,
            execution_result: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// A self-contained record that is born executed, e.g. the audit entry for a
    /// scheduled reminder.
    pub fn executed(
        project_id: ProjectId,
        prompt_run_id: Option<PromptRunId>,
        payload: ActionPayload,
        execution_result: Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ActionRecordId::generate(),
            project_id,
            prompt_run_id,
            payload,
            status: ActionStatus::Executed,
            requires_approval: false,
            executed_at: Some(now),
            execution_result: Some(execution_result),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn action_type(&self) -> ActionType {
        self.payload.action_type()
    }

    /// Approved records and pending records that need no approval may run.
    pub fn is_executable(&self) -> bool {
        match self.status {
            ActionStatus::Approved => true,
            ActionStatus::Pending => !self.requires_approval,
            _ => false,
        }
    }

    pub fn approve(&mut self, now: DateTime<Utc>) -> Result<(), ActionTransitionError> {
        self.transition(ActionStatus::Pending, ActionStatus::Approved, now)
    }

    pub fn reject(&mut self, now: DateTime<Utc>) -> Result<(), ActionTransitionError> {
        self.transition(ActionStatus::Pending, ActionStatus::Rejected, now)
    }

    /// Claims an executable record before any external effect runs.
    pub fn begin_execution(&mut self, now: DateTime<Utc>) -> Result<(), ActionTransitionError> {
        if !self.is_executable() {
            return Err(self.invalid(ActionStatus::Executing));
        }
        self.status = ActionStatus::Executing;
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_executed(
        &mut self,
        result: Value,
        now: DateTime<Utc>,
    ) -> Result<(), ActionTransitionError> {
        if self.status != ActionStatus::Executing && !self.is_executable() {
            return Err(self.invalid(ActionStatus::Executed));
        }
        self.status = ActionStatus::Executed;
        self.executed_at = Some(now);
        self.execution_result = Some(result);
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_failed(
        &mut self,
        result: Value,
        now: DateTime<Utc>,
    ) -> Result<(), ActionTransitionError> {
        if !matches!(
            self.status,
            ActionStatus::Pending | ActionStatus::Approved | ActionStatus::Executing
        ) {
            return Err(self.invalid(ActionStatus::Failed));
        }
        self.status = ActionStatus::Failed;
        self.executed_at = Some(now);
        self.execution_result = Some(result);
        self.updated_at = now;
        Ok(())
    }

    fn transition(
        &mut self,
        expected: ActionStatus,
        to: ActionStatus,
        now: DateTime<Utc>,
    ) -> Result<(), ActionTransitionError> {
        if self.status != expected {
            return Err(self.invalid(to));
        }
        self.status = to;
        self.updated_at = now;
        Ok(())
    }

    fn invalid(&self, to: ActionStatus) -> ActionTransitionError {
        ActionTransitionError { id: self.id.clone(), from: self.status, to }
    }
}
