use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::action::ActionRecordId;
use crate::domain::project::{CompanyId, ProjectId};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IntegrationJobId(pub String);

impl std::fmt::Display for IntegrationJobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Read,
    Write,
    Delete,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Delete => "delete",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "read" => Some(Self::Read),
            "write" => Some(Self::Write),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Project,
    Task,
    Note,
    Contact,
    Communication,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::Task => "task",
            Self::Note => "note",
            Self::Contact => "contact",
            Self::Communication => "communication",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "project" => Some(Self::Project),
            "task" => Some(Self::Task),
            "note" => Some(Self::Note),
            "contact" => Some(Self::Contact),
            "communication" => Some(Self::Communication),
            _ => None,
        }
    }
}

/// `Processing` is the in-progress marker held between an atomic claim and the
/// terminal update.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Retry,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Retry => "retry",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "retry" => Some(Self::Retry),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Statuses a worker may claim from.
    pub fn is_claimable(&self) -> bool {
        matches!(self, Self::Pending | Self::Retry)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrationJob {
    pub id: IntegrationJobId,
    pub company_id: CompanyId,
    pub project_id: Option<ProjectId>,
    pub action_record_id: Option<ActionRecordId>,
    pub operation_type: OperationType,
    pub resource_type: ResourceType,
    pub payload: Value,
    pub status: JobStatus,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IntegrationJob {
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status.is_claimable() && self.next_retry_at.map_or(true, |at| at <= now)
    }
}

/// Everything a caller supplies when enqueueing deferred work.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewIntegrationJob {
    pub company_id: CompanyId,
    pub operation_type: OperationType,
    pub resource_type: ResourceType,
    pub payload: Value,
    pub project_id: Option<ProjectId>,
    pub action_record_id: Option<ActionRecordId>,
    pub scheduled_time: Option<DateTime<Utc>>,
}

impl NewIntegrationJob {
    pub fn new(
        company_id: CompanyId,
        operation_type: OperationType,
        resource_type: ResourceType,
        payload: Value,
    ) -> Self {
        Self {
            company_id,
            operation_type,
            resource_type,
            payload,
            project_id: None,
            action_record_id: None,
            scheduled_time: None,
        }
    }

    pub fn for_project(mut self, project_id: ProjectId) -> Self {
        self.project_id = Some(project_id);
        self
    }

    pub fn for_action(mut self, action_record_id: ActionRecordId) -> Self {
        self.action_record_id = Some(action_record_id);
        self
    }

    pub fn scheduled_at(mut self, scheduled_time: DateTime<Utc>) -> Self {
        self.scheduled_time = Some(scheduled_time);
        self
    }
}
