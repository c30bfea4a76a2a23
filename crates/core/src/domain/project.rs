use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProjectId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompanyId(pub String);

impl ProjectId {
    pub fn generate() -> Self {
        Self(format!("PRJ-{}", Uuid::new_v4().simple()))
    }
}

impl std::fmt::Display for ProjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Display for CompanyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A tracked construction/renovation project mirrored from the CRM.
///
/// At most one project exists per `(company_id, crm_id)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub company_id: CompanyId,
    pub crm_id: String,
    pub name: Option<String>,
    pub summary: String,
    pub next_step: Option<String>,
    pub project_track: Option<String>,
    pub next_check_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Attributes carried by a CRM change event that the project store mirrors.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectAttributes {
    pub name: Option<String>,
    pub next_step: Option<String>,
    pub project_track: Option<String>,
}

impl Project {
    pub fn new(
        company_id: CompanyId,
        crm_id: impl Into<String>,
        attributes: ProjectAttributes,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ProjectId::generate(),
            company_id,
            crm_id: crm_id.into(),
            name: attributes.name,
            summary: String::new(),
            next_step: attributes.next_step,
            project_track: attributes.project_track,
            next_check_date: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Overlays the non-empty attributes of an inbound event. Absent fields keep
    /// their stored value.
    pub fn apply_attributes(&mut self, attributes: ProjectAttributes, now: DateTime<Utc>) {
        if let Some(name) = attributes.name {
            self.name = Some(name);
        }
        if let Some(next_step) = attributes.next_step {
            self.next_step = Some(next_step);
        }
        if let Some(project_track) = attributes.project_track {
            self.project_track = Some(project_track);
        }
        self.updated_at = now;
    }

    pub fn has_summary(&self) -> bool {
        !self.summary.trim().is_empty()
    }

    pub fn is_due_for_check(&self, now: DateTime<Utc>) -> bool {
        self.next_check_date.is_some_and(|due| due <= now)
    }
}
