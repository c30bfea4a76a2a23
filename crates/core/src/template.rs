//! Prompt template rendering.
//!
//! Workflow prompts use `{{ variable }}` placeholders rendered with tera. Every
//! variable in [`KNOWN_VARIABLES`] is always present in the context (empty when
//! the caller did not set it) so stored templates may reference any of them.

use std::collections::BTreeMap;

use serde_json::Value;
use tera::{Context, Tera};
use thiserror::Error;

use crate::domain::prompt::PromptType;

pub const KNOWN_VARIABLES: &[&str] = &[
    "company_id",
    "crm_id",
    "project_name",
    "summary",
    "previous_summary",
    "next_step",
    "track_name",
    "event_type",
    "event_data",
    "current_date",
    "is_reminder_check",
    "knowledge_base_context",
    "action_type",
    "action_payload",
];

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("prompt template failed to render: {0}")]
pub struct TemplateError(pub String);

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PromptVariables {
    values: BTreeMap<String, Value>,
}

impl PromptVariables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    /// Sets a text value, storing an empty string for `None`.
    pub fn set_text(&mut self, key: impl Into<String>, value: Option<&str>) {
        self.set(key, value.unwrap_or_default().to_string());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    fn to_context(&self) -> Context {
        let mut context = Context::new();
        for key in KNOWN_VARIABLES {
            context.insert(*key, "");
        }
        for (key, value) in &self.values {
            context.insert(key.as_str(), value);
        }
        context
    }
}

pub fn render_prompt(template: &str, variables: &PromptVariables) -> Result<String, TemplateError> {
    Tera::one_off(template, &variables.to_context(), false)
        .map_err(|error| TemplateError(describe(&error)))
}

fn describe(error: &tera::Error) -> String {
    use std::error::Error as _;

    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// Built-in template used when no workflow prompt of this type is stored.
pub fn default_template(prompt_type: PromptType) -> &'static str {
    match prompt_type {
        PromptType::SummaryGeneration => SUMMARY_GENERATION,
        PromptType::SummaryUpdate => SUMMARY_UPDATE,
        PromptType::ActionDetection => ACTION_DETECTION,
        PromptType::ActionExecution => ACTION_EXECUTION,
        PromptType::ActionDetectionExecution => ACTION_DETECTION_EXECUTION,
    }
}

const SUMMARY_GENERATION: &str = r#"You maintain project notes for a construction and renovation company.
Write a concise summary (at most 150 words) of the project below for the office team.

Project: {{ project_name }} (CRM id {{ crm_id }})
Current milestone: {{ next_step }}
Track: {{ track_name }}
Latest CRM event ({{ event_type }}):
{{ event_data }}

Today is {{ current_date }}. Respond with the summary text only."#;

const SUMMARY_UPDATE: &str = r#"You maintain project notes for a construction and renovation company.
Update the existing summary with the new CRM event. Keep facts that are still true,
replace facts the event supersedes, and stay under 150 words.

Existing summary:
{{ previous_summary }}

Project: {{ project_name }} (CRM id {{ crm_id }})
Current milestone: {{ next_step }}
Track: {{ track_name }}
New CRM event ({{ event_type }}):
{{ event_data }}

Today is {{ current_date }}. Respond with the updated summary text only."#;

const DECISION_CONTRACT: &str = r#"Answer with a single JSON object and nothing else. The `decision` field must be one of:
- "NO_ACTION" with an optional "reason"
- "ACTION_NEEDED" with "action_type" ("message" or "timeline_update") and its fields:
  message: "message_content", "channel" ("sms", "email" or "call", optional),
           "recipient" {"id", "name", "phone", "email"}
  timeline_update: "next_step" and/or "note"
- "SET_FUTURE_REMINDER" with "days_until_check" (1 to 365) and "check_reason"
- "REQUEST_HUMAN_REVIEW" with "reason"
- "QUERY_KNOWLEDGE_BASE" with "query" (only when company policy is needed to decide)"#;

const ACTION_DETECTION: &str = r#"You review construction projects and decide whether the office must act.

Summary:
{{ summary }}

Current milestone: {{ next_step }}
Track: {{ track_name }}
Today is {{ current_date }}.
{% if is_reminder_check %}This is a scheduled follow-up check that was set earlier; decide whether the situation still needs attention.
{% endif %}{% if knowledge_base_context %}
Company knowledge base results:
{{ knowledge_base_context }}
{% endif %}
"#;

const ACTION_DETECTION_EXECUTION: &str = r#"You review construction projects, decide whether the office must act, and
draft the action when one is needed.

Summary:
{{ summary }}

Current milestone: {{ next_step }}
Track: {{ track_name }}
Today is {{ current_date }}.
{% if is_reminder_check %}This is a scheduled follow-up check that was set earlier; decide whether the situation still needs attention.
{% endif %}{% if knowledge_base_context %}
Company knowledge base results:
{{ knowledge_base_context }}
{% endif %}
"#;

const ACTION_EXECUTION: &str = r#"Prepare the final wording for an approved {{ action_type }} action on this project.

Summary:
{{ summary }}

Action payload:
{{ action_payload }}

Respond with the message text only."#;

/// Decision templates get the output contract appended so stored prompts do not
/// have to repeat it.
pub fn decision_contract() -> &'static str {
    DECISION_CONTRACT
}
