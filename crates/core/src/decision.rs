//! Decision contract for the action detection prompt.
//!
//! The model answers with a JSON object whose `decision` field is one of five
//! fixed values. Anything that does not validate is a [`DecisionParseError`];
//! callers downgrade that to [`Decision::NoAction`].

use serde::{Deserialize, Deserializer};
use serde_json::Value;
use thiserror::Error;

use crate::domain::action::{
    ActionPayload, ActionType, Channel, MessagePayload, Recipient, TimelineUpdatePayload,
};

pub const MAX_DAYS_UNTIL_CHECK: u32 = 365;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DecisionKind {
    NoAction,
    ActionNeeded,
    SetFutureReminder,
    RequestHumanReview,
    QueryKnowledgeBase,
}

impl DecisionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoAction => "NO_ACTION",
            Self::ActionNeeded => "ACTION_NEEDED",
            Self::SetFutureReminder => "SET_FUTURE_REMINDER",
            Self::RequestHumanReview => "REQUEST_HUMAN_REVIEW",
            Self::QueryKnowledgeBase => "QUERY_KNOWLEDGE_BASE",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().replace(['-', ' '], "_").as_str() {
            "NO_ACTION" => Some(Self::NoAction),
            "ACTION_NEEDED" => Some(Self::ActionNeeded),
            "SET_FUTURE_REMINDER" => Some(Self::SetFutureReminder),
            "REQUEST_HUMAN_REVIEW" => Some(Self::RequestHumanReview),
            "QUERY_KNOWLEDGE_BASE" => Some(Self::QueryKnowledgeBase),
            _ => None,
        }
    }
}

/// A validated detection decision. `ActionNeeded` only carries payloads that can
/// be executed automatically (messages and timeline updates).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    NoAction { reason: Option<String> },
    ActionNeeded { payload: ActionPayload, reason: Option<String> },
    SetFutureReminder { days_until_check: u32, check_reason: Option<String> },
    RequestHumanReview { reason: String },
    QueryKnowledgeBase { query: String },
}

impl Decision {
    pub fn kind(&self) -> DecisionKind {
        match self {
            Self::NoAction { .. } => DecisionKind::NoAction,
            Self::ActionNeeded { .. } => DecisionKind::ActionNeeded,
            Self::SetFutureReminder { .. } => DecisionKind::SetFutureReminder,
            Self::RequestHumanReview { .. } => DecisionKind::RequestHumanReview,
            Self::QueryKnowledgeBase { .. } => DecisionKind::QueryKnowledgeBase,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DecisionParseError {
    #[error("response does not contain a JSON object")]
    MissingJson,
    #[error("response JSON is malformed: {0}")]
    MalformedJson(String),
    #[error("response has no `decision` field")]
    MissingDecision,
    #[error("unknown decision `{0}`")]
    UnknownDecision(String),
    #[error("decision {decision} is missing `{field}`")]
    MissingField { decision: &'static str, field: &'static str },
    #[error("invalid value for `{field}`: {message}")]
    InvalidField { field: &'static str, message: String },
}

#[derive(Debug, Default, Deserialize)]
struct RawDecision {
    decision: Option<String>,
    reason: Option<String>,
    days_until_check: Option<Value>,
    check_reason: Option<String>,
    action_type: Option<String>,
    message_content: Option<String>,
    message: Option<String>,
    channel: Option<String>,
    recipient: Option<RawRecipient>,
    #[serde(default, deserialize_with = "lenient_text")]
    recipient_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    recipient_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    recipient_phone: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    recipient_email: Option<String>,
    next_step: Option<String>,
    note: Option<String>,
    #[serde(default)]
    fields: Value,
    query: Option<String>,
}

/// Models often emit CRM contact ids and phone numbers as JSON numbers.
#[derive(Debug, Default, Deserialize)]
struct RawRecipient {
    #[serde(default, deserialize_with = "lenient_text")]
    id: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    name: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    phone: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    email: Option<String>,
}

fn lenient_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(text)) => Some(text),
        Some(Value::Number(number)) => Some(number.to_string()),
        _ => None,
    })
}

pub fn parse_decision(raw: &str) -> Result<Decision, DecisionParseError> {
    let json = extract_json_object(raw).ok_or(DecisionParseError::MissingJson)?;
    let parsed: RawDecision = serde_json::from_str(json)
        .map_err(|error| DecisionParseError::MalformedJson(error.to_string()))?;

    let decision_raw =
        non_blank(parsed.decision.clone()).ok_or(DecisionParseError::MissingDecision)?;
    let kind = DecisionKind::parse(&decision_raw)
        .ok_or_else(|| DecisionParseError::UnknownDecision(decision_raw.clone()))?;

    match kind {
        DecisionKind::NoAction => Ok(Decision::NoAction { reason: non_blank(parsed.reason) }),
        DecisionKind::SetFutureReminder => {
            let days = parse_days(parsed.days_until_check.as_ref())?;
            Ok(Decision::SetFutureReminder {
                days_until_check: days,
                check_reason: non_blank(parsed.check_reason).or(non_blank(parsed.reason)),
            })
        }
        DecisionKind::RequestHumanReview => Ok(Decision::RequestHumanReview {
            reason: non_blank(parsed.reason)
                .or(non_blank(parsed.note))
                .unwrap_or_else(|| "review requested".to_string()),
        }),
        DecisionKind::QueryKnowledgeBase => {
            let query = non_blank(parsed.query).ok_or(DecisionParseError::MissingField {
                decision: kind.as_str(),
                field: "query",
            })?;
            Ok(Decision::QueryKnowledgeBase { query })
        }
        DecisionKind::ActionNeeded => parse_action_needed(parsed),
    }
}

fn parse_action_needed(parsed: RawDecision) -> Result<Decision, DecisionParseError> {
    let action_raw = non_blank(parsed.action_type.clone()).ok_or(
        DecisionParseError::MissingField { decision: "ACTION_NEEDED", field: "action_type" },
    )?;
    let action_type = ActionType::parse(&action_raw).ok_or_else(|| {
        DecisionParseError::InvalidField {
            field: "action_type",
            message: format!("unsupported action type `{action_raw}`"),
        }
    })?;

    let reason = non_blank(parsed.reason.clone());
    let payload = match action_type {
        ActionType::Message => ActionPayload::Message(message_payload(parsed)?),
        ActionType::TimelineUpdate => {
            let next_step = non_blank(parsed.next_step);
            let note = non_blank(parsed.note);
            if next_step.is_none() && note.is_none() {
                return Err(DecisionParseError::MissingField {
                    decision: "ACTION_NEEDED",
                    field: "next_step",
                });
            }
            ActionPayload::TimelineUpdate(TimelineUpdatePayload {
                next_step,
                note,
                fields: parsed.fields,
            })
        }
        ActionType::SetFutureReminder | ActionType::HumanReview => {
            return Err(DecisionParseError::InvalidField {
                field: "action_type",
                message: format!(
                    "`{}` has its own decision and cannot be proposed as an action",
                    action_type.as_str()
                ),
            });
        }
    };

    Ok(Decision::ActionNeeded { payload, reason })
}

fn message_payload(parsed: RawDecision) -> Result<MessagePayload, DecisionParseError> {
    let message_content = non_blank(parsed.message_content).or(non_blank(parsed.message)).ok_or(
        DecisionParseError::MissingField { decision: "ACTION_NEEDED", field: "message_content" },
    )?;

    let nested = parsed.recipient.unwrap_or_default();
    let recipient = Recipient {
        id: non_blank(nested.id).or(non_blank(parsed.recipient_id)),
        name: non_blank(nested.name).or(non_blank(parsed.recipient_name)),
        phone: non_blank(nested.phone).or(non_blank(parsed.recipient_phone)),
        email: non_blank(nested.email).or(non_blank(parsed.recipient_email)),
    };

    let channel = match non_blank(parsed.channel) {
        Some(raw) => Some(Channel::parse(&raw).ok_or_else(|| DecisionParseError::InvalidField {
            field: "channel",
            message: format!("unsupported channel `{raw}`"),
        })?),
        None => None,
    };

    Ok(MessagePayload { message_content, recipient, channel })
}

fn parse_days(value: Option<&Value>) -> Result<u32, DecisionParseError> {
    let value = value.ok_or(DecisionParseError::MissingField {
        decision: "SET_FUTURE_REMINDER",
        field: "days_until_check",
    })?;

    let days = match value {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => text.trim().parse::<u64>().ok(),
        _ => None,
    }
    .ok_or_else(|| DecisionParseError::InvalidField {
        field: "days_until_check",
        message: format!("expected a positive whole number, got {value}"),
    })?;

    if days == 0 || days > u64::from(MAX_DAYS_UNTIL_CHECK) {
        return Err(DecisionParseError::InvalidField {
            field: "days_until_check",
            message: format!("must be between 1 and {MAX_DAYS_UNTIL_CHECK}, got {days}"),
        });
    }
    Ok(days as u32)
}

/// Finds the JSON object in a model response, tolerating markdown fences and
/// surrounding prose.
fn extract_json_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end > start).then(|| &raw[start..=end])
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.map(|text| text.trim().to_string()).filter(|text| !text.is_empty())
}
