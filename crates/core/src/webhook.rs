//! Inbound CRM webhook envelope and authentication.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;

use crate::domain::project::{CompanyId, ProjectAttributes};

type HmacSha256 = Hmac<Sha256>;

pub const SHARED_SECRET_HEADER: &str = "x-crewflow-webhook-secret";
pub const SIGNATURE_HEADER: &str = "x-crewflow-signature";
const SIGNATURE_PREFIX: &str = "sha256=";

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum WebhookError {
    #[error("webhook body is not valid JSON: {0}")]
    MalformedBody(String),
    #[error("webhook body must be a JSON object")]
    NotAnObject,
    #[error("webhook is missing required field `{0}`")]
    MissingField(&'static str),
    #[error("missing webhook credentials")]
    MissingCredentials,
    #[error("invalid webhook credentials")]
    InvalidCredentials,
}

/// Normalized CRM change event. CRM-specific field mapping happens upstream;
/// anything beyond the mirrored attributes travels in `data`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookEnvelope {
    pub company_id: CompanyId,
    pub crm_id: String,
    pub event_type: Option<String>,
    pub name: Option<String>,
    pub next_step: Option<String>,
    pub project_track: Option<String>,
    pub data: Value,
}

impl WebhookEnvelope {
    pub fn parse(body: &[u8]) -> Result<Self, WebhookError> {
        let raw: Value = serde_json::from_slice(body)
            .map_err(|error| WebhookError::MalformedBody(error.to_string()))?;
        let object = raw.as_object().ok_or(WebhookError::NotAnObject)?;

        let company_id =
            object.get("company_id").and_then(text_field).ok_or(WebhookError::MissingField("company_id"))?;
        let crm_id =
            object.get("crm_id").and_then(text_field).ok_or(WebhookError::MissingField("crm_id"))?;

        Ok(Self {
            company_id: CompanyId(company_id),
            crm_id,
            event_type: object.get("event_type").and_then(text_field),
            name: object.get("name").and_then(text_field),
            next_step: object.get("next_step").and_then(text_field),
            project_track: object.get("project_track").and_then(text_field),
            data: object.get("data").cloned().unwrap_or(Value::Null),
        })
    }

    pub fn attributes(&self) -> ProjectAttributes {
        ProjectAttributes {
            name: self.name.clone(),
            next_step: self.next_step.clone(),
            project_track: self.project_track.clone(),
        }
    }

    pub fn event_type_or_default(&self) -> &str {
        self.event_type.as_deref().unwrap_or("project.updated")
    }
}

fn text_field(value: &Value) -> Option<String> {
    match value {
        Value::String(value) => {
            let trimmed = value.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(value) => Some(value.to_string()),
        Value::Bool(_) | Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

/// Checks webhook credentials. A matching shared secret or a valid HMAC
/// signature is sufficient; with neither secret configured every request passes.
pub fn authenticate(
    shared_secret: Option<&str>,
    signing_secret: Option<&str>,
    provided_secret: Option<&str>,
    provided_signature: Option<&str>,
    body: &[u8],
) -> Result<(), WebhookError> {
    if shared_secret.is_none() && signing_secret.is_none() {
        return Ok(());
    }
    if provided_secret.is_none() && provided_signature.is_none() {
        return Err(WebhookError::MissingCredentials);
    }

    if let (Some(expected), Some(provided)) = (shared_secret, provided_secret) {
        if shared_secret_matches(expected, provided) {
            return Ok(());
        }
    }
    if let (Some(secret), Some(signature)) = (signing_secret, provided_signature) {
        if verify_signature(secret, body, signature) {
            return Ok(());
        }
    }

    Err(WebhookError::InvalidCredentials)
}

/// Accepts `sha256=<hex>` or a bare hex digest.
pub fn verify_signature(secret: &str, body: &[u8], signature: &str) -> bool {
    let signature = signature.trim();
    let digest = signature.strip_prefix(SIGNATURE_PREFIX).unwrap_or(signature);
    let Ok(expected) = hex::decode(digest) else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body);
    format!("{SIGNATURE_PREFIX}{}", hex::encode(mac.finalize().into_bytes()))
}

/// Compares MACs of both values under the configured secret so the check runs
/// in constant time through `verify_slice`.
fn shared_secret_matches(expected: &str, provided: &str) -> bool {
    let Ok(mut reference) = HmacSha256::new_from_slice(expected.as_bytes()) else {
        return false;
    };
    reference.update(expected.as_bytes());
    let reference = reference.finalize().into_bytes();

    let Ok(mut candidate) = HmacSha256::new_from_slice(expected.as_bytes()) else {
        return false;
    };
    candidate.update(provided.as_bytes());
    candidate.verify_slice(&reference).is_ok()
}
