//! HTTP surface: CRM webhook ingestion, the action approval API, and the
//! operator view of the integration queue.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use crewflow_agent::executor::{ExecutionOutcome, ExecutorError};
use crewflow_agent::pipeline::PipelineReport;
use crewflow_agent::runtime::AgentRuntime;
use crewflow_core::config::WebhookConfig;
use crewflow_core::domain::action::{ActionRecord, ActionRecordId, ActionStatus};
use crewflow_core::domain::integration::{IntegrationJob, JobStatus};
use crewflow_core::webhook::{authenticate, SHARED_SECRET_HEADER, SIGNATURE_HEADER};
use crewflow_core::{ApplicationError, InterfaceError, WebhookEnvelope, WebhookError};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

const CORRELATION_HEADER: &str = "x-correlation-id";
const DEFAULT_LIST_LIMIT: u32 = 50;
const MAX_LIST_LIMIT: u32 = 200;

#[derive(Clone)]
pub struct ApiState {
    runtime: AgentRuntime,
    webhook: WebhookConfig,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub error: String,
    pub correlation_id: String,
}

type ApiError = (StatusCode, Json<ErrorBody>);

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct ActionExecutionResponse {
    pub action: ActionRecord,
    pub execution: ExecutionOutcome,
}

pub fn router(runtime: AgentRuntime, webhook: WebhookConfig) -> Router {
    Router::new()
        .route("/api/v1/webhooks/{source}", post(ingest_webhook))
        .route("/api/v1/actions", get(list_actions))
        .route("/api/v1/actions/{action_id}", get(get_action))
        .route("/api/v1/actions/{action_id}/approve", post(approve_action))
        .route("/api/v1/actions/{action_id}/reject", post(reject_action))
        .route("/api/v1/actions/{action_id}/execute", post(execute_action))
        .route("/api/v1/jobs", get(list_jobs))
        .with_state(ApiState { runtime, webhook })
}

async fn ingest_webhook(
    Path(source): Path<String>,
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<PipelineReport>, ApiError> {
    let correlation_id = correlation_id(&headers);

    authenticate(
        state.webhook.shared_secret.as_ref().map(|secret| secret.expose_secret()),
        state.webhook.signing_secret.as_ref().map(|secret| secret.expose_secret()),
        header_text(&headers, SHARED_SECRET_HEADER),
        header_text(&headers, SIGNATURE_HEADER),
        &body,
    )
    .map_err(|auth_error| {
        warn!(
            event_name = "api.webhook.unauthorized",
            correlation_id = %correlation_id,
            source = %source,
            error = %auth_error,
            "webhook rejected"
        );
        error_body(StatusCode::UNAUTHORIZED, auth_error.to_string(), &correlation_id)
    })?;

    let envelope = WebhookEnvelope::parse(&body).map_err(|parse_error| {
        warn!(
            event_name = "api.webhook.invalid",
            correlation_id = %correlation_id,
            source = %source,
            error = %parse_error,
            "webhook payload rejected"
        );
        let status = match parse_error {
            WebhookError::MissingCredentials | WebhookError::InvalidCredentials => {
                StatusCode::UNAUTHORIZED
            }
            _ => StatusCode::BAD_REQUEST,
        };
        error_body(status, parse_error.to_string(), &correlation_id)
    })?;

    info!(
        event_name = "api.webhook.received",
        correlation_id = %correlation_id,
        source = %source,
        crm_id = %envelope.crm_id,
        company_id = %envelope.company_id,
        "crm webhook accepted"
    );

    let report = state
        .runtime
        .pipeline()
        .ingest_webhook(&envelope, &correlation_id, Utc::now())
        .await
        .map_err(|pipeline_error| {
            error!(
                event_name = "api.webhook.failed",
                correlation_id = %correlation_id,
                crm_id = %envelope.crm_id,
                error = %pipeline_error,
                "webhook processing failed"
            );
            interface_error(
                ApplicationError::Persistence(pipeline_error.to_string())
                    .into_interface(correlation_id.clone()),
            )
        })?;

    Ok(Json(report))
}

async fn list_actions(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<ActionRecord>>, ApiError> {
    let correlation_id = correlation_id(&headers);
    let status = match query.status.as_deref() {
        None => ActionStatus::Pending,
        Some(raw) => ActionStatus::parse(raw).ok_or_else(|| {
            error_body(
                StatusCode::BAD_REQUEST,
                format!("unknown action status `{raw}`"),
                &correlation_id,
            )
        })?,
    };

    let records = state
        .runtime
        .executor()
        .list_by_status(status, list_limit(query.limit))
        .await
        .map_err(|executor_error| executor_failure(executor_error, &correlation_id))?;
    Ok(Json(records))
}

async fn get_action(
    Path(action_id): Path<String>,
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<ActionRecord>, ApiError> {
    let correlation_id = correlation_id(&headers);
    let record = state
        .runtime
        .executor()
        .find(&ActionRecordId(action_id))
        .await
        .map_err(|executor_error| executor_failure(executor_error, &correlation_id))?;
    Ok(Json(record))
}

/// Approves the action and immediately runs it.
async fn approve_action(
    Path(action_id): Path<String>,
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<ActionExecutionResponse>, ApiError> {
    let correlation_id = correlation_id(&headers);
    let action_id = ActionRecordId(action_id);
    let executor = state.runtime.executor();
    let now = Utc::now();

    executor
        .approve(&action_id, now)
        .await
        .map_err(|executor_error| executor_failure(executor_error, &correlation_id))?;
    let execution = executor
        .execute_action(&action_id, now)
        .await
        .map_err(|executor_error| executor_failure(executor_error, &correlation_id))?;
    let action = executor
        .find(&action_id)
        .await
        .map_err(|executor_error| executor_failure(executor_error, &correlation_id))?;

    info!(
        event_name = "api.action.approved",
        correlation_id = %correlation_id,
        action_record_id = %action.id,
        status = action.status.as_str(),
        "action approved via api"
    );
    Ok(Json(ActionExecutionResponse { action, execution }))
}

async fn reject_action(
    Path(action_id): Path<String>,
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<ActionRecord>, ApiError> {
    let correlation_id = correlation_id(&headers);
    let record = state
        .runtime
        .executor()
        .reject(&ActionRecordId(action_id), Utc::now())
        .await
        .map_err(|executor_error| executor_failure(executor_error, &correlation_id))?;
    Ok(Json(record))
}

async fn execute_action(
    Path(action_id): Path<String>,
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<ActionExecutionResponse>, ApiError> {
    let correlation_id = correlation_id(&headers);
    let action_id = ActionRecordId(action_id);
    let executor = state.runtime.executor();

    let execution = executor
        .execute_action(&action_id, Utc::now())
        .await
        .map_err(|executor_error| executor_failure(executor_error, &correlation_id))?;
    let action = executor
        .find(&action_id)
        .await
        .map_err(|executor_error| executor_failure(executor_error, &correlation_id))?;
    Ok(Json(ActionExecutionResponse { action, execution }))
}

async fn list_jobs(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<IntegrationJob>>, ApiError> {
    let correlation_id = correlation_id(&headers);
    let status = match query.status.as_deref() {
        None => JobStatus::Failed,
        Some(raw) => JobStatus::parse(raw).ok_or_else(|| {
            error_body(StatusCode::BAD_REQUEST, format!("unknown job status `{raw}`"), &correlation_id)
        })?,
    };

    let jobs = state
        .runtime
        .queue()
        .list_by_status(status, list_limit(query.limit))
        .await
        .map_err(|queue_error| {
            interface_error(
                ApplicationError::Persistence(queue_error.to_string())
                    .into_interface(correlation_id.clone()),
            )
        })?;
    Ok(Json(jobs))
}

fn executor_failure(executor_error: ExecutorError, correlation_id: &str) -> ApiError {
    let application_error = match executor_error {
        ExecutorError::ActionNotFound(id) => {
            ApplicationError::NotFound { entity: "action record", id: id.0 }
        }
        ExecutorError::ProjectNotFound(id) => ApplicationError::NotFound { entity: "project", id: id.0 },
        ExecutorError::Domain(domain_error) => ApplicationError::Domain(domain_error),
        ExecutorError::Conflict(id) => {
            return interface_error(InterfaceError::Conflict {
                message: format!("action record `{id}` changed concurrently"),
                correlation_id: correlation_id.to_string(),
            });
        }
        other @ (ExecutorError::Repository(_) | ExecutorError::Queue(_)) => {
            error!(
                event_name = "api.action.failed",
                correlation_id,
                error = %other,
                "action request failed"
            );
            ApplicationError::Persistence(other.to_string())
        }
    };
    interface_error(application_error.into_interface(correlation_id))
}

fn interface_error(interface: InterfaceError) -> ApiError {
    let (status, message) = match &interface {
        InterfaceError::BadRequest { message, .. } => (StatusCode::BAD_REQUEST, message.clone()),
        InterfaceError::NotFound { message, .. } => (StatusCode::NOT_FOUND, message.clone()),
        InterfaceError::Conflict { message, .. } => (StatusCode::CONFLICT, message.clone()),
        InterfaceError::ServiceUnavailable { .. } => {
            (StatusCode::SERVICE_UNAVAILABLE, interface.user_message().to_string())
        }
        InterfaceError::Internal { .. } => {
            (StatusCode::INTERNAL_SERVER_ERROR, interface.user_message().to_string())
        }
    };
    error_body(status, message, interface.correlation_id())
}

fn error_body(status: StatusCode, error: impl Into<String>, correlation_id: &str) -> ApiError {
    (status, Json(ErrorBody { error: error.into(), correlation_id: correlation_id.to_string() }))
}

fn header_text<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok()).map(str::trim)
}

fn correlation_id(headers: &HeaderMap) -> String {
    header_text(headers, CORRELATION_HEADER)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("req-{}", Uuid::new_v4().simple()))
}

fn list_limit(requested: Option<u32>) -> u32 {
    requested.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT)
}
