//! Outbound collaborators: communication delivery, CRM writes, and the
//! company knowledge base.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crewflow_core::config::IntegrationsConfig;
use crewflow_core::domain::action::{ActionRecordId, Channel, Recipient};
use crewflow_core::domain::project::{CompanyId, ProjectId};

/// Failure of an external call, classified for the queue's retry decision.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum IntegrationError {
    #[error("retryable integration failure: {0}")]
    Retryable(String),
    #[error("permanent integration failure: {0}")]
    Permanent(String),
}

impl IntegrationError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Retryable(message) | Self::Permanent(message) => message,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommunicationRequest {
    pub action_id: ActionRecordId,
    pub message_content: String,
    pub recipient: Recipient,
    pub channel: Channel,
    pub project_id: ProjectId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommunicationResponse {
    pub success: bool,
    #[serde(default)]
    pub details: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    /// Set by the provider when an unaccepted delivery may succeed later.
    /// Absent means the rejection is final.
    #[serde(default)]
    pub retryable: bool,
}

impl CommunicationResponse {
    pub fn delivered(details: Value) -> Self {
        Self { success: true, details: Some(details), error: None, retryable: false }
    }

    pub fn rejected(error: impl Into<String>) -> Self {
        Self { success: false, details: None, error: Some(error.into()), retryable: false }
    }

    pub fn deferred(error: impl Into<String>) -> Self {
        Self { success: false, details: None, error: Some(error.into()), retryable: true }
    }

    /// The failure of an unaccepted delivery, classified for the queue.
    pub fn failure(&self) -> Option<IntegrationError> {
        if self.success {
            return None;
        }
        let message = self.error.clone().unwrap_or_else(|| "delivery was not accepted".to_string());
        Some(if self.retryable {
            IntegrationError::Retryable(message)
        } else {
            IntegrationError::Permanent(message)
        })
    }
}

#[async_trait]
pub trait CommunicationSender: Send + Sync {
    async fn send(
        &self,
        request: &CommunicationRequest,
    ) -> Result<CommunicationResponse, IntegrationError>;
}

#[async_trait]
pub trait CrmClient: Send + Sync {
    /// Pushes project field changes to the CRM record identified in `payload`.
    async fn write_project(
        &self,
        company_id: &CompanyId,
        payload: &Value,
    ) -> Result<Value, IntegrationError>;
}

#[async_trait]
pub trait KnowledgeBase: Send + Sync {
    /// Returns text context answering `query` for the company.
    async fn query(&self, company_id: &CompanyId, query: &str) -> Result<String, IntegrationError>;
}

fn build_client(config: &IntegrationsConfig) -> Result<Client, IntegrationError> {
    Client::builder()
        .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
        .build()
        .map_err(|error| IntegrationError::Permanent(format!("http client setup failed: {error}")))
}

/// 5xx, 408 and 429 are worth another attempt; any other non-success status is not.
fn classify_status(status: StatusCode, body: &str) -> IntegrationError {
    let message = format!("remote returned {status}: {}", body.chars().take(300).collect::<String>());
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        IntegrationError::Retryable(message)
    } else {
        IntegrationError::Permanent(message)
    }
}

fn classify_transport(error: reqwest::Error) -> IntegrationError {
    if error.is_timeout() || error.is_connect() || error.is_request() {
        IntegrationError::Retryable(format!("request failed: {error}"))
    } else {
        IntegrationError::Permanent(format!("request failed: {error}"))
    }
}

async fn post_json(
    builder: reqwest::RequestBuilder,
) -> Result<Value, IntegrationError> {
    let response = builder.send().await.map_err(classify_transport)?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(classify_status(status, &body));
    }
    if status == StatusCode::NO_CONTENT {
        return Ok(Value::Null);
    }
    response
        .json()
        .await
        .map_err(|error| IntegrationError::Permanent(format!("invalid JSON response: {error}")))
}

pub struct HttpCommunicationSender {
    client: Client,
    url: String,
}

impl HttpCommunicationSender {
    pub fn from_config(config: &IntegrationsConfig) -> Result<Option<Self>, IntegrationError> {
        let Some(url) = config.communication_url.clone() else {
            return Ok(None);
        };
        Ok(Some(Self { client: build_client(config)?, url }))
    }
}

#[async_trait]
impl CommunicationSender for HttpCommunicationSender {
    async fn send(
        &self,
        request: &CommunicationRequest,
    ) -> Result<CommunicationResponse, IntegrationError> {
        let body = post_json(self.client.post(&self.url).json(request)).await?;
        serde_json::from_value(body).map_err(|error| {
            IntegrationError::Permanent(format!("unexpected communication response: {error}"))
        })
    }
}

pub struct HttpCrmClient {
    client: Client,
    base_url: String,
    token: Option<SecretString>,
}

impl HttpCrmClient {
    pub fn from_config(config: &IntegrationsConfig) -> Result<Option<Self>, IntegrationError> {
        let Some(base_url) = config.crm_api_base_url.as_deref() else {
            return Ok(None);
        };
        Ok(Some(Self {
            client: build_client(config)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: config.crm_api_token.clone(),
        }))
    }
}

#[async_trait]
impl CrmClient for HttpCrmClient {
    async fn write_project(
        &self,
        company_id: &CompanyId,
        payload: &Value,
    ) -> Result<Value, IntegrationError> {
        let crm_id = payload
            .get("crm_id")
            .and_then(Value::as_str)
            .ok_or_else(|| IntegrationError::Permanent("payload is missing `crm_id`".to_string()))?;

        let mut builder = self
            .client
            .patch(format!("{}/companies/{}/projects/{}", self.base_url, company_id, crm_id))
            .json(payload);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token.expose_secret());
        }
        post_json(builder).await
    }
}

pub struct HttpKnowledgeBase {
    client: Client,
    url: String,
}

impl HttpKnowledgeBase {
    pub fn from_config(config: &IntegrationsConfig) -> Result<Option<Self>, IntegrationError> {
        let Some(url) = config.knowledge_base_url.clone() else {
            return Ok(None);
        };
        Ok(Some(Self { client: build_client(config)?, url }))
    }
}

#[derive(Deserialize)]
struct KnowledgeBaseAnswer {
    #[serde(default)]
    context: Option<String>,
    #[serde(default)]
    results: Vec<KnowledgeBaseHit>,
}

#[derive(Deserialize)]
struct KnowledgeBaseHit {
    content: String,
}

#[async_trait]
impl KnowledgeBase for HttpKnowledgeBase {
    async fn query(&self, company_id: &CompanyId, query: &str) -> Result<String, IntegrationError> {
        let body = post_json(
            self.client.post(&self.url).json(&json!({"company_id": company_id, "query": query})),
        )
        .await?;
        let answer: KnowledgeBaseAnswer = serde_json::from_value(body).map_err(|error| {
            IntegrationError::Permanent(format!("unexpected knowledge base response: {error}"))
        })?;

        Ok(answer.context.unwrap_or_else(|| {
            answer.results.into_iter().map(|hit| hit.content).collect::<Vec<_>>().join("\n---\n")
        }))
    }
}

/// Stands in for an endpoint that has no URL configured. Every call fails
/// permanently so the work surfaces as a `failed` job instead of being dropped.
pub struct UnconfiguredIntegration {
    name: &'static str,
}

impl UnconfiguredIntegration {
    pub fn new(name: &'static str) -> Self {
        Self { name }
    }

    fn error(&self) -> IntegrationError {
        IntegrationError::Permanent(format!("{} endpoint is not configured", self.name))
    }
}

#[async_trait]
impl CommunicationSender for UnconfiguredIntegration {
    async fn send(
        &self,
        _request: &CommunicationRequest,
    ) -> Result<CommunicationResponse, IntegrationError> {
        Err(self.error())
    }
}

#[async_trait]
impl CrmClient for UnconfiguredIntegration {
    async fn write_project(
        &self,
        _company_id: &CompanyId,
        _payload: &Value,
    ) -> Result<Value, IntegrationError> {
        Err(self.error())
    }
}

/// Records every request and answers from a script; delivers successfully once
/// the script is empty.
#[derive(Default)]
pub struct RecordingCommunicationSender {
    script: Mutex<VecDeque<Result<CommunicationResponse, IntegrationError>>>,
    sent: Mutex<Vec<CommunicationRequest>>,
    latency: Option<Duration>,
}

impl RecordingCommunicationSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scripted<I>(responses: I) -> Self
    where
        I: IntoIterator<Item = Result<CommunicationResponse, IntegrationError>>,
    {
        Self {
            script: Mutex::new(responses.into_iter().collect()),
            sent: Mutex::default(),
            latency: None,
        }
    }

    /// Every send waits this long before answering.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn sent(&self) -> Vec<CommunicationRequest> {
        self.sent.lock().map(|sent| sent.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl CommunicationSender for RecordingCommunicationSender {
    async fn send(
        &self,
        request: &CommunicationRequest,
    ) -> Result<CommunicationResponse, IntegrationError> {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(request.clone());
        }
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let scripted = self.script.lock().ok().and_then(|mut script| script.pop_front());
        scripted.unwrap_or_else(|| {
            Ok(CommunicationResponse::delivered(json!({"channel": request.channel.as_str()})))
        })
    }
}

/// Records CRM writes; answers from a script, succeeding once it is empty.
#[derive(Default)]
pub struct RecordingCrmClient {
    script: Mutex<VecDeque<Result<Value, IntegrationError>>>,
    writes: Mutex<Vec<(CompanyId, Value)>>,
}

impl RecordingCrmClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scripted<I>(responses: I) -> Self
    where
        I: IntoIterator<Item = Result<Value, IntegrationError>>,
    {
        Self { script: Mutex::new(responses.into_iter().collect()), writes: Mutex::default() }
    }

    pub fn writes(&self) -> Vec<(CompanyId, Value)> {
        self.writes.lock().map(|writes| writes.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl CrmClient for RecordingCrmClient {
    async fn write_project(
        &self,
        company_id: &CompanyId,
        payload: &Value,
    ) -> Result<Value, IntegrationError> {
        if let Ok(mut writes) = self.writes.lock() {
            writes.push((company_id.clone(), payload.clone()));
        }
        let scripted = self.script.lock().ok().and_then(|mut script| script.pop_front());
        scripted.unwrap_or_else(|| Ok(json!({"updated": true})))
    }
}

/// Answers every query with the same context and remembers the queries.
pub struct StaticKnowledgeBase {
    answer: String,
    queries: Mutex<Vec<String>>,
}

impl StaticKnowledgeBase {
    pub fn new(answer: impl Into<String>) -> Self {
        Self { answer: answer.into(), queries: Mutex::default() }
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().map(|queries| queries.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl KnowledgeBase for StaticKnowledgeBase {
    async fn query(&self, _company_id: &CompanyId, query: &str) -> Result<String, IntegrationError> {
        if let Ok(mut queries) = self.queries.lock() {
            queries.push(query.to_string());
        }
        Ok(self.answer.clone())
    }
}
