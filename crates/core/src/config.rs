use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::action::ActionType;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub server: ServerConfig,
    pub webhook: WebhookConfig,
    pub integrations: IntegrationsConfig,
    pub queue: QueueConfig,
    pub reminders: ReminderConfig,
    pub detection: DetectionConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

/// Inbound webhook authentication. When both are unset, webhooks are accepted
/// without authentication.
#[derive(Clone, Debug, Default)]
pub struct WebhookConfig {
    pub shared_secret: Option<SecretString>,
    pub signing_secret: Option<SecretString>,
}

impl WebhookConfig {
    pub fn requires_authentication(&self) -> bool {
        self.shared_secret.is_some() || self.signing_secret.is_some()
    }
}

#[derive(Clone, Debug)]
pub struct IntegrationsConfig {
    pub communication_url: Option<String>,
    pub crm_api_base_url: Option<String>,
    pub crm_api_token: Option<SecretString>,
    pub knowledge_base_url: Option<String>,
    pub request_timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct QueueConfig {
    pub worker_enabled: bool,
    pub worker_id: String,
    pub poll_interval_secs: u64,
    pub batch_size: u32,
    pub claim_timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ReminderConfig {
    pub sweep_enabled: bool,
    pub sweep_interval_secs: u64,
    pub batch_size: u32,
}

#[derive(Clone, Debug, Default)]
pub struct DetectionConfig {
    /// Action types that skip the human approval gate.
    pub auto_approved_action_types: Vec<ActionType>,
}

impl DetectionConfig {
    pub fn is_auto_approved(&self, action_type: ActionType) -> bool {
        self.auto_approved_action_types.contains(&action_type)
    }
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    OpenAi,
    Anthropic,
    Ollama,
}

impl LlmProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Ollama => "ollama",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub llm_provider: Option<LlmProvider>,
    pub llm_model: Option<String>,
    pub server_port: Option<u16>,
    pub queue_worker_enabled: Option<bool>,
    pub reminder_sweep_enabled: Option<bool>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://crewflow.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            llm: LlmConfig {
                provider: LlmProvider::Ollama,
                api_key: None,
                base_url: Some("http://localhost:11434".to_string()),
                model: "llama3.1".to_string(),
                timeout_secs: 60,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            webhook: WebhookConfig::default(),
            integrations: IntegrationsConfig {
                communication_url: None,
                crm_api_base_url: None,
                crm_api_token: None,
                knowledge_base_url: None,
                request_timeout_secs: 20,
            },
            queue: QueueConfig {
                worker_enabled: true,
                worker_id: "crewflow-worker".to_string(),
                poll_interval_secs: 15,
                batch_size: 25,
                claim_timeout_secs: 600,
            },
            reminders: ReminderConfig {
                sweep_enabled: true,
                sweep_interval_secs: 300,
                batch_size: 50,
            },
            detection: DetectionConfig::default(),
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "anthropic" => Ok(Self::Anthropic),
            "ollama" => Ok(Self::Ollama),
            other => Err(ConfigError::Validation(format!(
                "unsupported llm provider `{other}` (expected openai|anthropic|ollama)"
            ))),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch)?;
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("crewflow.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) -> Result<(), ConfigError> {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(llm) = patch.llm {
            if let Some(provider) = llm.provider {
                self.llm.provider = provider;
            }
            if let Some(api_key) = llm.api_key {
                self.llm.api_key = Some(secret_value(api_key));
            }
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = Some(base_url);
            }
            if let Some(model) = llm.model {
                self.llm.model = model;
            }
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(webhook) = patch.webhook {
            if let Some(shared_secret) = webhook.shared_secret {
                self.webhook.shared_secret = Some(secret_value(shared_secret));
            }
            if let Some(signing_secret) = webhook.signing_secret {
                self.webhook.signing_secret = Some(secret_value(signing_secret));
            }
        }

        if let Some(integrations) = patch.integrations {
            if let Some(url) = integrations.communication_url {
                self.integrations.communication_url = Some(url);
            }
            if let Some(url) = integrations.crm_api_base_url {
                self.integrations.crm_api_base_url = Some(url);
            }
            if let Some(token) = integrations.crm_api_token {
                self.integrations.crm_api_token = Some(secret_value(token));
            }
            if let Some(url) = integrations.knowledge_base_url {
                self.integrations.knowledge_base_url = Some(url);
            }
            if let Some(timeout_secs) = integrations.request_timeout_secs {
                self.integrations.request_timeout_secs = timeout_secs;
            }
        }

        if let Some(queue) = patch.queue {
            if let Some(worker_enabled) = queue.worker_enabled {
                self.queue.worker_enabled = worker_enabled;
            }
            if let Some(worker_id) = queue.worker_id {
                self.queue.worker_id = worker_id;
            }
            if let Some(poll_interval_secs) = queue.poll_interval_secs {
                self.queue.poll_interval_secs = poll_interval_secs;
            }
            if let Some(batch_size) = queue.batch_size {
                self.queue.batch_size = batch_size;
            }
            if let Some(claim_timeout_secs) = queue.claim_timeout_secs {
                self.queue.claim_timeout_secs = claim_timeout_secs;
            }
        }

        if let Some(reminders) = patch.reminders {
            if let Some(sweep_enabled) = reminders.sweep_enabled {
                self.reminders.sweep_enabled = sweep_enabled;
            }
            if let Some(sweep_interval_secs) = reminders.sweep_interval_secs {
                self.reminders.sweep_interval_secs = sweep_interval_secs;
            }
            if let Some(batch_size) = reminders.batch_size {
                self.reminders.batch_size = batch_size;
            }
        }

        if let Some(detection) = patch.detection {
            if let Some(action_types) = detection.auto_approved_action_types {
                self.detection.auto_approved_action_types = action_types
                    .iter()
                    .map(|raw| parse_action_type("detection.auto_approved_action_types", raw))
                    .collect::<Result<_, _>>()?;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }

        Ok(())
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("CREWFLOW_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("CREWFLOW_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_u32("CREWFLOW_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("CREWFLOW_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("CREWFLOW_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("CREWFLOW_LLM_PROVIDER") {
            self.llm.provider = value.parse()?;
        }
        if let Some(value) = read_env("CREWFLOW_LLM_API_KEY") {
            self.llm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("CREWFLOW_LLM_BASE_URL") {
            self.llm.base_url = Some(value);
        }
        if let Some(value) = read_env("CREWFLOW_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("CREWFLOW_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_u64("CREWFLOW_LLM_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("CREWFLOW_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("CREWFLOW_SERVER_PORT") {
            self.server.port = parse_u16("CREWFLOW_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("CREWFLOW_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("CREWFLOW_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        if let Some(value) = read_env("CREWFLOW_WEBHOOK_SHARED_SECRET") {
            self.webhook.shared_secret = Some(secret_value(value));
        }
        if let Some(value) = read_env("CREWFLOW_WEBHOOK_SIGNING_SECRET") {
            self.webhook.signing_secret = Some(secret_value(value));
        }

        if let Some(value) = read_env("CREWFLOW_INTEGRATIONS_COMMUNICATION_URL") {
            self.integrations.communication_url = Some(value);
        }
        if let Some(value) = read_env("CREWFLOW_INTEGRATIONS_CRM_API_BASE_URL") {
            self.integrations.crm_api_base_url = Some(value);
        }
        if let Some(value) = read_env("CREWFLOW_INTEGRATIONS_CRM_API_TOKEN") {
            self.integrations.crm_api_token = Some(secret_value(value));
        }
        if let Some(value) = read_env("CREWFLOW_INTEGRATIONS_KNOWLEDGE_BASE_URL") {
            self.integrations.knowledge_base_url = Some(value);
        }
        if let Some(value) = read_env("CREWFLOW_INTEGRATIONS_REQUEST_TIMEOUT_SECS") {
            self.integrations.request_timeout_secs =
                parse_u64("CREWFLOW_INTEGRATIONS_REQUEST_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("CREWFLOW_QUEUE_WORKER_ENABLED") {
            self.queue.worker_enabled = parse_bool("CREWFLOW_QUEUE_WORKER_ENABLED", &value)?;
        }
        if let Some(value) = read_env("CREWFLOW_QUEUE_WORKER_ID") {
            self.queue.worker_id = value;
        }
        if let Some(value) = read_env("CREWFLOW_QUEUE_POLL_INTERVAL_SECS") {
            self.queue.poll_interval_secs =
                parse_u64("CREWFLOW_QUEUE_POLL_INTERVAL_SECS", &value)?;
        }
        if let Some(value) = read_env("CREWFLOW_QUEUE_BATCH_SIZE") {
            self.queue.batch_size = parse_u32("CREWFLOW_QUEUE_BATCH_SIZE", &value)?;
        }
        if let Some(value) = read_env("CREWFLOW_QUEUE_CLAIM_TIMEOUT_SECS") {
            self.queue.claim_timeout_secs =
                parse_u64("CREWFLOW_QUEUE_CLAIM_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("CREWFLOW_REMINDERS_SWEEP_ENABLED") {
            self.reminders.sweep_enabled = parse_bool("CREWFLOW_REMINDERS_SWEEP_ENABLED", &value)?;
        }
        if let Some(value) = read_env("CREWFLOW_REMINDERS_SWEEP_INTERVAL_SECS") {
            self.reminders.sweep_interval_secs =
                parse_u64("CREWFLOW_REMINDERS_SWEEP_INTERVAL_SECS", &value)?;
        }
        if let Some(value) = read_env("CREWFLOW_REMINDERS_BATCH_SIZE") {
            self.reminders.batch_size = parse_u32("CREWFLOW_REMINDERS_BATCH_SIZE", &value)?;
        }

        if let Some(value) = read_env("CREWFLOW_DETECTION_AUTO_APPROVED_ACTION_TYPES") {
            self.detection.auto_approved_action_types = value
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(|item| parse_action_type("CREWFLOW_DETECTION_AUTO_APPROVED_ACTION_TYPES", item))
                .collect::<Result<_, _>>()?;
        }

        let log_level =
            read_env("CREWFLOW_LOGGING_LEVEL").or_else(|| read_env("CREWFLOW_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("CREWFLOW_LOGGING_FORMAT").or_else(|| read_env("CREWFLOW_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(llm_provider) = overrides.llm_provider {
            self.llm.provider = llm_provider;
        }
        if let Some(llm_model) = overrides.llm_model {
            self.llm.model = llm_model;
        }
        if let Some(port) = overrides.server_port {
            self.server.port = port;
        }
        if let Some(worker_enabled) = overrides.queue_worker_enabled {
            self.queue.worker_enabled = worker_enabled;
        }
        if let Some(sweep_enabled) = overrides.reminder_sweep_enabled {
            self.reminders.sweep_enabled = sweep_enabled;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_llm(&self.llm)?;
        validate_server(&self.server)?;
        validate_webhook(&self.webhook)?;
        validate_integrations(&self.integrations)?;
        validate_queue(&self.queue)?;
        validate_reminders(&self.reminders)?;
        validate_detection(&self.detection)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("crewflow.toml"), PathBuf::from("config/crewflow.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    if llm.timeout_secs == 0 || llm.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "llm.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    if llm.model.trim().is_empty() {
        return Err(ConfigError::Validation("llm.model must not be empty".to_string()));
    }

    match llm.provider {
        LlmProvider::OpenAi | LlmProvider::Anthropic => {
            let missing = llm
                .api_key
                .as_ref()
                .map(|value| value.expose_secret().trim().is_empty())
                .unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.api_key is required for openai/anthropic providers".to_string(),
                ));
            }
        }
        LlmProvider::Ollama => {
            let missing =
                llm.base_url.as_ref().map(|value| value.trim().is_empty()).unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.base_url is required for ollama provider".to_string(),
                ));
            }
        }
    }

    if let Some(base_url) = &llm.base_url {
        validate_http_url("llm.base_url", base_url)?;
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_webhook(webhook: &WebhookConfig) -> Result<(), ConfigError> {
    let blank = |secret: &Option<SecretString>| {
        secret.as_ref().is_some_and(|value| value.expose_secret().trim().is_empty())
    };

    if blank(&webhook.shared_secret) {
        return Err(ConfigError::Validation(
            "webhook.shared_secret must not be blank when set".to_string(),
        ));
    }
    if blank(&webhook.signing_secret) {
        return Err(ConfigError::Validation(
            "webhook.signing_secret must not be blank when set".to_string(),
        ));
    }

    Ok(())
}

fn validate_integrations(integrations: &IntegrationsConfig) -> Result<(), ConfigError> {
    if let Some(url) = &integrations.communication_url {
        validate_http_url("integrations.communication_url", url)?;
    }
    if let Some(url) = &integrations.crm_api_base_url {
        validate_http_url("integrations.crm_api_base_url", url)?;
    }
    if let Some(url) = &integrations.knowledge_base_url {
        validate_http_url("integrations.knowledge_base_url", url)?;
    }

    if integrations.request_timeout_secs == 0 || integrations.request_timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "integrations.request_timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_queue(queue: &QueueConfig) -> Result<(), ConfigError> {
    if queue.worker_id.trim().is_empty() {
        return Err(ConfigError::Validation("queue.worker_id must not be empty".to_string()));
    }
    if queue.poll_interval_secs == 0 {
        return Err(ConfigError::Validation(
            "queue.poll_interval_secs must be greater than zero".to_string(),
        ));
    }
    if queue.batch_size == 0 || queue.batch_size > 500 {
        return Err(ConfigError::Validation("queue.batch_size must be in range 1..=500".to_string()));
    }
    if queue.claim_timeout_secs < 30 {
        return Err(ConfigError::Validation(
            "queue.claim_timeout_secs must be at least 30".to_string(),
        ));
    }

    Ok(())
}

fn validate_reminders(reminders: &ReminderConfig) -> Result<(), ConfigError> {
    if reminders.sweep_interval_secs == 0 {
        return Err(ConfigError::Validation(
            "reminders.sweep_interval_secs must be greater than zero".to_string(),
        ));
    }
    if reminders.batch_size == 0 {
        return Err(ConfigError::Validation(
            "reminders.batch_size must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_detection(detection: &DetectionConfig) -> Result<(), ConfigError> {
    for action_type in &detection.auto_approved_action_types {
        if matches!(action_type, ActionType::HumanReview | ActionType::SetFutureReminder) {
            return Err(ConfigError::Validation(format!(
                "detection.auto_approved_action_types cannot include `{}`",
                action_type.as_str()
            )));
        }
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn validate_http_url(key: &str, url: &str) -> Result<(), ConfigError> {
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(ConfigError::Validation(format!("{key} must start with http:// or https://")));
    }
    Ok(())
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_action_type(key: &str, value: &str) -> Result<ActionType, ConfigError> {
    ActionType::parse(value).ok_or_else(|| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.parse::<bool>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    llm: Option<LlmPatch>,
    server: Option<ServerPatch>,
    webhook: Option<WebhookPatch>,
    integrations: Option<IntegrationsPatch>,
    queue: Option<QueuePatch>,
    reminders: Option<ReminderPatch>,
    detection: Option<DetectionPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    provider: Option<LlmProvider>,
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct WebhookPatch {
    shared_secret: Option<String>,
    signing_secret: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct IntegrationsPatch {
    communication_url: Option<String>,
    crm_api_base_url: Option<String>,
    crm_api_token: Option<String>,
    knowledge_base_url: Option<String>,
    request_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct QueuePatch {
    worker_enabled: Option<bool>,
    worker_id: Option<String>,
    poll_interval_secs: Option<u64>,
    batch_size: Option<u32>,
    claim_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ReminderPatch {
    sweep_enabled: Option<bool>,
    sweep_interval_secs: Option<u64>,
    batch_size: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct DetectionPatch {
    auto_approved_action_types: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{AppConfig, ConfigError, ConfigOverrides, LlmProvider, LoadOptions, LogFormat};
    use crate::domain::action::ActionType;

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn defaults_are_valid_without_any_file_or_env() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let config = AppConfig::load(LoadOptions::default())
            .map_err(|err| format!("config load failed: {err}"))?;

        ensure(config.llm.provider == LlmProvider::Ollama, "default provider should be ollama")?;
        ensure(!config.webhook.requires_authentication(), "webhook auth is opt-in")?;
        ensure(config.queue.claim_timeout_secs == 600, "default claim timeout is ten minutes")?;
        ensure(
            config.detection.auto_approved_action_types.is_empty(),
            "every action type needs approval by default",
        )
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_CREWFLOW_WEBHOOK_SECRET", "shh-from-env");
        env::set_var("TEST_CREWFLOW_CRM_TOKEN", "crm-token-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("crewflow.toml");
            fs::write(
                &path,
                r#"
[webhook]
shared_secret = "${TEST_CREWFLOW_WEBHOOK_SECRET}"

[integrations]
crm_api_base_url = "https://crm.example.com"
crm_api_token = "${TEST_CREWFLOW_CRM_TOKEN}"

[detection]
auto_approved_action_types = ["message", "timeline-update"]
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config
                    .webhook
                    .shared_secret
                    .as_ref()
                    .is_some_and(|secret| secret.expose_secret() == "shh-from-env"),
                "webhook secret should be loaded from environment",
            )?;
            ensure(
                config
                    .integrations
                    .crm_api_token
                    .as_ref()
                    .is_some_and(|token| token.expose_secret() == "crm-token-from-env"),
                "crm token should be loaded from environment",
            )?;
            ensure(
                config.detection.is_auto_approved(ActionType::TimelineUpdate),
                "timeline updates should be auto approved",
            )?;
            Ok(())
        })();

        clear_vars(&["TEST_CREWFLOW_WEBHOOK_SECRET", "TEST_CREWFLOW_CRM_TOKEN"]);
        result
    }

    #[test]
    fn logging_env_aliases_are_supported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CREWFLOW_LOG_LEVEL", "warn");
        env::set_var("CREWFLOW_LOG_FORMAT", "json");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.logging.level == "warn", "warning log level should be set from env var")?;
            ensure(
                matches!(config.logging.format, LogFormat::Json),
                "json logging format should be set from env var",
            )?;
            Ok(())
        })();

        clear_vars(&["CREWFLOW_LOG_LEVEL", "CREWFLOW_LOG_FORMAT"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CREWFLOW_DATABASE_URL", "sqlite://from-env.db");
        env::set_var("CREWFLOW_QUEUE_BATCH_SIZE", "7");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("crewflow.toml");
            fs::write(
                &path,
                r#"
[database]
url = "sqlite://from-file.db"

[queue]
batch_size = 3
poll_interval_secs = 5

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    database_url: Some("sqlite://from-override.db".to_string()),
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.database.url == "sqlite://from-override.db",
                "override database url should win",
            )?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            ensure(config.queue.batch_size == 7, "env batch size should win over file")?;
            ensure(config.queue.poll_interval_secs == 5, "file value should win over default")?;
            Ok(())
        })();

        clear_vars(&["CREWFLOW_DATABASE_URL", "CREWFLOW_QUEUE_BATCH_SIZE"]);
        result
    }

    #[test]
    fn validation_fails_fast_with_actionable_error() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CREWFLOW_LLM_PROVIDER", "openai");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => {
                    return Err("expected validation failure but config load succeeded".to_string())
                }
                Err(error) => error,
            };
            let has_message = matches!(
                error,
                ConfigError::Validation(ref message) if message.contains("llm.api_key")
            );
            ensure(has_message, "validation failure should mention llm.api_key")
        })();

        clear_vars(&["CREWFLOW_LLM_PROVIDER"]);
        result
    }

    #[test]
    fn human_review_cannot_be_auto_approved() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CREWFLOW_DETECTION_AUTO_APPROVED_ACTION_TYPES", "message, human_review");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => return Err("human_review must be rejected".to_string()),
                Err(error) => error,
            };
            ensure(
                matches!(
                    error,
                    ConfigError::Validation(ref message) if message.contains("human_review")
                ),
                "validation failure should name the offending action type",
            )
        })();

        clear_vars(&["CREWFLOW_DETECTION_AUTO_APPROVED_ACTION_TYPES"]);
        result
    }

    #[test]
    fn invalid_numeric_env_override_is_reported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CREWFLOW_SERVER_PORT", "eighty");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => return Err("non-numeric port must be rejected".to_string()),
                Err(error) => error,
            };
            ensure(
                matches!(
                    error,
                    ConfigError::InvalidEnvOverride { ref key, .. } if key == "CREWFLOW_SERVER_PORT"
                ),
                "error should name the env key",
            )
        })();

        clear_vars(&["CREWFLOW_SERVER_PORT"]);
        result
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CREWFLOW_LLM_API_KEY", "sk-secret-value");
        env::set_var("CREWFLOW_WEBHOOK_SIGNING_SECRET", "hmac-secret-value");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(!debug.contains("sk-secret-value"), "debug output should not contain api key")?;
            ensure(
                !debug.contains("hmac-secret-value"),
                "debug output should not contain signing secret",
            )?;
            ensure(
                matches!(config.logging.format, LogFormat::Compact),
                "default logging format should be compact",
            )?;
            Ok(())
        })();

        clear_vars(&["CREWFLOW_LLM_API_KEY", "CREWFLOW_WEBHOOK_SIGNING_SECRET"]);
        result
    }
}
