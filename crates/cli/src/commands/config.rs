use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crewflow_core::config::{AppConfig, LoadOptions};
use secrecy::{ExposeSecret, SecretString};
use toml::Value;

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let entries = effective_entries(&config);
    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for (key_path, value, env_keys) in entries {
        let source =
            field_source(key_path, env_keys, config_file_doc.as_ref(), config_file_path.as_deref());
        lines.push(render_line(key_path, &value, source));
    }

    lines.join("\n")
}

type Entry = (&'static str, String, &'static [&'static str]);

fn entry(key_path: &'static str, value: String, env_keys: &'static [&'static str]) -> Entry {
    (key_path, value, env_keys)
}

fn effective_entries(config: &AppConfig) -> Vec<Entry> {
    let auto_approved = config
        .detection
        .auto_approved_action_types
        .iter()
        .map(|action_type| action_type.as_str())
        .collect::<Vec<_>>()
        .join(",");

    vec![
        entry("database.url", config.database.url.clone(), &["CREWFLOW_DATABASE_URL"]),
        entry(
            "database.max_connections",
            config.database.max_connections.to_string(),
            &["CREWFLOW_DATABASE_MAX_CONNECTIONS"],
        ),
        entry(
            "database.timeout_secs",
            config.database.timeout_secs.to_string(),
            &["CREWFLOW_DATABASE_TIMEOUT_SECS"],
        ),
        entry("llm.provider", format!("{:?}", config.llm.provider), &["CREWFLOW_LLM_PROVIDER"]),
        entry("llm.model", config.llm.model.clone(), &["CREWFLOW_LLM_MODEL"]),
        entry(
            "llm.base_url",
            config.llm.base_url.clone().unwrap_or_else(|| "<unset>".to_string()),
            &["CREWFLOW_LLM_BASE_URL"],
        ),
        entry("llm.api_key", redact(config.llm.api_key.as_ref()), &["CREWFLOW_LLM_API_KEY"]),
        entry("server.bind_address", config.server.bind_address.clone(), &["CREWFLOW_SERVER_BIND_ADDRESS"]),
        entry("server.port", config.server.port.to_string(), &["CREWFLOW_SERVER_PORT"]),
        entry(
            "webhook.shared_secret",
            redact(config.webhook.shared_secret.as_ref()),
            &["CREWFLOW_WEBHOOK_SHARED_SECRET"],
        ),
        entry(
            "webhook.signing_secret",
            redact(config.webhook.signing_secret.as_ref()),
            &["CREWFLOW_WEBHOOK_SIGNING_SECRET"],
        ),
        entry(
            "integrations.communication_url",
            config
                .integrations
                .communication_url
                .clone()
                .unwrap_or_else(|| "<unset>".to_string()),
            &["CREWFLOW_INTEGRATIONS_COMMUNICATION_URL"],
        ),
        entry(
            "integrations.crm_api_base_url",
            config.integrations.crm_api_base_url.clone().unwrap_or_else(|| "<unset>".to_string()),
            &["CREWFLOW_INTEGRATIONS_CRM_API_BASE_URL"],
        ),
        entry(
            "integrations.crm_api_token",
            redact(config.integrations.crm_api_token.as_ref()),
            &["CREWFLOW_INTEGRATIONS_CRM_API_TOKEN"],
        ),
        entry(
            "queue.worker_enabled",
            config.queue.worker_enabled.to_string(),
            &["CREWFLOW_QUEUE_WORKER_ENABLED"],
        ),
        entry("queue.batch_size", config.queue.batch_size.to_string(), &["CREWFLOW_QUEUE_BATCH_SIZE"]),
        entry(
            "reminders.sweep_enabled",
            config.reminders.sweep_enabled.to_string(),
            &["CREWFLOW_REMINDERS_SWEEP_ENABLED"],
        ),
        entry(
            "reminders.sweep_interval_secs",
            config.reminders.sweep_interval_secs.to_string(),
            &["CREWFLOW_REMINDERS_SWEEP_INTERVAL_SECS"],
        ),
        entry(
            "detection.auto_approved_action_types",
            if auto_approved.is_empty() { "<none>".to_string() } else { auto_approved },
            &["CREWFLOW_DETECTION_AUTO_APPROVED_ACTION_TYPES"],
        ),
        entry(
            "logging.level",
            config.logging.level.clone(),
            &["CREWFLOW_LOGGING_LEVEL", "CREWFLOW_LOG_LEVEL"],
        ),
        entry(
            "logging.format",
            format!("{:?}", config.logging.format),
            &["CREWFLOW_LOGGING_FORMAT", "CREWFLOW_LOG_FORMAT"],
        ),
    ]
}

fn detect_config_path() -> Option<PathBuf> {
    [PathBuf::from("crewflow.toml"), PathBuf::from("config/crewflow.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_keys: &[&str],
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_keys.iter().find(|key| env::var_os(key).is_some()) {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

fn redact(secret: Option<&SecretString>) -> String {
    match secret {
        None => "<unset>".to_string(),
        Some(secret) if secret.expose_secret().trim().is_empty() => "<empty>".to_string(),
        Some(_) => "<redacted>".to_string(),
    }
}
