use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crewflow_core::config::{LlmConfig, LlmProvider};

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;

    /// Provider label recorded on every prompt run.
    fn provider(&self) -> &str;

    fn model(&self) -> &str;
}

const ANTHROPIC_VERSION: &str = "2023-06-01";
const ANTHROPIC_MAX_TOKENS: u32 = 1024;

/// Chat-completion client for the configured provider. OpenAI and Ollama share
/// the OpenAI-compatible `/v1/chat/completions` shape.
pub struct HttpLlmClient {
    client: Client,
    provider: LlmProvider,
    base_url: String,
    model: String,
    api_key: Option<SecretString>,
}

impl HttpLlmClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .context("failed to build llm http client")?;

        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| default_base_url(config.provider).to_string())
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            client,
            provider: config.provider,
            base_url,
            model: config.model.clone(),
            api_key: config.api_key.clone(),
        })
    }

    async fn complete_chat(&self, prompt: &str) -> Result<String> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage { role: "user", content: prompt }],
            temperature: 0.0,
        };

        let mut builder =
            self.client.post(format!("{}/v1/chat/completions", self.base_url)).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key.expose_secret());
        }

        let body = send_json(builder).await?;
        let response: ChatResponse =
            serde_json::from_value(body).context("unexpected chat completion response shape")?;
        response
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| anyhow!("chat completion returned no choices"))
    }

    async fn complete_anthropic(&self, prompt: &str) -> Result<String> {
        let Some(key) = &self.api_key else {
            bail!("anthropic provider requires llm.api_key");
        };
        let request = AnthropicRequest {
            model: &self.model,
            max_tokens: ANTHROPIC_MAX_TOKENS,
            messages: vec![ChatMessage { role: "user", content: prompt }],
        };

        let builder = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", key.expose_secret())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&request);

        let body = send_json(builder).await?;
        let response: AnthropicResponse =
            serde_json::from_value(body).context("unexpected anthropic response shape")?;
        let text: String = response
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text)
            .collect();
        if text.is_empty() {
            bail!("anthropic response contained no text blocks");
        }
        Ok(text)
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        match self.provider {
            LlmProvider::OpenAi | LlmProvider::Ollama => self.complete_chat(prompt).await,
            LlmProvider::Anthropic => self.complete_anthropic(prompt).await,
        }
    }

    fn provider(&self) -> &str {
        self.provider.as_str()
    }

    fn model(&self) -> &str {
        &self.model
    }
}

fn default_base_url(provider: LlmProvider) -> &'static str {
    match provider {
        LlmProvider::OpenAi => "https://api.openai.com",
        LlmProvider::Anthropic => "https://api.anthropic.com",
        LlmProvider::Ollama => "http://localhost:11434",
    }
}

async fn send_json(builder: reqwest::RequestBuilder) -> Result<Value> {
    let response = builder.send().await.context("llm request failed")?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        bail!("llm provider returned {status}: {}", truncate(&body, 300));
    }
    response.json().await.context("llm response was not valid JSON")
}

fn truncate(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    let mut truncated: String = value.chars().take(max_chars).collect();
    truncated.push_str("...");
    truncated
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

#[derive(Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicBlock>,
}

#[derive(Deserialize)]
struct AnthropicBlock {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
}

/// Replays queued responses in order and records every prompt it receives.
/// Once the script is exhausted every call fails.
pub struct ScriptedLlmClient {
    responses: Mutex<VecDeque<Result<String, String>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedLlmClient {
    pub fn new<I>(responses: I) -> Self
    where
        I: IntoIterator<Item = Result<String, String>>,
    {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn replying<I, S>(outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(outputs.into_iter().map(|output| Ok(output.into())))
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|prompts| prompts.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.to_string());
        }
        let next = self
            .responses
            .lock()
            .map_err(|_| anyhow!("scripted llm state poisoned"))?
            .pop_front();
        match next {
            Some(Ok(output)) => Ok(output),
            Some(Err(error)) => Err(anyhow!(error)),
            None => Err(anyhow!("scripted llm has no response left")),
        }
    }

    fn provider(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        "scripted-model"
    }
}

#[cfg(test)]
mod tests {
    use crewflow_core::config::{LlmConfig, LlmProvider};

    use super::{HttpLlmClient, LlmClient, ScriptedLlmClient};

    #[tokio::test]
    async fn scripted_client_replays_in_order_then_fails() {
        let client = ScriptedLlmClient::new([Ok("first".to_string()), Err("boom".to_string())]);

        assert_eq!(client.complete("a").await.expect("first"), "first");
        assert_eq!(client.complete("b").await.expect_err("second").to_string(), "boom");
        assert!(client.complete("c").await.is_err());
        assert_eq!(client.prompts(), vec!["a", "b", "c"]);
    }

    #[test]
    fn http_client_uses_provider_default_base_url() {
        let client = HttpLlmClient::from_config(&LlmConfig {
            provider: LlmProvider::Ollama,
            api_key: None,
            base_url: None,
            model: "llama3.1".to_string(),
            timeout_secs: 30,
        })
        .expect("client");

        assert_eq!(client.base_url, "http://localhost:11434");
        assert_eq!(client.provider(), "ollama");
        assert_eq!(client.model(), "llama3.1");
    }

    #[test]
    fn configured_base_url_drops_trailing_slash() {
        let client = HttpLlmClient::from_config(&LlmConfig {
            provider: LlmProvider::OpenAi,
            api_key: None,
            base_url: Some("https://llm.internal/".to_string()),
            model: "gpt-4o-mini".to_string(),
            timeout_secs: 30,
        })
        .expect("client");

        assert_eq!(client.base_url, "https://llm.internal");
    }
}
