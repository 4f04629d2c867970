//! Text generators backing the answer orchestrator.
//!
//! - **[`OllamaGenerator`]** posts to `/api/chat` with `stream: false`.
//!   The configured model name is resolved against `/api/tags` on first use.
//! - **[`OpenAiGenerator`]** posts to an OpenAI-compatible
//!   `/v1/chat/completions`.
//! - **[`DisabledGenerator`]** fails every call.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use grounded_kb_core::answer::{Generator, SharedGenerator};
use grounded_kb_core::prompt::Prompt;

use crate::config::LlmConfig;
use crate::embedding::post_json_with_retry;

const OLLAMA_URL: &str = "http://localhost:11434";
const OPENAI_URL: &str = "https://api.openai.com";
const GENERATION_RETRIES: u32 = 1;

pub fn create_generator(config: &LlmConfig) -> Result<SharedGenerator> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledGenerator)),
        "ollama" => Ok(Arc::new(OllamaGenerator::new(config)?)),
        "openai" => Ok(Arc::new(OpenAiGenerator::new(config)?)),
        other => bail!("Unknown llm provider: {}", other),
    }
}

/// Pick the model to use from what the server offers.
///
/// Order: exact name, then a model starting with the requested base name
/// (the part before `:`), then any model whose name contains `grounded`,
/// then the first model listed. With nothing available the requested name
/// is returned unchanged.
pub fn resolve_model(requested: &str, available: &[String]) -> String {
    if available.iter().any(|m| m == requested) {
        return requested.to_string();
    }

    let base = requested.split(':').next().unwrap_or(requested);
    if let Some(m) = available.iter().find(|m| m.starts_with(base)) {
        return m.clone();
    }

    if let Some(m) = available
        .iter()
        .find(|m| m.to_lowercase().contains("grounded"))
    {
        return m.clone();
    }

    available
        .first()
        .cloned()
        .unwrap_or_else(|| requested.to_string())
}

fn chat_messages(prompt: &Prompt) -> serde_json::Value {
    serde_json::json!([
        { "role": "system", "content": prompt.system },
        { "role": "user", "content": prompt.user },
    ])
}

pub struct DisabledGenerator;

#[async_trait]
impl Generator for DisabledGenerator {
    fn name(&self) -> &str {
        "disabled"
    }
    async fn generate(&self, _prompt: &Prompt) -> Result<String> {
        bail!("LLM provider is disabled; set [llm] provider in the config")
    }
}

// ============ Ollama ============

pub struct OllamaGenerator {
    client: reqwest::Client,
    url: String,
    requested: String,
    resolved: OnceCell<String>,
    temperature: f32,
    num_ctx: usize,
}

impl OllamaGenerator {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(config.timeout_secs))
                .build()?,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| OLLAMA_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            requested: config.model.clone(),
            resolved: OnceCell::new(),
            temperature: config.temperature,
            num_ctx: config.num_ctx,
        })
    }

    /// Names reported by `GET /api/tags`.
    pub async fn available_models(&self) -> Result<Vec<String>> {
        let url = format!("{}/api/tags", self.url);
        let json: serde_json::Value = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Cannot connect to Ollama at {}", self.url))?
            .error_for_status()?
            .json()
            .await?;
        Ok(json
            .get("models")
            .and_then(|m| m.as_array())
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m.get("name").and_then(|n| n.as_str()))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn model(&self) -> Result<&str> {
        let model = self
            .resolved
            .get_or_try_init(|| async {
                let available = self.available_models().await?;
                let model = resolve_model(&self.requested, &available);
                if model != self.requested {
                    warn!(requested = %self.requested, using = %model, "configured model not found");
                }
                if !model.to_lowercase().contains("grounded") {
                    warn!(model = %model, "model is not a grounded variant; expect more rejected answers");
                }
                info!(model = %model, "using Ollama model");
                Ok::<_, anyhow::Error>(model)
            })
            .await?;
        Ok(model.as_str())
    }
}

#[async_trait]
impl Generator for OllamaGenerator {
    fn name(&self) -> &str {
        self.resolved.get().map(String::as_str).unwrap_or(&self.requested)
    }

    async fn generate(&self, prompt: &Prompt) -> Result<String> {
        let model = self.model().await?;
        let body = serde_json::json!({
            "model": model,
            "stream": false,
            "messages": chat_messages(prompt),
            "options": {
                "temperature": self.temperature,
                "num_ctx": self.num_ctx,
            },
        });
        let url = format!("{}/api/chat", self.url);
        let json =
            post_json_with_retry(&self.client, &url, None, &body, GENERATION_RETRIES, "Ollama")
                .await?;
        json.pointer("/message/content")
            .and_then(|c| c.as_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("Invalid Ollama response: missing message.content"))
    }
}

// ============ OpenAI-compatible ============

pub struct OpenAiGenerator {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: Option<String>,
    temperature: f32,
}

impl OpenAiGenerator {
    /// Uses `OPENAI_API_KEY` when set; local compatible servers may not
    /// need one.
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY").ok();
        if api_key.is_none() && config.url.is_none() {
            bail!("OPENAI_API_KEY environment variable not set");
        }
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(config.timeout_secs))
                .build()?,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| OPENAI_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            model: config.model.clone(),
            api_key,
            temperature: config.temperature,
        })
    }
}

#[async_trait]
impl Generator for OpenAiGenerator {
    fn name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &Prompt) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "temperature": self.temperature,
            "messages": chat_messages(prompt),
        });
        let url = format!("{}/v1/chat/completions", self.url);
        let json = post_json_with_retry(
            &self.client,
            &url,
            self.api_key.as_deref(),
            &body,
            GENERATION_RETRIES,
            "OpenAI",
        )
        .await?;
        json.pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("LLM response did not contain any choices"))
    }
}
