//! The reasoning collaborator: text and vision completions over an
//! OpenAI-compatible chat API, plus the retry policy every call goes through.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::Client;
use serde_json::{Value, json};

use crate::config::{LlmConfig, RetryPolicy};
use crate::error::{AgentError, Result};

const SYSTEM_PROMPT: &str = "You are the reasoning core of a browser agent that \
simulates a specific online shopper. Answer tersely. When asked for JSON, return \
a single JSON object and nothing else: no markdown, no commentary.";

/// How the caller wants the reply shaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    #[default]
    Text,
    /// Ask the backend for a single JSON object.
    Json,
}

#[async_trait]
pub trait Reasoner: Send + Sync {
    async fn complete_text(&self, prompt: &str, mode: OutputMode) -> Result<String>;

    /// `image` is a PNG screenshot.
    async fn complete_vision(&self, prompt: &str, image: &[u8], mode: OutputMode)
    -> Result<String>;
}

/// Chat-completions client. One instance is shared by every job.
pub struct Brain {
    client: Client,
    api_base: String,
    api_key: String,
    model: String,
    vision_model: String,
    temperature: f32,
}

impl Brain {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| AgentError::Config("OPENAI_API_KEY not set in environment".into()))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            vision_model: config.vision_model.clone(),
            temperature: config.temperature,
        })
    }

    async fn chat(&self, model: &str, content: Value, mode: OutputMode) -> Result<String> {
        let mut body = json!({
            "model": model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": content},
            ],
            "temperature": self.temperature,
        });
        if mode == OutputMode::Json {
            body["response_format"] = json!({"type": "json_object"});
        }

        let response = self
            .client
            .post(format!("{}/chat/completions", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let json_resp: Value = response.json().await?;

        if !status.is_success() {
            let message = json_resp["error"]["message"]
                .as_str()
                .unwrap_or("Unknown API error")
                .to_string();
            tracing::warn!(status = status.as_u16(), %message, "reasoning backend rejected request");
            return Err(AgentError::ReasoningStatus {
                status: status.as_u16(),
                message,
            });
        }

        let content = json_resp["choices"][0]["message"]["content"]
            .as_str()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| AgentError::Reasoning(format!("no content in reply: {}", json_resp)))?;

        tracing::debug!(model, reply = content, "reasoning backend replied");
        Ok(content.to_string())
    }
}

#[async_trait]
impl Reasoner for Brain {
    async fn complete_text(&self, prompt: &str, mode: OutputMode) -> Result<String> {
        self.chat(&self.model, Value::String(prompt.to_string()), mode)
            .await
    }

    async fn complete_vision(
        &self,
        prompt: &str,
        image: &[u8],
        mode: OutputMode,
    ) -> Result<String> {
        let data_url = format!("data:image/png;base64,{}", STANDARD.encode(image));
        let content = json!([
            {"type": "text", "text": prompt},
            {"type": "image_url", "image_url": {"url": data_url}},
        ]);
        self.chat(&self.vision_model, content, mode).await
    }
}

/// Run `op` up to `policy.attempts` times, sleeping `base * n` after the n-th failure.
pub async fn with_retry<T, F, Fut>(policy: RetryPolicy, label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < policy.attempts => {
                let delay = policy.delay_after(attempt);
                tracing::warn!(call = label, attempt, error = %err, ?delay, "retrying reasoning call");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Strip the markdown fences models like to wrap JSON in.
pub fn strip_code_fences(content: &str) -> &str {
    content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}
