//! Language-model collaborator: prompt in, text out.
//!
//! The answering orchestrator only ever sees the [`LanguageModel`] trait.
//! Every failure (transport, timeout, non-2xx, unexpected body) surfaces as
//! [`DocError::AnswerGeneration`]. There are no retries.

use anyhow::bail;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::config::LlmConfig;
use crate::embedding::{api_key, http_client};
use crate::error::{DocError, Result};

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn model_name(&self) -> &str;

    async fn generate(&self, prompt: &str) -> Result<String>;
}

/// Instantiate the model named by `config.provider`.
pub fn create_model(config: &LlmConfig) -> anyhow::Result<Arc<dyn LanguageModel>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledModel)),
        "gemini" => Ok(Arc::new(GeminiModel::new(config)?)),
        "openai" => Ok(Arc::new(OpenAiChatModel::new(config)?)),
        other => bail!("Unknown llm provider: {}", other),
    }
}

pub struct DisabledModel;

#[async_trait]
impl LanguageModel for DisabledModel {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn generate(&self, _prompt: &str) -> Result<String> {
        Err(DocError::AnswerGeneration(
            "language model provider is disabled".to_string(),
        ))
    }
}

async fn send(request: reqwest::RequestBuilder, body: &Value) -> Result<Value> {
    let response = request
        .json(body)
        .send()
        .await
        .map_err(|e| DocError::AnswerGeneration(e.to_string()))?;
    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(DocError::AnswerGeneration(format!("HTTP {}: {}", status, text)));
    }
    response
        .json()
        .await
        .map_err(|e| DocError::AnswerGeneration(format!("invalid response body: {}", e)))
}

// ============ Gemini ============

/// Gemini `generateContent`. Requires `GEMINI_API_KEY`.
pub struct GeminiModel {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
}

impl GeminiModel {
    pub fn new(config: &LlmConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: http_client(config.timeout_secs)?,
            api_key: api_key("GEMINI_API_KEY")?,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| GEMINI_BASE_URL.to_string()),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }

    fn body(&self, prompt: &str) -> Value {
        let mut body = serde_json::json!({
            "contents": [{ "parts": [{ "text": prompt }] }],
        });
        let mut generation = serde_json::Map::new();
        if let Some(t) = self.temperature {
            generation.insert("temperature".into(), Value::from(t));
        }
        if let Some(m) = self.max_tokens {
            generation.insert("maxOutputTokens".into(), Value::from(m));
        }
        if !generation.is_empty() {
            body["generationConfig"] = Value::Object(generation);
        }
        body
    }
}

#[async_trait]
impl LanguageModel for GeminiModel {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
        let request = self.client.post(url).header("x-goog-api-key", &self.api_key);
        let json = send(request, &self.body(prompt)).await?;
        parse_gemini_text(&json)
    }
}

/// `candidates[0].content.parts[0].text`
fn parse_gemini_text(json: &Value) -> Result<String> {
    json.pointer("/candidates/0/content/parts/0/text")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            DocError::AnswerGeneration("response has no candidates[0] text".to_string())
        })
}

// ============ OpenAI-compatible chat ============

/// OpenAI-compatible `chat/completions` (also OpenRouter and local servers
/// via `base_url`). Requires `OPENAI_API_KEY`.
pub struct OpenAiChatModel {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
}

impl OpenAiChatModel {
    pub fn new(config: &LlmConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: http_client(config.timeout_secs)?,
            api_key: api_key("OPENAI_API_KEY")?,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| OPENAI_BASE_URL.to_string()),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }
}

#[async_trait]
impl LanguageModel for OpenAiChatModel {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
        });
        if let Some(t) = self.temperature {
            body["temperature"] = Value::from(t);
        }
        if let Some(m) = self.max_tokens {
            body["max_tokens"] = Value::from(m);
        }
        let request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key);
        let json = send(request, &body).await?;
        parse_chat_text(&json)
    }
}

/// `choices[0].message.content`
fn parse_chat_text(json: &Value) -> Result<String> {
    json.pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| DocError::AnswerGeneration("response has no choices[0] content".to_string()))
}
