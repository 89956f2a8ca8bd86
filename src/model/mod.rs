//! Chat-completion model client.
//!
//! The analysis engine only sees the [`CompletionClient`] seam; the HTTP
//! implementation targets an OpenAI-compatible `/v1/chat/completions`
//! endpoint.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::Config;

const SYSTEM_INSTRUCTION: &str = "You are an expert at analyzing forum posts. \
    Reply with a single JSON object exactly matching the shape requested in the prompt.";

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model request timed out")]
    Timeout,
    #[error("model API returned status {0}")]
    Status(u16),
    #[error("model transport failure: {0}")]
    Transport(String),
}

/// Minimal completion interface consumed by the analysis engine.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Complete a prompt, returning the raw model text.
    async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String, ModelError>;
}

/// OpenAI-compatible chat completion client.
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: String,
}

impl OpenAiClient {
    /// Build a client from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if no API key is configured or the HTTP client
    /// cannot be constructed.
    pub fn new(config: &Config) -> Result<Self> {
        let api_key = config
            .model_api_key
            .clone()
            .context("MODEL_API_KEY is required for analysis runs")?;

        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context("Failed to build model HTTP client")?;

        Ok(Self {
            http,
            base_url: config.model_base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model_name.clone(),
        })
    }
}

#[async_trait]
impl CompletionClient for OpenAiClient {
    async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String, ModelError> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_INSTRUCTION,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            max_tokens,
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };

        let url = format!("{}/v1/chat/completions", self.base_url);
        debug!(model = %self.model, prompt_chars = prompt.len(), "Requesting completion");

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ModelError::Timeout
                } else {
                    ModelError::Transport(format!("{e:#}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ModelError::Status(status.as_u16()));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ModelError::Transport(format!("{e:#}")))?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| ModelError::Transport("model response had no choices".to_string()))
    }
}
