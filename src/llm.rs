//! Chat completion client for an OpenAI-compatible API
//!
//! Used by the classifier, the RAG engine, and the orchestrator's planner and
//! synthesis agents. Transient upstream failures are retried once on the
//! request path; workers apply their own backoff policy on top.

use crate::config::LlmConfig;
use crate::error::{CoreError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use utoipa::ToSchema;
use tracing::{debug, warn};

/// Message role in a conversation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A message in a chat exchange
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Token accounting reported by the upstream API
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, ToSchema)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Generation tunables for one call
#[derive(Debug, Clone)]
pub struct GenerationOptions {
    pub temperature: f32,
    pub max_tokens: u32,
    /// Request a JSON object response from the model
    pub json: bool,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 2048,
            json: false,
        }
    }
}

/// Response from text generation
#[derive(Debug, Clone)]
pub struct GenerationResponse {
    pub text: String,
    pub usage: TokenUsage,
    pub model: String,
}

/// Trait for chat completion backends
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Generate a completion for a conversation
    async fn generate(
        &self,
        messages: &[ChatMessage],
        options: &GenerationOptions,
    ) -> Result<GenerationResponse>;
}

/// OpenAI-compatible HTTP chat client
pub struct HttpChatClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    model: String,
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: TokenUsage,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

impl HttpChatClient {
    /// Create a client from configuration
    pub fn new(config: &LlmConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .expect("failed to create HTTP client");

        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.chat_model.clone(),
        }
    }

    async fn call(
        &self,
        messages: &[ChatMessage],
        options: &GenerationOptions,
    ) -> Result<GenerationResponse> {
        let body = ChatCompletionRequest {
            model: &self.model,
            messages,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            response_format: options.json.then_some(ResponseFormat {
                format_type: "json_object",
            }),
        };

        let url = format!("{}/chat/completions", self.base_url);
        debug!(model = %self.model, "chat completion request");

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| CoreError::TransientUpstream(format!("chat: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| format!("HTTP {}", status));
            return Err(if status.as_u16() == 429 || status.is_server_error() {
                CoreError::TransientUpstream(format!("chat ({}): {}", status, text))
            } else {
                CoreError::PermanentFailure(format!("chat ({}): {}", status, text))
            });
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| CoreError::TransientUpstream(format!("chat response: {}", e)))?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| {
                CoreError::PermanentFailure("chat response contained no choices".to_string())
            })?;

        Ok(GenerationResponse {
            text,
            usage: parsed.usage,
            model: parsed.model,
        })
    }
}

#[async_trait]
impl ChatClient for HttpChatClient {
    async fn generate(
        &self,
        messages: &[ChatMessage],
        options: &GenerationOptions,
    ) -> Result<GenerationResponse> {
        match self.call(messages, options).await {
            Ok(response) => Ok(response),
            Err(first) if first.is_transient() => {
                warn!("chat call failed, retrying once: {}", first);
                self.call(messages, options).await
            }
            Err(e) => Err(e),
        }
    }
}
