//! Generative-text backends.
//!
//! The [`GenerativeProvider`] trait is the seam between the conversation
//! engine and a concrete LLM API. Requests are single-shot (non-streaming);
//! the engine asks for one structured reply per turn.
//!
//! # Drivers
//!
//! - [`GeminiDriver`]: Google `generateContent`, grounded via the `google_search` tool
//! - [`ChatCompletionsDriver`]: `OpenAI`-compatible `/v1/chat/completions`

pub mod chat_completions;
pub mod gemini;
pub mod provider;
pub mod reply;

pub use chat_completions::ChatCompletionsDriver;
pub use gemini::GeminiDriver;
pub use provider::Provider;
pub use reply::{AssistantReply, SearchDirective};

use std::sync::Arc;
use std::time::Duration;

use crate::config::GenerativeConfig;

/// LLM connection and model settings.
#[derive(Debug, Clone)]
pub struct LlmSettings {
    /// Base URL for the LLM API.
    pub base_url: String,
    /// Model identifier (e.g., `gemini-2.0-flash`, `gpt-4o-mini`).
    pub model: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Provider type (auto-detected from `base_url`).
    pub provider: Provider,
}

impl LlmSettings {
    pub fn from_config(config: &GenerativeConfig) -> Self {
        Self {
            base_url: config.base_url.clone(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_output_tokens: config.max_output_tokens,
            timeout: Duration::from_secs(config.timeout_secs),
            provider: Provider::detect_from_url(&config.base_url),
        }
    }
}

/// Role of a message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

/// One prior turn handed to the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// Request to a [`GenerativeProvider`].
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub system: String,
    pub messages: Vec<ChatMessage>,
    /// Augment the call with live web search.
    pub grounded: bool,
    /// Ask the backend for a JSON object reply when it supports it.
    pub json_reply: bool,
}

/// Errors returned by generative backends.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// Quota or rate limit exhausted for the key in use.
    #[error("quota exhausted ({status}): {message}")]
    Quota { status: u16, message: String },

    #[error("request timed out")]
    Timeout,

    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    /// Non-retryable client error (bad request, auth, ...).
    #[error("request rejected ({status}): {message}")]
    Client { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected response: {0}")]
    Decode(String),

    #[error("no API credentials configured")]
    NoCredentials,
}

impl LlmError {
    pub fn is_quota(&self) -> bool {
        matches!(self, Self::Quota { .. })
    }

    /// Whether another attempt (possibly with another key) may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Quota { .. } | Self::Timeout | Self::Server { .. } | Self::Transport(_)
        )
    }

    /// Classify an HTTP error response.
    pub fn from_status(status: u16, body: &str) -> Self {
        let message: String = body.chars().take(300).collect();
        if status == 429 || is_exhausted_body(body) {
            Self::Quota { status, message }
        } else if status >= 500 {
            Self::Server { status, message }
        } else {
            Self::Client { status, message }
        }
    }
}

/// Structured quota markers: Gemini's `error.status` and the Chat Completions `error.code`/`error.type`.
fn is_exhausted_body(body: &str) -> bool {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
        return false;
    };
    let error = value.get("error").unwrap_or(&value);
    ["status", "code", "type"].iter().any(|field| {
        matches!(
            error.get(field).and_then(|v| v.as_str()),
            Some("RESOURCE_EXHAUSTED" | "insufficient_quota")
        )
    })
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Transport(e.to_string())
        }
    }
}

/// A generative-text backend.
#[async_trait::async_trait]
pub trait GenerativeProvider: Send + Sync + std::fmt::Debug {
    /// Produce one reply for `request` using `api_key`.
    async fn generate(&self, request: &GenerationRequest, api_key: &str)
    -> Result<String, LlmError>;
}

/// Build the driver matching the configured base URL.
pub fn build_provider(settings: LlmSettings) -> Result<Arc<dyn GenerativeProvider>, LlmError> {
    let provider: Arc<dyn GenerativeProvider> = match settings.provider {
        Provider::Gemini => Arc::new(GeminiDriver::new(settings)?),
        Provider::OpenAI | Provider::OpenRouter | Provider::Groq | Provider::Generic => {
            Arc::new(ChatCompletionsDriver::new(settings)?)
        }
    };
    Ok(provider)
}
