//! OpenAI Chat Completions API driver.
//!
//! Implements [`GenerativeProvider`] against `/v1/chat/completions` with a
//! single non-streaming request per turn.

use serde_json::{Value, json};
use tracing::debug;

use super::{GenerationRequest, GenerativeProvider, LlmError, LlmSettings, MessageRole};

/// Driver for the OpenAI Chat Completions API.
#[derive(Clone)]
pub struct ChatCompletionsDriver {
    http: reqwest::Client,
    settings: LlmSettings,
}

impl std::fmt::Debug for ChatCompletionsDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatCompletionsDriver")
            .field("settings", &self.settings)
            .finish()
    }
}

impl ChatCompletionsDriver {
    /// Create a new Chat Completions driver with the given settings.
    pub fn new(settings: LlmSettings) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| LlmError::Transport(e.to_string()))?;
        Ok(Self { http, settings })
    }

    fn body(&self, req: &GenerationRequest) -> Value {
        let mut messages = Vec::with_capacity(req.messages.len() + 1);
        messages.push(json!({ "role": "system", "content": req.system }));
        for m in &req.messages {
            let role = match m.role {
                MessageRole::User => "user",
                MessageRole::Assistant => "assistant",
            };
            messages.push(json!({ "role": role, "content": m.content }));
        }

        let mut body = json!({
            "model": self.settings.model,
            "messages": messages,
            "temperature": self.settings.temperature,
            "max_tokens": self.settings.max_output_tokens,
        });
        // Search-enabled chat models reject response_format, so only one of the two is set.
        if req.grounded && self.settings.provider.supports_grounding() {
            body["web_search_options"] = json!({});
        } else if req.json_reply {
            body["response_format"] = json!({ "type": "json_object" });
        }
        body
    }
}

#[async_trait::async_trait]
impl GenerativeProvider for ChatCompletionsDriver {
    async fn generate(&self, req: &GenerationRequest, api_key: &str) -> Result<String, LlmError> {
        let url = self
            .settings
            .provider
            .build_url(&self.settings.base_url, &self.settings.model);

        debug!(model = %self.settings.model, grounded = req.grounded, "chat completion request");
        let resp = self
            .http
            .post(&url)
            .bearer_auth(api_key)
            .json(&self.body(req))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(LlmError::from_status(status.as_u16(), &text));
        }

        let v: Value = resp.json().await?;
        v["choices"][0]["message"]["content"]
            .as_str()
            .map(ToString::to_string)
            .ok_or_else(|| LlmError::Decode("missing choices[0].message.content".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::llm::{ChatMessage, Provider};

    fn driver(base_url: &str) -> ChatCompletionsDriver {
        ChatCompletionsDriver::new(LlmSettings {
            base_url: base_url.into(),
            model: "gpt-4o-mini".into(),
            temperature: 0.4,
            max_output_tokens: 512,
            timeout: Duration::from_secs(5),
            provider: Provider::detect_from_url(base_url),
        })
        .unwrap()
    }

    fn request(grounded: bool) -> GenerationRequest {
        GenerationRequest {
            system: "be brief".into(),
            messages: vec![ChatMessage::user("hi"), ChatMessage::assistant("hello")],
            grounded,
            json_reply: true,
        }
    }

    #[test]
    fn test_body_shape() {
        let body = driver("https://api.openai.com").body(&request(false));
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][2]["role"], "assistant");
        assert_eq!(body["response_format"]["type"], "json_object");
        assert!(body.get("web_search_options").is_none());
    }

    #[test]
    fn test_grounded_body_uses_web_search() {
        let body = driver("https://api.openai.com").body(&request(true));
        assert!(body.get("web_search_options").is_some());
        assert!(body.get("response_format").is_none());
    }

    #[test]
    fn test_grounding_ignored_for_generic_backend() {
        let body = driver("http://localhost:11434").body(&request(true));
        assert!(body.get("web_search_options").is_none());
    }
}
