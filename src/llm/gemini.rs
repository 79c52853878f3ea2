//! Google Gemini `generateContent` driver.

use serde_json::{Value, json};
use tracing::debug;

use super::{GenerationRequest, GenerativeProvider, LlmError, LlmSettings, MessageRole};

/// Driver for the Gemini REST API.
///
/// Grounded requests attach the `google_search` tool; ungrounded ones ask for
/// an `application/json` reply instead (the API does not allow both).
#[derive(Clone)]
pub struct GeminiDriver {
    http: reqwest::Client,
    settings: LlmSettings,
}

impl std::fmt::Debug for GeminiDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiDriver")
            .field("settings", &self.settings)
            .finish()
    }
}

impl GeminiDriver {
    pub fn new(settings: LlmSettings) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| LlmError::Transport(e.to_string()))?;
        Ok(Self { http, settings })
    }

    fn body(&self, req: &GenerationRequest) -> Value {
        let contents: Vec<Value> = req
            .messages
            .iter()
            .map(|m| {
                let role = match m.role {
                    MessageRole::User => "user",
                    MessageRole::Assistant => "model",
                };
                json!({ "role": role, "parts": [{ "text": m.content }] })
            })
            .collect();

        let mut generation = json!({
            "temperature": self.settings.temperature,
            "maxOutputTokens": self.settings.max_output_tokens,
        });
        if req.json_reply && !req.grounded {
            generation["responseMimeType"] = json!("application/json");
        }

        let mut body = json!({
            "systemInstruction": { "parts": [{ "text": req.system }] },
            "contents": contents,
            "generationConfig": generation,
        });
        if req.grounded {
            body["tools"] = json!([{ "google_search": {} }]);
        }
        body
    }
}

/// Concatenate the text parts of the first candidate.
fn candidate_text(v: &Value) -> Option<String> {
    let parts = v["candidates"][0]["content"]["parts"].as_array()?;
    let text: String = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(Value::as_str))
        .collect();
    (!text.is_empty()).then_some(text)
}

#[async_trait::async_trait]
impl GenerativeProvider for GeminiDriver {
    async fn generate(&self, req: &GenerationRequest, api_key: &str) -> Result<String, LlmError> {
        let url = self
            .settings
            .provider
            .build_url(&self.settings.base_url, &self.settings.model);

        debug!(model = %self.settings.model, grounded = req.grounded, "gemini request");
        let resp = self
            .http
            .post(&url)
            .header("x-goog-api-key", api_key)
            .json(&self.body(req))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(LlmError::from_status(status.as_u16(), &text));
        }

        let v: Value = resp.json().await?;
        candidate_text(&v).ok_or_else(|| {
            let reason = v["candidates"][0]["finishReason"]
                .as_str()
                .unwrap_or("no candidates");
            LlmError::Decode(format!("empty candidate ({reason})"))
        })
    }
}
