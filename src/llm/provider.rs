//! Provider-specific configuration and detection.
//!
//! This module handles differences between LLM API providers, including
//! URL patterns and authentication.

/// Supported LLM providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    /// Google Gemini (generativelanguage.googleapis.com)
    Gemini,
    /// `OpenAI` (api.openai.com)
    OpenAI,
    /// `OpenRouter` (openrouter.ai)
    OpenRouter,
    /// Groq (groq.com)
    Groq,
    /// Generic OpenAI-compatible provider
    Generic,
}

impl Provider {
    /// Detect provider from base URL.
    ///
    /// # Example
    ///
    /// ```rust
    /// use convo_search::llm::Provider;
    ///
    /// let provider = Provider::detect_from_url("https://api.openai.com");
    /// assert_eq!(provider, Provider::OpenAI);
    /// ```
    #[must_use]
    pub fn detect_from_url(base_url: &str) -> Self {
        let lower = base_url.to_lowercase();

        if lower.contains("generativelanguage.googleapis.com") {
            Self::Gemini
        } else if lower.contains("openrouter.ai") {
            Self::OpenRouter
        } else if lower.contains("groq.com") {
            Self::Groq
        } else if lower.contains("openai.com") {
            Self::OpenAI
        } else {
            Self::Generic
        }
    }

    /// Whether the provider accepts a live web-search option on chat calls.
    #[must_use]
    pub fn supports_grounding(self) -> bool {
        matches!(self, Self::Gemini | Self::OpenAI | Self::OpenRouter)
    }

    /// Build the completion URL for this provider.
    ///
    /// # Arguments
    ///
    /// * `base_url` - The base URL (trailing slash tolerated)
    /// * `model` - The model name (part of the path for Gemini only)
    #[must_use]
    pub fn build_url(self, base_url: &str, model: &str) -> String {
        let base = base_url.trim_end_matches('/');

        match self {
            Self::Gemini => format!("{base}/v1beta/models/{model}:generateContent"),
            Self::OpenRouter => format!("{base}/api/v1/chat/completions"),
            Self::Groq => format!("{base}/openai/v1/chat/completions"),
            Self::OpenAI | Self::Generic => format!("{base}/v1/chat/completions"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_gemini() {
        let provider = Provider::detect_from_url("https://generativelanguage.googleapis.com");
        assert_eq!(provider, Provider::Gemini);
    }

    #[test]
    fn test_detect_openai() {
        let provider = Provider::detect_from_url("https://api.openai.com");
        assert_eq!(provider, Provider::OpenAI);
    }

    #[test]
    fn test_detect_openrouter() {
        let provider = Provider::detect_from_url("https://openrouter.ai");
        assert_eq!(provider, Provider::OpenRouter);
    }

    #[test]
    fn test_detect_groq() {
        let provider = Provider::detect_from_url("https://api.groq.com");
        assert_eq!(provider, Provider::Groq);
    }

    #[test]
    fn test_detect_generic() {
        let provider = Provider::detect_from_url("http://localhost:11434");
        assert_eq!(provider, Provider::Generic);
        assert!(!provider.supports_grounding());
    }

    #[test]
    fn test_build_url_gemini() {
        let url = Provider::Gemini.build_url(
            "https://generativelanguage.googleapis.com/",
            "gemini-2.0-flash",
        );
        assert_eq!(
            url,
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:generateContent"
        );
    }

    #[test]
    fn test_build_url_openai() {
        let url = Provider::OpenAI.build_url("https://api.openai.com", "gpt-4o-mini");
        assert_eq!(url, "https://api.openai.com/v1/chat/completions");
    }
}
