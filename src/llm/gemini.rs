//! Google Gemini provider (free-tier cloud).

use super::{GenerateOptions, LlmError, LlmProvider, DEFAULT_LLM_TIMEOUT};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const API_ROOT: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_MODEL: &str = "gemini-2.5-flash";
/// Tried once when the default model errors for non-rate-limit reasons.
const FALLBACK_MODEL: &str = "gemini-2.0-flash";

pub struct GeminiProvider {
    client: Client,
    api_key: String,
    model: String,
    timeout: Duration,
}

impl GeminiProvider {
    pub fn new(api_key: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            model: DEFAULT_MODEL.to_string(),
            timeout: DEFAULT_LLM_TIMEOUT,
        }
    }

    pub fn with_model(mut self, model: String) -> Self {
        self.model = model;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn send_generate(
        &self,
        model: &str,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<String, LlmError> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            API_ROOT, model, self.api_key
        );

        let request = GenerateContentRequest {
            contents: vec![Content {
                parts: vec![Part {
                    text: prompt.to_string(),
                }],
            }],
            generation_config: GenerationConfig {
                temperature: options.temperature,
                max_output_tokens: options.max_tokens,
            },
        };

        let response = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout(self.timeout)
                } else {
                    LlmError::Network(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if is_rate_limit_response(status, &body) {
                return Err(LlmError::RateLimited(format!("Gemini ({}): {}", status, body)));
            }
            return Err(LlmError::Api(format!("Gemini error ({}): {}", status, body)));
        }

        let parsed: GenerateContentResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(format!("Failed to parse response: {}", e)))?;

        parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content.parts.into_iter().next())
            .map(|p| p.text)
            .ok_or_else(|| LlmError::InvalidResponse("No candidates in response".to_string()))
    }

    /// The default model plus one local fallback. Rate limits propagate
    /// immediately so the router can switch providers instead.
    async fn generate_with_model_fallback(
        &self,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<String, LlmError> {
        if let Some(model) = &options.model_id {
            return self.send_generate(model, prompt, options).await;
        }

        match self.send_generate(&self.model, prompt, options).await {
            Err(LlmError::Api(msg)) => {
                log::warn!(
                    "Gemini model {} failed ({}), retrying with {}",
                    self.model,
                    msg,
                    FALLBACK_MODEL
                );
                self.send_generate(FALLBACK_MODEL, prompt, options).await
            }
            other => other,
        }
    }
}

fn is_rate_limit_response(status: reqwest::StatusCode, body: &str) -> bool {
    status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || body.contains("RESOURCE_EXHAUSTED")
        || body.to_lowercase().contains("quota")
}

#[derive(Debug, Serialize)]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    text: String,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    temperature: f32,
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Content,
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    async fn is_available(&self) -> bool {
        !self.api_key.is_empty()
    }

    async fn generate(
        &self,
        prompt: &str,
        options: &GenerateOptions,
        cancel: &CancellationToken,
    ) -> Result<String, LlmError> {
        if self.api_key.is_empty() {
            return Err(LlmError::NoApiKey("gemini".to_string()));
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(LlmError::Cancelled),
            result = self.generate_with_model_fallback(prompt, options) => result,
        }
    }

    fn name(&self) -> &'static str {
        "gemini"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_name() {
        assert_eq!(GeminiProvider::new(String::new()).name(), "gemini");
    }

    #[tokio::test]
    async fn test_availability_requires_api_key() {
        assert!(!GeminiProvider::new(String::new()).is_available().await);
        assert!(GeminiProvider::new("key".to_string()).is_available().await);
    }

    #[tokio::test]
    async fn test_missing_key_is_no_api_key_error() {
        let provider = GeminiProvider::new(String::new());
        let err = provider
            .generate("prompt", &GenerateOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::NoApiKey(_)));
    }

    #[test]
    fn test_rate_limit_classification() {
        assert!(is_rate_limit_response(
            reqwest::StatusCode::TOO_MANY_REQUESTS,
            ""
        ));
        assert!(is_rate_limit_response(
            reqwest::StatusCode::FORBIDDEN,
            r#"{"error":{"status":"RESOURCE_EXHAUSTED"}}"#
        ));
        assert!(is_rate_limit_response(
            reqwest::StatusCode::BAD_REQUEST,
            "Quota exceeded for project"
        ));
        assert!(!is_rate_limit_response(
            reqwest::StatusCode::INTERNAL_SERVER_ERROR,
            "backend error"
        ));
    }
}
