//! LLM post-processing for dictation transcripts.
//!
//! A [`ProviderRouter`] picks a concrete provider per request (local first),
//! and the [`PostProcessor`] wraps the whole thing in a fail-safe contract:
//! whatever goes wrong, the caller gets text back. The raw transcript is
//! always an acceptable answer.

mod gemini;
mod ollama;
mod openrouter;

pub use gemini::GeminiProvider;
pub use ollama::OllamaProvider;
pub use openrouter::OpenRouterProvider;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Default timeout for LLM API requests.
pub const DEFAULT_LLM_TIMEOUT: Duration = Duration::from_secs(30);

/// Placeholder substituted with the transcript in mode prompt templates.
pub const PROMPT_PLACEHOLDER: &str = "{{TRANSCRIPT}}";

/// Router priority when a mode has no usable preferred provider.
/// Local inference first, then the free-tier cloud, then the paid one.
const PROVIDER_PRIORITY: [&str; 3] = ["ollama", "gemini", "openrouter"];

/// Providers tried when the selected one reports a rate limit.
const RATE_LIMIT_FALLBACK_CHAIN: [&str; 2] = ["gemini", "ollama"];

/// Errors that can occur during LLM operations.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("API error: {0}")]
    Api(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("No API key configured for provider: {0}")]
    NoApiKey(String),

    #[error("Provider not available: {0}")]
    ProviderNotAvailable(String),

    #[error("Request cancelled")]
    Cancelled,
}

impl LlmError {
    /// Rate limits get a cross-provider fallback; nothing else does.
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, LlmError::RateLimited(_))
    }
}

/// Generation knobs passed through to providers.
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub temperature: f32,
    pub max_tokens: u32,
    /// Overrides the provider's default model when set.
    pub model_id: Option<String>,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            temperature: 0.3,
            max_tokens: 2048,
            model_id: None,
        }
    }
}

/// A dictation mode: prompt template plus provider preferences.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DictationMode {
    pub id: String,
    /// Template with an optional [`PROMPT_PLACEHOLDER`] slot.
    pub prompt_template: String,
    pub enable_post_processing: bool,
    #[serde(default)]
    pub preferred_provider: Option<String>,
    #[serde(default)]
    pub preferred_model_id: Option<String>,
}

impl DictationMode {
    /// Pass-through mode: no post-processing, transcripts delivered raw.
    pub fn raw() -> Self {
        Self {
            id: "raw".to_string(),
            prompt_template: String::new(),
            enable_post_processing: false,
            preferred_provider: None,
            preferred_model_id: None,
        }
    }
}

/// Trait for LLM providers that can rewrite a transcript.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Whether the provider can currently serve requests. Re-checked on
    /// every routing decision; never cached.
    async fn is_available(&self) -> bool;

    /// Run one generation. Implementations must honor `cancel` promptly.
    async fn generate(
        &self,
        prompt: &str,
        options: &GenerateOptions,
        cancel: &CancellationToken,
    ) -> Result<String, LlmError>;

    /// Stable provider name used for routing.
    fn name(&self) -> &'static str;
}

/// Picks a provider per request, local-first.
pub struct ProviderRouter {
    providers: Vec<Arc<dyn LlmProvider>>,
}

impl ProviderRouter {
    pub fn new(providers: Vec<Arc<dyn LlmProvider>>) -> Self {
        Self { providers }
    }

    fn get(&self, name: &str) -> Option<Arc<dyn LlmProvider>> {
        self.providers.iter().find(|p| p.name() == name).cloned()
    }

    /// Select the provider for one request: the mode's preferred provider if
    /// it is available right now, then the fixed priority order, then any
    /// available provider at all.
    pub async fn select_provider(&self, mode: &DictationMode) -> Option<Arc<dyn LlmProvider>> {
        if let Some(name) = &mode.preferred_provider {
            if let Some(provider) = self.get(name) {
                if provider.is_available().await {
                    return Some(provider);
                }
                log::debug!("Preferred provider {} unavailable, falling back", name);
            }
        }

        for name in PROVIDER_PRIORITY {
            if let Some(provider) = self.get(name) {
                if provider.is_available().await {
                    return Some(provider);
                }
            }
        }

        for provider in &self.providers {
            if provider.is_available().await {
                return Some(provider.clone());
            }
        }
        None
    }
}

/// Fail-safe transcript post-processor.
///
/// [`PostProcessor::process`] returns a `String` and never an error: any
/// failure, unavailability, or blank model output degrades to the raw
/// transcript.
pub struct PostProcessor {
    router: ProviderRouter,
}

impl PostProcessor {
    pub fn new(router: ProviderRouter) -> Self {
        Self { router }
    }

    /// Substitute the transcript into the mode's template. Templates without
    /// the placeholder get the transcript appended after a blank line.
    pub fn build_prompt(template: &str, transcript: &str) -> String {
        if template.contains(PROMPT_PLACEHOLDER) {
            template.replace(PROMPT_PLACEHOLDER, transcript)
        } else {
            format!("{}\n\n{}", template, transcript)
        }
    }

    /// Post-process a transcript according to the mode. Never fails.
    pub async fn process(
        &self,
        transcript: &str,
        mode: &DictationMode,
        cancel: &CancellationToken,
    ) -> String {
        if !mode.enable_post_processing || transcript.trim().is_empty() {
            return transcript.to_string();
        }

        let provider = match self.router.select_provider(mode).await {
            Some(provider) => provider,
            None => {
                log::info!("No LLM provider available, delivering raw transcript");
                return transcript.to_string();
            }
        };

        let prompt = Self::build_prompt(&mode.prompt_template, transcript);
        let options = GenerateOptions {
            model_id: mode.preferred_model_id.clone(),
            ..GenerateOptions::default()
        };

        log::debug!(
            "Post-processing {} chars via {}",
            transcript.len(),
            provider.name()
        );

        match provider.generate(&prompt, &options, cancel).await {
            Ok(output) if !output.trim().is_empty() => output.trim().to_string(),
            Ok(_) => {
                log::warn!("{} returned blank output, using raw transcript", provider.name());
                transcript.to_string()
            }
            Err(e) if e.is_rate_limit() => {
                log::warn!("{} rate limited: {}", provider.name(), e);
                self.rate_limit_fallback(provider.name(), &prompt, &options, cancel)
                    .await
                    .unwrap_or_else(|| transcript.to_string())
            }
            Err(e) => {
                log::warn!(
                    "{} post-processing failed, using raw transcript: {}",
                    provider.name(),
                    e
                );
                transcript.to_string()
            }
        }
    }

    /// One attempt per available provider in the fallback chain, skipping the
    /// provider that just hit its limit. Same prompt, same options.
    async fn rate_limit_fallback(
        &self,
        failed: &str,
        prompt: &str,
        options: &GenerateOptions,
        cancel: &CancellationToken,
    ) -> Option<String> {
        for name in RATE_LIMIT_FALLBACK_CHAIN {
            if name == failed {
                continue;
            }
            let provider = match self.router.get(name) {
                Some(provider) => provider,
                None => continue,
            };
            if !provider.is_available().await {
                continue;
            }

            log::info!("Rate-limit fallback: retrying via {}", name);
            match provider.generate(prompt, options, cancel).await {
                Ok(output) if !output.trim().is_empty() => {
                    return Some(output.trim().to_string());
                }
                Ok(_) => log::warn!("{} fallback returned blank output", name),
                Err(e) => log::warn!("{} fallback failed: {}", name, e),
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct MockProvider {
        provider_name: &'static str,
        available: bool,
        results: Mutex<Vec<Result<String, LlmError>>>,
        calls: AtomicUsize,
    }

    impl MockProvider {
        fn new(name: &'static str, available: bool, results: Vec<Result<String, LlmError>>) -> Arc<Self> {
            Arc::new(Self {
                provider_name: name,
                available,
                results: Mutex::new(results),
                calls: AtomicUsize::new(0),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LlmProvider for MockProvider {
        async fn is_available(&self) -> bool {
            self.available
        }

        async fn generate(
            &self,
            _prompt: &str,
            _options: &GenerateOptions,
            _cancel: &CancellationToken,
        ) -> Result<String, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut results = self.results.lock().unwrap();
            if results.is_empty() {
                Ok("formatted".to_string())
            } else {
                results.remove(0)
            }
        }

        fn name(&self) -> &'static str {
            self.provider_name
        }
    }

    fn mode_with_processing() -> DictationMode {
        DictationMode {
            id: "email".to_string(),
            prompt_template: format!("Rewrite as an email:\n{}", PROMPT_PLACEHOLDER),
            enable_post_processing: true,
            preferred_provider: None,
            preferred_model_id: None,
        }
    }

    #[test]
    fn test_build_prompt_substitutes_placeholder() {
        let prompt = PostProcessor::build_prompt("Fix: {{TRANSCRIPT}}!", "hello");
        assert_eq!(prompt, "Fix: hello!");
    }

    #[test]
    fn test_build_prompt_appends_when_no_placeholder() {
        let prompt = PostProcessor::build_prompt("Fix grammar.", "hello");
        assert_eq!(prompt, "Fix grammar.\n\nhello");
    }

    #[tokio::test]
    async fn test_router_prefers_mode_provider_when_available() {
        let ollama = MockProvider::new("ollama", true, vec![]);
        let gemini = MockProvider::new("gemini", true, vec![]);
        let router = ProviderRouter::new(vec![ollama, gemini]);

        let mut mode = mode_with_processing();
        mode.preferred_provider = Some("gemini".to_string());

        let selected = router.select_provider(&mode).await.expect("provider");
        assert_eq!(selected.name(), "gemini");
    }

    #[tokio::test]
    async fn test_router_falls_back_to_priority_order() {
        let ollama = MockProvider::new("ollama", true, vec![]);
        let gemini = MockProvider::new("gemini", true, vec![]);
        let router = ProviderRouter::new(vec![gemini, ollama]);

        let mut mode = mode_with_processing();
        mode.preferred_provider = Some("openrouter".to_string());

        let selected = router.select_provider(&mode).await.expect("provider");
        assert_eq!(selected.name(), "ollama");
    }

    #[tokio::test]
    async fn test_router_none_when_nothing_available() {
        let ollama = MockProvider::new("ollama", false, vec![]);
        let router = ProviderRouter::new(vec![ollama]);
        assert!(router.select_provider(&mode_with_processing()).await.is_none());
    }

    #[tokio::test]
    async fn test_process_disabled_mode_returns_raw() {
        let ollama = MockProvider::new("ollama", true, vec![]);
        let post = PostProcessor::new(ProviderRouter::new(vec![ollama.clone()]));

        let out = post
            .process("raw words", &DictationMode::raw(), &CancellationToken::new())
            .await;

        assert_eq!(out, "raw words");
        assert_eq!(ollama.call_count(), 0);
    }

    #[tokio::test]
    async fn test_process_no_provider_returns_raw() {
        let post = PostProcessor::new(ProviderRouter::new(vec![]));
        let out = post
            .process("raw words", &mode_with_processing(), &CancellationToken::new())
            .await;
        assert_eq!(out, "raw words");
    }

    #[tokio::test]
    async fn test_process_happy_path_returns_trimmed_output() {
        let ollama = MockProvider::new("ollama", true, vec![Ok("  Cleaned up.  ".to_string())]);
        let post = PostProcessor::new(ProviderRouter::new(vec![ollama]));

        let out = post
            .process("raw words", &mode_with_processing(), &CancellationToken::new())
            .await;
        assert_eq!(out, "Cleaned up.");
    }

    #[tokio::test]
    async fn test_process_blank_output_returns_raw() {
        let ollama = MockProvider::new("ollama", true, vec![Ok("   ".to_string())]);
        let post = PostProcessor::new(ProviderRouter::new(vec![ollama]));

        let out = post
            .process("raw words", &mode_with_processing(), &CancellationToken::new())
            .await;
        assert_eq!(out, "raw words");
    }

    #[tokio::test]
    async fn test_process_generic_error_returns_raw_without_fallback() {
        let ollama = MockProvider::new(
            "ollama",
            true,
            vec![Err(LlmError::Api("boom".to_string()))],
        );
        let gemini = MockProvider::new("gemini", true, vec![]);
        let post = PostProcessor::new(ProviderRouter::new(vec![ollama, gemini.clone()]));

        let out = post
            .process("raw words", &mode_with_processing(), &CancellationToken::new())
            .await;

        assert_eq!(out, "raw words");
        assert_eq!(gemini.call_count(), 0);
    }

    #[tokio::test]
    async fn test_rate_limit_triggers_fallback_chain() {
        let ollama = MockProvider::new(
            "ollama",
            true,
            vec![Err(LlmError::RateLimited("429".to_string()))],
        );
        let gemini = MockProvider::new("gemini", true, vec![Ok("from gemini".to_string())]);
        let post = PostProcessor::new(ProviderRouter::new(vec![ollama.clone(), gemini.clone()]));

        let out = post
            .process("raw words", &mode_with_processing(), &CancellationToken::new())
            .await;

        assert_eq!(out, "from gemini");
        assert_eq!(ollama.call_count(), 1);
        assert_eq!(gemini.call_count(), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_fallback_skips_failed_provider() {
        // Gemini rate-limits; the chain must not retry gemini itself.
        let gemini = MockProvider::new(
            "gemini",
            true,
            vec![Err(LlmError::RateLimited("quota".to_string()))],
        );
        let ollama = MockProvider::new("ollama", false, vec![]);
        let mut mode = mode_with_processing();
        mode.preferred_provider = Some("gemini".to_string());

        let post = PostProcessor::new(ProviderRouter::new(vec![gemini.clone(), ollama.clone()]));
        let out = post
            .process("raw words", &mode, &CancellationToken::new())
            .await;

        assert_eq!(out, "raw words");
        assert_eq!(gemini.call_count(), 1);
        assert_eq!(ollama.call_count(), 0);
    }

    #[tokio::test]
    async fn test_rate_limit_fallback_exhausted_returns_raw() {
        let ollama = MockProvider::new(
            "ollama",
            true,
            vec![Err(LlmError::RateLimited("429".to_string()))],
        );
        let gemini = MockProvider::new(
            "gemini",
            true,
            vec![Err(LlmError::Api("down".to_string()))],
        );
        let post = PostProcessor::new(ProviderRouter::new(vec![ollama, gemini]));

        let out = post
            .process("raw words", &mode_with_processing(), &CancellationToken::new())
            .await;
        assert_eq!(out, "raw words");
    }
}
