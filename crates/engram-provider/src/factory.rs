use std::sync::Arc;
use std::time::Duration;

use engram_core::config::ProviderConfig;
use engram_core::types::ProviderKind;

use crate::anthropic::AnthropicTransport;
use crate::ollama::OllamaTransport;
use crate::openai::OpenAiTransport;
use crate::pool;
use crate::provider::{LlmProvider, ProviderError};

/// Sentinel API key selecting the local Ollama transport.
const OLLAMA_SENTINEL: &str = "ollama-local";

/// Fully resolved construction parameters for one transport.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub kind: ProviderKind,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub request_timeout: Duration,
}

impl ProviderSettings {
    pub fn from_config(config: &ProviderConfig) -> Self {
        let kind = detect_kind(config.kind, config.api_key.as_deref());
        Self {
            kind,
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            base_url: config.base_url.clone(),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        }
    }

    /// Pool key for transports built from these settings.
    pub fn pool_key(&self) -> String {
        pool::pool_key(
            self.kind,
            self.api_key.as_deref(),
            self.base_url.as_deref(),
            self.model.as_deref(),
        )
    }

    /// Model used when the caller leaves the request model empty.
    pub fn resolved_model(&self) -> String {
        self.model.clone().unwrap_or_else(|| {
            match self.kind {
                ProviderKind::OpenAi => crate::openai::DEFAULT_MODEL,
                ProviderKind::Anthropic => crate::anthropic::DEFAULT_MODEL,
                ProviderKind::Ollama => crate::ollama::DEFAULT_MODEL,
            }
            .to_string()
        })
    }
}

/// Provider auto-detection. Priority: explicit kind > API-key prefix pattern >
/// default OpenAI.
pub fn detect_kind(explicit: Option<ProviderKind>, api_key: Option<&str>) -> ProviderKind {
    if let Some(kind) = explicit {
        return kind;
    }
    match api_key {
        Some(key) if key == OLLAMA_SENTINEL => ProviderKind::Ollama,
        Some(key) if key.starts_with("sk-ant-") => ProviderKind::Anthropic,
        Some(key) if key.starts_with("sk-") && key.len() > 20 => ProviderKind::OpenAi,
        _ => ProviderKind::OpenAi,
    }
}

/// Enum-keyed transport construction — the whole provider registry.
pub fn build(settings: &ProviderSettings) -> Result<Arc<dyn LlmProvider>, ProviderError> {
    let provider: Arc<dyn LlmProvider> = match settings.kind {
        ProviderKind::OpenAi => Arc::new(OpenAiTransport::new(
            settings.api_key.clone().unwrap_or_default(),
            settings.base_url.clone(),
            settings.model.clone(),
            settings.request_timeout,
        )),
        ProviderKind::Anthropic => Arc::new(AnthropicTransport::new(
            settings.api_key.clone().unwrap_or_default(),
            settings.base_url.clone(),
            settings.model.clone(),
            settings.request_timeout,
        )),
        ProviderKind::Ollama => Arc::new(OllamaTransport::new(
            settings.base_url.clone(),
            settings.model.clone(),
            settings.request_timeout,
        )),
    };
    Ok(provider)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_kind_wins_over_prefix() {
        let kind = detect_kind(Some(ProviderKind::Ollama), Some("sk-ant-abc123"));
        assert_eq!(kind, ProviderKind::Ollama);
    }

    #[test]
    fn anthropic_prefix_detected() {
        assert_eq!(
            detect_kind(None, Some("sk-ant-api03-xyz")),
            ProviderKind::Anthropic
        );
    }

    #[test]
    fn long_sk_prefix_is_openai() {
        assert_eq!(
            detect_kind(None, Some("sk-ABCDEFGHIJKLMNOPQRSTUVWX")),
            ProviderKind::OpenAi
        );
    }

    #[test]
    fn short_sk_key_falls_back_to_openai_default() {
        // Too short for the OpenAI pattern, still defaults to OpenAI.
        assert_eq!(detect_kind(None, Some("sk-short")), ProviderKind::OpenAi);
    }

    #[test]
    fn ollama_sentinel_detected() {
        assert_eq!(detect_kind(None, Some("ollama-local")), ProviderKind::Ollama);
    }

    #[test]
    fn missing_key_defaults_to_openai() {
        assert_eq!(detect_kind(None, None), ProviderKind::OpenAi);
    }

    #[test]
    fn build_honours_kind() {
        let settings = ProviderSettings {
            kind: ProviderKind::Anthropic,
            api_key: Some("sk-ant-x".into()),
            model: None,
            base_url: None,
            request_timeout: Duration::from_secs(30),
        };
        let provider = build(&settings).unwrap();
        assert_eq!(provider.kind(), ProviderKind::Anthropic);
        assert_eq!(provider.model(), crate::anthropic::DEFAULT_MODEL);
    }
}
