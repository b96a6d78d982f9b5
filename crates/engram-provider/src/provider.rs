use async_trait::async_trait;

use engram_core::types::ProviderKind;

use crate::types::{ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse};

/// Common interface for the three LLM transports (OpenAI-compatible,
/// Anthropic-native, Ollama). Transports are dumb pipes: no retries, no
/// caching, no health bookkeeping — those live in the envelope.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name for logging and health tracking.
    fn name(&self) -> &str;

    /// Which wire format this transport speaks.
    fn kind(&self) -> ProviderKind;

    /// Model requests default to when the caller leaves it unset.
    fn model(&self) -> &str;

    /// Issue one non-streaming chat completion.
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError>;

    /// Issue one embedding call. Backends without an embeddings surface
    /// return `ProviderError::Unsupported`.
    async fn embed(&self, req: &EmbeddingRequest) -> Result<EmbeddingResponse, ProviderError>;

    /// Cheap liveness probe. `true` means the backend answered at all; the
    /// health monitor decides what to make of it.
    async fn probe(&self) -> bool;
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Unsupported capability: {0}")]
    Unsupported(String),

    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("Deadline exceeded after {ms}ms")]
    Timeout { ms: u64 },
}

impl ProviderError {
    /// Map connect/timeout reqwest failures to `Unavailable` so callers can
    /// distinguish a dead endpoint from a protocol failure.
    pub fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() {
            ProviderError::Unavailable(e.to_string())
        } else {
            ProviderError::Http(e)
        }
    }
}
