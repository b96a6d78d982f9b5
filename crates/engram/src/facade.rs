use std::sync::{Arc, Weak};

use chrono::Utc;
use tracing::warn;
use uuid::Uuid;

use engram_core::config::EngramConfig;
use engram_core::types::{IngestMode, ProviderKind};
use engram_core::{EngramError, Result};
use engram_provider::{
    CallScope, ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse, LlmProvider,
    MemoryHook, ProviderEnvelope, ProviderSettings,
};
use engram_storage::{DbStats, SearchOptions, SearchResult};

use crate::controller::{MemoryController, RecordOptions};
use crate::error::from_provider;

/// Minimal user-facing configuration. Everything else is derived:
/// provider auto-detection from the API key, mode-dependent cache/pool
/// toggles, a fresh session id, and a generated namespace.
#[derive(Debug, Clone)]
pub struct EngramOptions {
    /// `file:` URL of the SQLite database.
    pub database_url: String,
    pub api_key: String,
    pub provider: Option<ProviderKind>,
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub namespace: Option<String>,
    pub mode: Option<IngestMode>,
    /// Conscious-loop cadence override, milliseconds.
    pub background_update_interval_ms: Option<u64>,
}

impl EngramOptions {
    pub fn new(database_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            api_key: api_key.into(),
            provider: None,
            model: None,
            base_url: None,
            namespace: None,
            mode: None,
            background_update_interval_ms: None,
        }
    }
}

/// The single user-facing surface: chat with memory recording, embeddings,
/// ranked retrieval, and statistics over one namespace.
pub struct Engram {
    controller: Arc<MemoryController>,
    envelope: Arc<ProviderEnvelope>,
    mode: IngestMode,
    session_id: String,
    namespace: String,
}

impl Engram {
    /// Build and enable a full engine from the minimal options.
    pub async fn new(opts: EngramOptions) -> Result<Self> {
        let config = resolve_config(&opts);
        let settings = ProviderSettings::from_config(&config.provider);
        let envelope =
            ProviderEnvelope::new(settings, &config.cache, &config.pool, &config.health)
                .map_err(|e| from_provider("factory", e))?;
        Self::assemble(opts, config, envelope).await
    }

    /// Build around an injected transport (tests, embedded backends).
    /// Pooling is forced off: pooled checkouts would rebuild real transports.
    pub async fn with_provider(
        opts: EngramOptions,
        provider: Arc<dyn LlmProvider>,
    ) -> Result<Self> {
        let mut config = resolve_config(&opts);
        config.pool.enabled = false;
        let settings = ProviderSettings::from_config(&config.provider);
        let envelope = ProviderEnvelope::with_provider(
            provider,
            settings,
            &config.cache,
            &config.pool,
            &config.health,
        );
        Self::assemble(opts, config, envelope).await
    }

    async fn assemble(
        opts: EngramOptions,
        config: EngramConfig,
        envelope: Arc<ProviderEnvelope>,
    ) -> Result<Self> {
        envelope.start_maintenance();

        let mode = config.ingest.mode;
        let namespace = opts
            .namespace
            .or_else(|| config.ingest.namespace.clone())
            .unwrap_or_else(|| format!("engram_{}", Utc::now().timestamp_millis()));
        let session_id = Uuid::new_v4().to_string();

        let controller = Arc::new(MemoryController::new(
            config,
            envelope.clone(),
            namespace.clone(),
            session_id.clone(),
        ));
        controller.enable().await?;

        // Automatic mode records every user-facing exchange through the
        // envelope hook; the extractor's internal calls never reach it.
        if mode == IngestMode::Automatic {
            envelope.set_memory_hook(Arc::new(RecordingHook {
                controller: Arc::downgrade(&controller),
            }));
        }

        Ok(Self {
            controller,
            envelope,
            mode,
            session_id,
            namespace,
        })
    }

    /// One chat completion through the performance envelope. In automatic
    /// mode the exchange is recorded into memory off the critical path.
    pub async fn chat(&self, mut req: ChatRequest) -> Result<ChatResponse> {
        if req.model.is_empty() {
            req.model = self.envelope.model();
        }
        self.envelope
            .chat(&req, CallScope::User)
            .await
            .map_err(|e| from_provider(self.envelope.name(), e))
    }

    pub async fn create_embeddings(&self, mut req: EmbeddingRequest) -> Result<EmbeddingResponse> {
        if req.model.is_empty() {
            req.model = self.envelope.model();
        }
        self.envelope
            .embed(&req, CallScope::User)
            .await
            .map_err(|e| from_provider(self.envelope.name(), e))
    }

    /// Ranked retrieval over this instance's namespace.
    pub fn search_memories(&self, query: &str, opts: Option<SearchOptions>) -> Result<Vec<SearchResult>> {
        let opts = opts.unwrap_or_else(|| SearchOptions::for_namespace(&self.namespace));
        self.controller.search_memories(query, &opts)
    }

    /// Manual-mode-only explicit recording. Automatic instances record via
    /// the chat path and reject this call.
    pub async fn record_conversation(&self, user_input: &str, ai_output: &str) -> Result<String> {
        if self.mode == IngestMode::Automatic {
            return Err(EngramError::WrongMode {
                required: "manual or conscious".to_string(),
                actual: self.mode.to_string(),
            });
        }
        self.controller
            .record_conversation(user_input, ai_output, RecordOptions::default())
            .await
    }

    pub async fn get_memory_statistics(&self) -> Result<DbStats> {
        self.controller.get_statistics().await
    }

    /// Shut down the background loop, storage, and envelope maintenance.
    /// Idempotent.
    pub async fn close(&self) -> Result<()> {
        self.controller.close().await?;
        self.envelope.shutdown();
        Ok(())
    }

    pub fn get_session_id(&self) -> &str {
        &self.session_id
    }

    pub fn get_mode(&self) -> IngestMode {
        self.mode
    }

    pub fn get_provider_kind(&self) -> ProviderKind {
        self.envelope.kind()
    }

    pub fn get_namespace(&self) -> &str {
        &self.namespace
    }

    /// Access to the controller for lifecycle introspection and the
    /// conscious-mode maintenance calls.
    pub fn controller(&self) -> &Arc<MemoryController> {
        &self.controller
    }

    pub fn diagnostics(&self) -> serde_json::Value {
        self.envelope.diagnostics()
    }
}

/// Derive the full internal config from the minimal options.
fn resolve_config(opts: &EngramOptions) -> EngramConfig {
    let mut config = EngramConfig::default();
    config.database.url = opts.database_url.clone();
    config.provider.kind = opts.provider;
    config.provider.api_key = Some(opts.api_key.clone());
    config.provider.model = opts.model.clone();
    config.provider.base_url = opts.base_url.clone();
    config.apply_env_fallbacks();

    // Explicit option beats environment beats the automatic default.
    if let Some(mode) = opts.mode {
        config.ingest.mode = mode;
    }
    if let Some(interval) = opts.background_update_interval_ms {
        config.conscious.update_interval_ms = interval;
    }

    // Mode mapping: manual runs bare, the ingesting modes get the envelope.
    if config.ingest.mode == IngestMode::Manual {
        config.cache.enabled = false;
        config.pool.enabled = false;
    }
    config
}

/// Envelope hook piping user-facing exchanges into the controller. Holds a
/// weak reference so the hook cannot keep a closed engine alive.
struct RecordingHook {
    controller: Weak<MemoryController>,
}

impl MemoryHook for RecordingHook {
    fn on_exchange(&self, user_input: &str, ai_output: &str) {
        let Some(controller) = self.controller.upgrade() else {
            return;
        };
        let user_input = user_input.to_string();
        let ai_output = ai_output.to_string();
        tokio::spawn(async move {
            if let Err(e) = controller
                .record_conversation(&user_input, &ai_output, RecordOptions::default())
                .await
            {
                warn!(error = %e, "memory hook recording failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_mode_disables_cache_and_pool() {
        let mut opts = EngramOptions::new(":memory:", "sk-ABCDEFGHIJKLMNOPQRSTUVWX");
        opts.mode = Some(IngestMode::Manual);
        let config = resolve_config(&opts);
        assert!(!config.cache.enabled);
        assert!(!config.pool.enabled);
    }

    #[test]
    fn automatic_mode_keeps_the_envelope_features() {
        let mut opts = EngramOptions::new(":memory:", "sk-ABCDEFGHIJKLMNOPQRSTUVWX");
        opts.mode = Some(IngestMode::Automatic);
        let config = resolve_config(&opts);
        assert!(config.cache.enabled);
        assert!(config.pool.enabled);
    }

    #[test]
    fn interval_override_lands_in_conscious_config() {
        let mut opts = EngramOptions::new(":memory:", "sk-ABCDEFGHIJKLMNOPQRSTUVWX");
        opts.background_update_interval_ms = Some(50);
        let config = resolve_config(&opts);
        assert_eq!(config.conscious.update_interval_ms, 50);
    }
}
