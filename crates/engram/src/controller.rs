use std::sync::{Arc, RwLock};

use chrono::Utc;
use rusqlite::Connection;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use engram_conscious::{ConsciousAgent, ConsolidateOptions, ConsolidationReport, IngestReport};
use engram_core::config::EngramConfig;
use engram_core::types::{ChatTurn, IngestMode};
use engram_core::{EngramError, Result};
use engram_extract::{ConversationContext, ConversationInput, MemoryExtractor};
use engram_provider::ProviderEnvelope;
use engram_state::StateManager;
use engram_storage::{DbStats, SearchOptions, SearchResult, StorageEngine};

use crate::error::{from_conscious, from_storage};

/// Per-call options for conversation recording.
#[derive(Debug, Clone, Default)]
pub struct RecordOptions {
    pub context: ConversationContext,
    pub metadata: Option<serde_json::Value>,
    /// Model attributed to the turn; the provider's model when unset.
    pub model: Option<String>,
}

struct Enabled {
    storage: Arc<StorageEngine>,
    shutdown_tx: Option<watch::Sender<bool>>,
    loop_handle: Option<JoinHandle<()>>,
    background_interval_ms: u64,
}

/// Orchestrates the memory subsystems: lifecycle, per-mode conversation
/// routing, retrieval, and the conscious background loop.
pub struct MemoryController {
    config: EngramConfig,
    mode: IngestMode,
    namespace: String,
    session_id: String,
    envelope: Arc<ProviderEnvelope>,
    extractor: Arc<MemoryExtractor>,
    inner: RwLock<Option<Enabled>>,
}

impl MemoryController {
    pub fn new(
        config: EngramConfig,
        envelope: Arc<ProviderEnvelope>,
        namespace: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        let mode = config.ingest.mode;
        let extractor = Arc::new(MemoryExtractor::new(envelope.clone()));
        Self {
            config,
            mode,
            namespace: namespace.into(),
            session_id: session_id.into(),
            envelope,
            extractor,
            inner: RwLock::new(None),
        }
    }

    /// Bring the engine up: open the database, and in conscious mode run one
    /// eager ingest pass (failures logged, enable proceeds) before starting
    /// the background loop. A second call fails with `AlreadyEnabled`.
    pub async fn enable(&self) -> Result<()> {
        if self.inner.read().unwrap().is_some() {
            return Err(EngramError::AlreadyEnabled);
        }

        let url = &self.config.database.url;
        let state_conn = open_connection(url)?;
        let state = Arc::new(
            StateManager::new(state_conn).map_err(crate::error::from_state)?,
        );
        let storage =
            Arc::new(StorageEngine::open(url, state).map_err(from_storage)?);

        let interval_ms = self.config.conscious.update_interval_ms;
        let mut enabled = Enabled {
            storage: storage.clone(),
            shutdown_tx: None,
            loop_handle: None,
            background_interval_ms: interval_ms,
        };

        if self.mode == IngestMode::Conscious {
            let mut agent = self.build_agent(&storage, interval_ms);
            if let Err(e) = agent.run_ingest_pass().await {
                warn!(error = %e, "eager conscious ingest pass failed, continuing enable");
            }
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            enabled.loop_handle = Some(tokio::spawn(agent.run(shutdown_rx)));
            enabled.shutdown_tx = Some(shutdown_tx);
        }

        let mut guard = self.inner.write().unwrap();
        if guard.is_some() {
            // lost an enable race; tear down what this call built
            if let Some(tx) = enabled.shutdown_tx.take() {
                let _ = tx.send(true);
            }
            return Err(EngramError::AlreadyEnabled);
        }
        *guard = Some(enabled);
        info!(namespace = %self.namespace, mode = %self.mode, "memory controller enabled");
        Ok(())
    }

    /// Stop the background loop and close storage. Idempotent: further calls
    /// are no-ops.
    pub async fn close(&self) -> Result<()> {
        let taken = self.inner.write().unwrap().take();
        let Some(mut enabled) = taken else {
            return Ok(());
        };
        if let Some(tx) = enabled.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        if let Some(handle) = enabled.loop_handle.take() {
            let _ = handle.await;
        }
        enabled.storage.close();
        info!(namespace = %self.namespace, "memory controller closed");
        Ok(())
    }

    /// Persist one conversation turn and route it by mode. Automatic mode
    /// detaches extraction so the caller gets the chat id immediately;
    /// conscious and manual modes store the turn only.
    pub async fn record_conversation(
        &self,
        user_input: &str,
        ai_output: &str,
        opts: RecordOptions,
    ) -> Result<String> {
        let storage = self.storage()?;
        let chat_id = Uuid::new_v4().to_string();
        let turn = ChatTurn {
            chat_id: chat_id.clone(),
            session_id: self.session_id.clone(),
            namespace: self.namespace.clone(),
            user_input: user_input.to_string(),
            ai_output: ai_output.to_string(),
            model_used: opts.model.unwrap_or_else(|| self.envelope.model()),
            timestamp: Utc::now(),
            metadata: opts.metadata,
        };
        storage.store_chat_turn(&turn).map_err(from_storage)?;

        if self.mode == IngestMode::Automatic {
            let extractor = self.extractor.clone();
            let input = ConversationInput {
                chat_id: chat_id.clone(),
                namespace: self.namespace.clone(),
                user_input: user_input.to_string(),
                ai_output: ai_output.to_string(),
                context: opts.context,
            };
            // Off the critical path: extraction failures degrade to the
            // fallback record inside the extractor, storage failures are
            // logged and never reach the caller.
            tokio::spawn(async move {
                let record = extractor.process_conversation(&input).await;
                if let Err(e) = storage.store_long_term_memory(&record) {
                    error!(chat_id = %input.chat_id, error = %e, "detached memory store failed");
                }
            });
        }

        Ok(chat_id)
    }

    pub fn search_memories(&self, query: &str, opts: &SearchOptions) -> Result<Vec<SearchResult>> {
        self.storage()?
            .search_memories(query, opts)
            .map_err(from_storage)
    }

    pub async fn get_statistics(&self) -> Result<DbStats> {
        let storage = self.storage()?;
        storage
            .database_stats(&self.namespace)
            .await
            .map_err(from_storage)
    }

    /// Run one on-demand conscious ingest pass (also the eager pass behind
    /// `initialize_conscious_context`).
    pub async fn check_for_conscious_context_updates(&self) -> Result<IngestReport> {
        let storage = self.storage()?;
        let interval = self.background_interval_ms();
        let mut agent = self.build_agent(&storage, interval);
        agent.run_ingest_pass().await.map_err(from_conscious)
    }

    pub async fn initialize_conscious_context(&self) -> Result<IngestReport> {
        self.check_for_conscious_context_updates().await
    }

    /// Run the duplicate-consolidation routine against this namespace.
    pub async fn consolidate_duplicates(
        &self,
        opts: &ConsolidateOptions,
    ) -> Result<ConsolidationReport> {
        let storage = self.storage()?;
        let interval = self.background_interval_ms();
        let agent = self.build_agent(&storage, interval);
        agent.consolidate_duplicates(opts).await.map_err(from_conscious)
    }

    /// Change the background cadence. When the loop is running it restarts
    /// with the new interval.
    pub fn set_background_update_interval(&self, interval_ms: u64) -> Result<()> {
        let mut guard = self.inner.write().unwrap();
        let Some(enabled) = guard.as_mut() else {
            return Err(EngramError::NotEnabled);
        };
        enabled.background_interval_ms = interval_ms;

        if let Some(tx) = enabled.shutdown_tx.take() {
            let _ = tx.send(true);
            enabled.loop_handle = None;

            let agent = self.build_agent(&enabled.storage, interval_ms);
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            enabled.loop_handle = Some(tokio::spawn(agent.run(shutdown_rx)));
            enabled.shutdown_tx = Some(shutdown_tx);
        }
        Ok(())
    }

    // --- introspection -----------------------------------------------------

    pub fn is_enabled(&self) -> bool {
        self.inner.read().unwrap().is_some()
    }

    pub fn is_conscious_mode_enabled(&self) -> bool {
        self.mode == IngestMode::Conscious
    }

    pub fn is_auto_mode_enabled(&self) -> bool {
        self.mode == IngestMode::Automatic
    }

    pub fn is_background_monitoring_active(&self) -> bool {
        self.inner
            .read()
            .unwrap()
            .as_ref()
            .map(|e| e.shutdown_tx.is_some())
            .unwrap_or(false)
    }

    pub fn mode(&self) -> IngestMode {
        self.mode
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    // --- internals ---------------------------------------------------------

    fn storage(&self) -> Result<Arc<StorageEngine>> {
        self.inner
            .read()
            .unwrap()
            .as_ref()
            .map(|e| e.storage.clone())
            .ok_or(EngramError::NotEnabled)
    }

    fn background_interval_ms(&self) -> u64 {
        self.inner
            .read()
            .unwrap()
            .as_ref()
            .map(|e| e.background_interval_ms)
            .unwrap_or(self.config.conscious.update_interval_ms)
    }

    fn build_agent(&self, storage: &Arc<StorageEngine>, interval_ms: u64) -> ConsciousAgent {
        let mut conscious_config = self.config.conscious.clone();
        conscious_config.update_interval_ms = interval_ms;
        // The extractor only rides along in conscious mode, where stored
        // turns wait for the background loop to distil them.
        let extractor = (self.mode == IngestMode::Conscious).then(|| self.extractor.clone());
        ConsciousAgent::new(
            storage.clone(),
            extractor,
            self.namespace.clone(),
            self.config.ingest.min_importance.threshold(),
            conscious_config,
        )
    }
}

fn open_connection(url: &str) -> Result<Connection> {
    let path = engram_core::config::strip_file_scheme(url);
    if path != ":memory:" {
        if let Some(parent) = std::path::Path::new(&path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| EngramError::Storage(e.to_string()))?;
            }
        }
    }
    Connection::open(&path).map_err(|e| EngramError::Storage(e.to_string()))
}
