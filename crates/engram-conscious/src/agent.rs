use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use engram_core::config::ConsciousConfig;
use engram_core::types::Importance;
use engram_extract::{ConversationContext, ConversationInput, MemoryExtractor};
use engram_state::{MemoryState, StateManager, TransitionOptions};
use engram_storage::StorageEngine;

use crate::error::Result;

/// Agent id recorded on every transition this worker performs.
pub const AGENT_ID: &str = "conscious-agent";

/// How many unextracted chat turns one pass will distil.
const EXTRACTION_BATCH: usize = 25;

/// Outcome of one ingest pass.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct IngestReport {
    /// Chat turns distilled into new memory records.
    pub extracted: usize,
    /// Conscious records copied into the short-term working set.
    pub promoted: usize,
    /// Records that ended in the failed state this pass.
    pub failed: usize,
}

/// Background worker for conscious-mode ingestion.
///
/// Discovers conscious-info records that have not been promoted, copies them
/// into short-term storage as permanent context, and (when an extractor is
/// wired) distils stored chat turns that have no memory record yet. The
/// `processed_ids` shortcut set is owned by this worker alone.
pub struct ConsciousAgent {
    pub(crate) storage: Arc<StorageEngine>,
    pub(crate) state: Arc<StateManager>,
    extractor: Option<Arc<MemoryExtractor>>,
    namespace: String,
    min_importance: Option<Importance>,
    config: ConsciousConfig,
    processed_ids: HashSet<String>,
}

impl ConsciousAgent {
    pub fn new(
        storage: Arc<StorageEngine>,
        extractor: Option<Arc<MemoryExtractor>>,
        namespace: impl Into<String>,
        min_importance: Option<Importance>,
        config: ConsciousConfig,
    ) -> Self {
        let state = storage.state_manager();
        Self {
            storage,
            state,
            extractor,
            namespace: namespace.into(),
            min_importance,
            config,
            processed_ids: HashSet::new(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Main loop: one ingest pass per interval tick until `shutdown`
    /// broadcasts `true`. The cancellation signal is checked at the top of
    /// every iteration, so `close()` returns within one tick plus whatever
    /// step is in flight.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(namespace = %self.namespace, interval_ms = self.config.update_interval_ms, "conscious agent started");
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.config.update_interval_ms.max(1)));
        // consume the immediate first tick; the eager pass already ran
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.run_ingest_pass().await {
                        Ok(report) if report.extracted + report.promoted + report.failed > 0 => {
                            debug!(
                                extracted = report.extracted,
                                promoted = report.promoted,
                                failed = report.failed,
                                "conscious ingest pass finished"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "conscious ingest pass failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(namespace = %self.namespace, "conscious agent shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One full pass: distil the extraction backlog, then promote
    /// unprocessed conscious records. Per-record failures are logged and the
    /// record marked failed; the pass always continues.
    pub async fn run_ingest_pass(&mut self) -> Result<IngestReport> {
        let mut report = IngestReport::default();

        if let Some(extractor) = self.extractor.clone() {
            report.extracted = self.extract_backlog(&extractor).await?;
        }

        let candidates = self
            .storage
            .unprocessed_conscious_memories(&self.namespace)?;
        for record in candidates {
            if self.processed_ids.contains(&record.id) {
                continue;
            }
            if let Some(min) = self.min_importance {
                if record.importance < min {
                    debug!(memory_id = %record.id, importance = %record.importance, "below promotion threshold, skipping");
                    continue;
                }
            }

            let staged = self.state.transition(
                &record.id,
                MemoryState::ConsciousProcessing,
                &TransitionOptions::new("promoting into short-term working set", AGENT_ID),
            )?;
            if !staged {
                warn!(memory_id = %record.id, "could not stage conscious processing, skipping");
                continue;
            }

            match self.promote(&record.id).await {
                Ok(()) => {
                    self.state.transition(
                        &record.id,
                        MemoryState::ConsciousProcessed,
                        &TransitionOptions::new("promoted into short-term working set", AGENT_ID),
                    )?;
                    self.processed_ids.insert(record.id.clone());
                    report.promoted += 1;
                }
                Err(e) => {
                    error!(memory_id = %record.id, error = %e, "conscious promotion failed");
                    self.state.transition(
                        &record.id,
                        MemoryState::Failed,
                        &TransitionOptions::new("conscious promotion failed", AGENT_ID)
                            .with_error(e.to_string()),
                    )?;
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    async fn promote(&self, memory_id: &str) -> Result<()> {
        let record = self
            .storage
            .get_memory(memory_id)?
            .ok_or_else(|| engram_storage::StorageError::NotFound {
                id: memory_id.to_string(),
            })?;
        self.storage.store_conscious_short_term(&record)?;
        self.storage.mark_conscious_processed(memory_id)?;
        Ok(())
    }

    /// Distil stored turns that have no memory record yet. Extraction itself
    /// never fails (fallback records), so errors here are storage errors.
    async fn extract_backlog(&self, extractor: &MemoryExtractor) -> Result<usize> {
        let backlog = self
            .storage
            .chat_turns_without_memory(&self.namespace, EXTRACTION_BATCH)?;
        let mut extracted = 0;
        for turn in backlog {
            let input = ConversationInput {
                chat_id: turn.chat_id.clone(),
                namespace: self.namespace.clone(),
                user_input: turn.user_input.clone(),
                ai_output: turn.ai_output.clone(),
                context: ConversationContext::default(),
            };
            let record = extractor.process_conversation(&input).await;
            match self.storage.store_long_term_memory(&record) {
                Ok(_) => extracted += 1,
                Err(e) => {
                    error!(chat_id = %turn.chat_id, error = %e, "failed to store extracted memory");
                }
            }
        }
        Ok(extracted)
    }
}
