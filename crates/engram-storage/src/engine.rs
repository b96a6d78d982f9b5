use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info, instrument};

use engram_core::config::strip_file_scheme;
use engram_core::types::{ChatTurn, MemoryRecord, ShortTermRecord};
use engram_state::{MemoryState, StateManager};

use crate::db::{init_db, probe_fts};
use crate::error::{Result, StorageError};

/// Owns every persistent entity: chat turns, long/short-term memories,
/// relationships. One engine per database file; all access goes through the
/// guarded connection.
///
/// State tracking lives in the [`StateManager`] (its own connection to the
/// same file); the engine seeds and advances states where the write API
/// demands it.
pub struct StorageEngine {
    pub(crate) db: Mutex<Connection>,
    pub(crate) path: String,
    pub(crate) fts_enabled: bool,
    pub(crate) state: Arc<StateManager>,
}

impl StorageEngine {
    /// Open (and initialise) the database referenced by a `file:` URL.
    pub fn open(url: &str, state: Arc<StateManager>) -> Result<Self> {
        let path = strip_file_scheme(url);
        if path != ":memory:" {
            if let Some(parent) = Path::new(&path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }
        let conn = Connection::open(&path)?;
        // Several subsystems hold their own connection to the same file.
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        init_db(&conn)?;
        let fts_enabled = probe_fts(&conn);
        info!(%path, fts_enabled, "storage engine opened");
        Ok(Self {
            db: Mutex::new(conn),
            path,
            fts_enabled,
            state,
        })
    }

    /// In-memory engine for tests.
    pub fn open_in_memory(state: Arc<StateManager>) -> Result<Self> {
        Self::open(":memory:", state)
    }

    pub fn state_manager(&self) -> Arc<StateManager> {
        self.state.clone()
    }

    pub fn fts_enabled(&self) -> bool {
        self.fts_enabled
    }

    /// Flush and release what can be released early. Dropping the engine
    /// closes the connection regardless; this exists so `close()` has a
    /// deterministic point to finish pending work.
    pub fn close(&self) {
        let db = self.db.lock().unwrap();
        let _ = db.execute_batch("PRAGMA optimize;");
        debug!(path = %self.path, "storage engine closed");
    }

    // --- chat turns --------------------------------------------------------

    /// Persist one conversation turn. Idempotent on `chat_id`: replaying the
    /// same id is a no-op that returns the same id.
    #[instrument(skip(self, turn), fields(chat_id = %turn.chat_id, namespace = %turn.namespace))]
    pub fn store_chat_turn(&self, turn: &ChatTurn) -> Result<String> {
        let db = self.db.lock().unwrap();
        let metadata = turn
            .metadata
            .as_ref()
            .map(|m| m.to_string());
        let inserted = db.execute(
            "INSERT OR IGNORE INTO chat_history
             (chat_id, session_id, namespace, user_input, ai_output, model_used, timestamp, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                turn.chat_id,
                turn.session_id,
                turn.namespace,
                turn.user_input,
                turn.ai_output,
                turn.model_used,
                turn.timestamp.to_rfc3339(),
                metadata,
            ],
        )?;
        if inserted == 0 {
            debug!("chat turn already stored");
        }
        Ok(turn.chat_id.clone())
    }

    pub fn get_chat_turn(&self, chat_id: &str) -> Result<Option<ChatTurn>> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT chat_id, session_id, namespace, user_input, ai_output, model_used,
                    timestamp, metadata
             FROM chat_history WHERE chat_id = ?1",
            [chat_id],
            row_to_turn,
        )
        .optional()
        .map_err(StorageError::from)
    }

    /// Count of stored turns in a namespace.
    pub fn chat_turn_count(&self, namespace: &str) -> Result<i64> {
        let db = self.db.lock().unwrap();
        Ok(db.query_row(
            "SELECT COUNT(*) FROM chat_history WHERE namespace = ?1",
            [namespace],
            |row| row.get(0),
        )?)
    }

    /// Turns that have no derived memory record yet — the conscious loop's
    /// extraction backlog. Oldest first.
    pub fn chat_turns_without_memory(&self, namespace: &str, limit: usize) -> Result<Vec<ChatTurn>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT c.chat_id, c.session_id, c.namespace, c.user_input, c.ai_output,
                    c.model_used, c.timestamp, c.metadata
             FROM chat_history c
             WHERE c.namespace = ?1
               AND NOT EXISTS (
                   SELECT 1 FROM long_term_memory l
                   WHERE l.conversation_id = c.chat_id AND l.namespace = c.namespace
               )
             ORDER BY c.timestamp
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![namespace, limit as i64], row_to_turn)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    // --- long-term memories ------------------------------------------------

    /// Persist one memory record and seed its processing state to
    /// `processed`, unless the caller already staged a `pending` row (the
    /// staged state is left for the caller to advance).
    #[instrument(skip(self, record), fields(memory_id = %record.id, namespace = %record.namespace))]
    pub fn store_long_term_memory(&self, record: &MemoryRecord) -> Result<String> {
        let searchable = record.searchable_content();
        let blob = serde_json::to_string(record)?;
        {
            let db = self.db.lock().unwrap();
            db.execute(
                "INSERT INTO long_term_memory
                 (memory_id, conversation_id, namespace, content, summary, classification,
                  importance, importance_score, topic, entities, keywords, confidence_score,
                  classification_reason, promotion_eligible, extraction_timestamp,
                  conscious_processed, consolidated_into, searchable_content, processed_data)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, NULL, ?17, ?18)",
                rusqlite::params![
                    record.id,
                    record.conversation_id,
                    record.namespace,
                    record.content,
                    record.summary,
                    record.classification.to_string(),
                    record.importance.to_string(),
                    record.importance_score,
                    record.topic,
                    serde_json::to_string(&record.entities)?,
                    serde_json::to_string(&record.keywords)?,
                    record.confidence_score,
                    record.classification_reason,
                    record.promotion_eligible as i64,
                    record.extraction_timestamp.to_rfc3339(),
                    record.conscious_processed as i64,
                    searchable,
                    blob,
                ],
            )?;
            if self.fts_enabled {
                let rowid = db.last_insert_rowid();
                db.execute(
                    "INSERT INTO memory_fts(rowid, searchable_content, summary) VALUES (?1, ?2, ?3)",
                    rusqlite::params![rowid, searchable, record.summary],
                )?;
            }
        }

        match self.state.current_state(&record.id)? {
            None => {
                self.state.initialize_existing(
                    &record.id,
                    &record.namespace,
                    MemoryState::Processed,
                )?;
            }
            // A caller-staged pending row is advanced by that caller, not here.
            Some(MemoryState::Pending) => {}
            Some(_) => {}
        }

        debug!("long-term memory stored");
        Ok(record.id.clone())
    }

    pub fn get_memory(&self, memory_id: &str) -> Result<Option<MemoryRecord>> {
        let db = self.db.lock().unwrap();
        let blob: Option<String> = db
            .query_row(
                "SELECT processed_data FROM long_term_memory WHERE memory_id = ?1",
                [memory_id],
                |row| row.get(0),
            )
            .optional()?;
        blob.map(|b| serde_json::from_str(&b).map_err(StorageError::from))
            .transpose()
    }

    /// Conscious-classified records that the background loop has not yet
    /// promoted, in extraction order.
    pub fn unprocessed_conscious_memories(&self, namespace: &str) -> Result<Vec<MemoryRecord>> {
        self.records_where(
            "namespace = ?1 AND classification = 'conscious-info' AND conscious_processed = 0
             AND consolidated_into IS NULL
             ORDER BY extraction_timestamp",
            namespace,
        )
    }

    /// Every conscious-classified record in the namespace (promoted or not),
    /// excluding consolidated duplicates. Load order drives primary selection
    /// during consolidation.
    pub fn conscious_records(&self, namespace: &str) -> Result<Vec<MemoryRecord>> {
        self.records_where(
            "namespace = ?1 AND classification = 'conscious-info'
             AND consolidated_into IS NULL
             ORDER BY extraction_timestamp",
            namespace,
        )
    }

    /// All live records in a namespace, newest first.
    pub fn records_in_namespace(&self, namespace: &str) -> Result<Vec<MemoryRecord>> {
        self.records_where(
            "namespace = ?1 AND consolidated_into IS NULL
             ORDER BY extraction_timestamp DESC",
            namespace,
        )
    }

    fn records_where(&self, where_clause: &str, namespace: &str) -> Result<Vec<MemoryRecord>> {
        let db = self.db.lock().unwrap();
        let sql = format!(
            "SELECT processed_data FROM long_term_memory WHERE {where_clause}"
        );
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map([namespace], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for blob in rows {
            out.push(serde_json::from_str(&blob?)?);
        }
        Ok(out)
    }

    /// Flip the conscious-processed flag, in both the column and the record
    /// blob so reads stay consistent.
    pub fn mark_conscious_processed(&self, memory_id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let blob: String = db
            .query_row(
                "SELECT processed_data FROM long_term_memory WHERE memory_id = ?1",
                [memory_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StorageError::NotFound {
                id: memory_id.to_string(),
            })?;
        let mut record: MemoryRecord = serde_json::from_str(&blob)?;
        record.conscious_processed = true;
        db.execute(
            "UPDATE long_term_memory
             SET conscious_processed = 1, processed_data = ?1
             WHERE memory_id = ?2",
            rusqlite::params![serde_json::to_string(&record)?, memory_id],
        )?;
        Ok(())
    }

    // --- short-term working set --------------------------------------------

    /// Copy a conscious memory into short-term storage. The source memory id
    /// becomes the short-term `chat_id` for traceability; re-promoting the
    /// same record replaces the existing copy.
    #[instrument(skip(self, record), fields(memory_id = %record.id, namespace = %record.namespace))]
    pub fn store_conscious_short_term(&self, record: &MemoryRecord) -> Result<i64> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR REPLACE INTO short_term_memory
             (chat_id, namespace, processed_data, importance_score, category_primary,
              retention_type, searchable_content, summary, is_permanent_context, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'short_term', ?6, ?7, 1, ?8)",
            rusqlite::params![
                record.id,
                record.namespace,
                serde_json::to_string(record)?,
                record.importance.score(),
                record.classification.to_string(),
                record.searchable_content(),
                record.summary,
                chrono::Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(db.last_insert_rowid())
    }

    pub fn short_term_records(&self, namespace: &str) -> Result<Vec<ShortTermRecord>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT chat_id, namespace, processed_data, importance_score, category_primary,
                    retention_type, searchable_content, summary, is_permanent_context, created_at
             FROM short_term_memory
             WHERE namespace = ?1
             ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map([namespace], row_to_short_term)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn short_term_by_chat_id(
        &self,
        chat_id: &str,
        namespace: &str,
    ) -> Result<Option<ShortTermRecord>> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT chat_id, namespace, processed_data, importance_score, category_primary,
                    retention_type, searchable_content, summary, is_permanent_context, created_at
             FROM short_term_memory
             WHERE chat_id = ?1 AND namespace = ?2",
            rusqlite::params![chat_id, namespace],
            row_to_short_term,
        )
        .optional()
        .map_err(StorageError::from)
    }

    // --- cleanup -----------------------------------------------------------

    /// Drive one record through the cleanup tail of its lifecycle. The
    /// caller must have staged `cleanup_pending`; this advances through
    /// `cleanup_processing` to `cleaned`, deleting the record's
    /// relationships, its short-term copies, and finally the row itself.
    /// Transition-history rows survive the record.
    #[instrument(skip(self), fields(memory_id, namespace))]
    pub fn cleanup_memory(&self, memory_id: &str, namespace: &str) -> Result<bool> {
        let opts = engram_state::TransitionOptions::new("memory cleanup", "storage-engine");
        if !self
            .state
            .transition(memory_id, MemoryState::CleanupProcessing, &opts)?
        {
            return Ok(false);
        }

        self.delete_relationships_for(memory_id, namespace)?;
        {
            let db = self.db.lock().unwrap();
            db.execute(
                "DELETE FROM short_term_memory WHERE chat_id = ?1 AND namespace = ?2",
                rusqlite::params![memory_id, namespace],
            )?;
            if self.fts_enabled {
                db.execute(
                    "INSERT INTO memory_fts(memory_fts, rowid, searchable_content, summary)
                     SELECT 'delete', rowid, searchable_content, summary
                     FROM long_term_memory WHERE memory_id = ?1",
                    [memory_id],
                )
                .ok();
            }
            db.execute(
                "DELETE FROM long_term_memory WHERE memory_id = ?1 AND namespace = ?2",
                rusqlite::params![memory_id, namespace],
            )?;
        }

        self.state
            .transition(memory_id, MemoryState::Cleaned, &opts)?;
        debug!("memory cleaned up");
        Ok(true)
    }

    /// Age-based eviction. Permanent-context rows (conscious copies) are
    /// never evicted here — they live as long as their source.
    pub fn evict_short_term_older_than(
        &self,
        namespace: &str,
        max_age: chrono::Duration,
    ) -> Result<usize> {
        let cutoff = (chrono::Utc::now() - max_age).to_rfc3339();
        let db = self.db.lock().unwrap();
        let removed = db.execute(
            "DELETE FROM short_term_memory
             WHERE namespace = ?1 AND is_permanent_context = 0 AND created_at < ?2",
            rusqlite::params![namespace, cutoff],
        )?;
        if removed > 0 {
            debug!(namespace, removed, "short-term records evicted by age");
        }
        Ok(removed)
    }
}

fn row_to_turn(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatTurn> {
    let timestamp: String = row.get(6)?;
    let metadata: Option<String> = row.get(7)?;
    Ok(ChatTurn {
        chat_id: row.get(0)?,
        session_id: row.get(1)?,
        namespace: row.get(2)?,
        user_input: row.get(3)?,
        ai_output: row.get(4)?,
        model_used: row.get(5)?,
        timestamp: chrono::DateTime::parse_from_rfc3339(&timestamp)
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .unwrap_or_else(|_| chrono::Utc::now()),
        metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
    })
}

fn row_to_short_term(row: &rusqlite::Row<'_>) -> rusqlite::Result<ShortTermRecord> {
    let processed: String = row.get(2)?;
    let created: String = row.get(9)?;
    Ok(ShortTermRecord {
        chat_id: row.get(0)?,
        namespace: row.get(1)?,
        processed_data: serde_json::from_str(&processed)
            .unwrap_or(serde_json::Value::Null),
        importance_score: row.get(3)?,
        category_primary: row.get(4)?,
        retention_type: row.get(5)?,
        searchable_content: row.get(6)?,
        summary: row.get(7)?,
        is_permanent_context: row.get::<_, i64>(8)? != 0,
        created_at: chrono::DateTime::parse_from_rfc3339(&created)
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .unwrap_or_else(|_| chrono::Utc::now()),
    })
}
