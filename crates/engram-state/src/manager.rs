use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::db::init_db;
use crate::error::{Result, StateError};
use crate::machine::MemoryState;

/// Caller-supplied context recorded with every transition.
#[derive(Debug, Clone)]
pub struct TransitionOptions {
    pub reason: String,
    pub agent_id: String,
    pub error_message: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

impl TransitionOptions {
    pub fn new(reason: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            agent_id: agent_id.into(),
            error_message: None,
            metadata: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error_message = Some(error.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// One row of the append-only transition log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    /// `None` for the initial seed row.
    pub from_state: Option<MemoryState>,
    pub to_state: MemoryState,
    pub timestamp: String,
    pub reason: String,
    pub agent_id: String,
    pub error_message: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// Owns the processing state of every memory record.
///
/// The history log is the source of truth; `memory_state` is a materialised
/// projection of the last entry, kept in sync inside one transaction per
/// transition. The single guarded connection serialises concurrent
/// transitions for the same memory id (and everything else).
pub struct StateManager {
    db: Mutex<Connection>,
}

impl StateManager {
    pub fn new(conn: Connection) -> Result<Self> {
        // Several subsystems hold their own connection to the same file.
        conn.busy_timeout(Duration::from_secs(5))?;
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    /// Seed state tracking for a record. Legal only when no history exists:
    /// re-seeding with the same state is a no-op returning `false`; a
    /// different state is an error.
    pub fn initialize_existing(
        &self,
        memory_id: &str,
        namespace: &str,
        state: MemoryState,
    ) -> Result<bool> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT current_state FROM memory_state WHERE memory_id = ?1",
                [memory_id],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(current) = existing {
            if current == state.to_string() {
                return Ok(false);
            }
            return Err(StateError::AlreadyInitialized {
                memory_id: memory_id.to_string(),
                current,
            });
        }

        let now = chrono::Utc::now().to_rfc3339();
        tx.execute(
            "INSERT INTO memory_state_history
             (memory_id, from_state, to_state, timestamp, reason, agent_id, error_message, metadata)
             VALUES (?1, NULL, ?2, ?3, 'state tracking initialized', 'state-manager', NULL, NULL)",
            rusqlite::params![memory_id, state.to_string(), now],
        )?;
        tx.execute(
            "INSERT INTO memory_state (memory_id, namespace, current_state, updated_at)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![memory_id, namespace, state.to_string(), now],
        )?;
        tx.commit()?;

        debug!(memory_id, state = %state, "memory state initialized");
        Ok(true)
    }

    /// Apply one transition. Illegal transitions (including transitions for
    /// untracked ids) return `false` and record nothing.
    pub fn transition(
        &self,
        memory_id: &str,
        to: MemoryState,
        opts: &TransitionOptions,
    ) -> Result<bool> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;

        let current: Option<String> = tx
            .query_row(
                "SELECT current_state FROM memory_state WHERE memory_id = ?1",
                [memory_id],
                |row| row.get(0),
            )
            .optional()?;

        let Some(current) = current else {
            warn!(memory_id, to = %to, "transition rejected: state not initialized");
            return Ok(false);
        };
        let from: MemoryState = current
            .parse()
            .map_err(StateError::Serialization)?;

        if !from.can_transition(to) {
            debug!(memory_id, %from, %to, "transition rejected: not in legal table");
            return Ok(false);
        }

        let now = chrono::Utc::now().to_rfc3339();
        let metadata = opts
            .metadata
            .as_ref()
            .map(|m| m.to_string());
        tx.execute(
            "INSERT INTO memory_state_history
             (memory_id, from_state, to_state, timestamp, reason, agent_id, error_message, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                memory_id,
                from.to_string(),
                to.to_string(),
                now,
                opts.reason,
                opts.agent_id,
                opts.error_message,
                metadata,
            ],
        )?;
        tx.execute(
            "UPDATE memory_state SET current_state = ?1, updated_at = ?2 WHERE memory_id = ?3",
            rusqlite::params![to.to_string(), now, memory_id],
        )?;
        tx.commit()?;

        debug!(memory_id, %from, %to, agent = %opts.agent_id, "state transition applied");
        Ok(true)
    }

    /// Current state projection, `None` for untracked ids.
    pub fn current_state(&self, memory_id: &str) -> Result<Option<MemoryState>> {
        let db = self.db.lock().unwrap();
        let state: Option<String> = db
            .query_row(
                "SELECT current_state FROM memory_state WHERE memory_id = ?1",
                [memory_id],
                |row| row.get(0),
            )
            .optional()?;
        state
            .map(|s| s.parse().map_err(StateError::Serialization))
            .transpose()
    }

    /// Full append-only history, oldest first.
    pub fn history(&self, memory_id: &str) -> Result<Vec<Transition>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT from_state, to_state, timestamp, reason, agent_id, error_message, metadata
             FROM memory_state_history
             WHERE memory_id = ?1
             ORDER BY id",
        )?;
        let rows = stmt.query_map([memory_id], |row| {
            Ok((
                row.get::<_, Option<String>>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, Option<String>>(6)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (from, to, timestamp, reason, agent_id, error_message, metadata) = row?;
            out.push(Transition {
                from_state: from.and_then(|s| s.parse().ok()),
                to_state: to.parse().map_err(StateError::Serialization)?,
                timestamp,
                reason,
                agent_id,
                error_message,
                metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
            });
        }
        Ok(out)
    }

    /// Whether `transition(memory_id, to)` would currently be accepted.
    pub fn can_transition(&self, memory_id: &str, to: MemoryState) -> Result<bool> {
        match self.current_state(memory_id)? {
            Some(from) => Ok(from.can_transition(to)),
            None => Ok(false),
        }
    }

    /// Poll `transition` until it becomes legal and succeeds, up to
    /// `max_retries` attempts separated by `delay`. The current state is
    /// re-read on every attempt.
    pub async fn retry_transition(
        &self,
        memory_id: &str,
        to: MemoryState,
        opts: &TransitionOptions,
        max_retries: u32,
        delay: Duration,
    ) -> Result<bool> {
        for attempt in 0..max_retries {
            if self.transition(memory_id, to, opts)? {
                return Ok(true);
            }
            if attempt + 1 < max_retries {
                tokio::time::sleep(delay).await;
            }
        }
        Ok(false)
    }

    /// Count of records per state within a namespace.
    pub fn states_by_namespace(&self, namespace: &str) -> Result<HashMap<MemoryState, i64>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT current_state, COUNT(*) FROM memory_state
             WHERE namespace = ?1
             GROUP BY current_state",
        )?;
        let rows = stmt.query_map([namespace], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut out = HashMap::new();
        for row in rows {
            let (state, count) = row?;
            if let Ok(parsed) = state.parse::<MemoryState>() {
                out.insert(parsed, count);
            }
        }
        Ok(out)
    }
}
