use rusqlite::{Connection, Result};
use tracing::warn;

/// Initialise memory tables. Safe to call on every startup (idempotent).
pub fn init_db(conn: &Connection) -> Result<()> {
    create_chat_history(conn)?;
    create_long_term(conn)?;
    create_short_term(conn)?;
    create_relationships(conn)?;
    Ok(())
}

/// Probe FTS5 availability by creating the index. Search degrades to LIKE
/// scans when the loaded SQLite lacks the FTS5 module.
pub fn probe_fts(conn: &Connection) -> bool {
    match conn.execute_batch(
        "CREATE VIRTUAL TABLE IF NOT EXISTS memory_fts
            USING fts5(searchable_content, summary,
                       content='long_term_memory', content_rowid='rowid');",
    ) {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "FTS5 unavailable, search falls back to LIKE scans");
            false
        }
    }
}

fn create_chat_history(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS chat_history (
            chat_id    TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            namespace  TEXT NOT NULL,
            user_input TEXT NOT NULL,
            ai_output  TEXT NOT NULL,
            model_used TEXT NOT NULL,
            timestamp  TEXT NOT NULL,
            metadata   TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_chat_namespace
            ON chat_history(namespace, timestamp DESC);",
    )
}

fn create_long_term(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS long_term_memory (
            memory_id             TEXT PRIMARY KEY,
            conversation_id       TEXT NOT NULL,
            namespace             TEXT NOT NULL,
            content               TEXT NOT NULL,
            summary               TEXT NOT NULL,
            classification        TEXT NOT NULL,
            importance            TEXT NOT NULL,
            importance_score      REAL NOT NULL,
            topic                 TEXT,
            entities              TEXT NOT NULL DEFAULT '[]',
            keywords              TEXT NOT NULL DEFAULT '[]',
            confidence_score      REAL NOT NULL,
            classification_reason TEXT NOT NULL DEFAULT '',
            promotion_eligible    INTEGER NOT NULL DEFAULT 0,
            extraction_timestamp  TEXT NOT NULL,
            conscious_processed   INTEGER NOT NULL DEFAULT 0,
            consolidated_into     TEXT,
            searchable_content    TEXT NOT NULL,
            processed_data        TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_ltm_namespace
            ON long_term_memory(namespace, extraction_timestamp DESC);
        CREATE INDEX IF NOT EXISTS idx_ltm_classification
            ON long_term_memory(namespace, classification, conscious_processed);
        CREATE INDEX IF NOT EXISTS idx_ltm_importance
            ON long_term_memory(namespace, importance_score DESC);",
    )
}

fn create_short_term(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS short_term_memory (
            id                   INTEGER PRIMARY KEY AUTOINCREMENT,
            chat_id              TEXT NOT NULL,
            namespace            TEXT NOT NULL,
            processed_data       TEXT NOT NULL,
            importance_score     REAL NOT NULL,
            category_primary     TEXT NOT NULL,
            retention_type       TEXT NOT NULL DEFAULT 'short_term',
            searchable_content   TEXT NOT NULL,
            summary              TEXT NOT NULL,
            is_permanent_context INTEGER NOT NULL DEFAULT 0,
            created_at           TEXT NOT NULL,
            UNIQUE(chat_id, namespace)
        );
        CREATE INDEX IF NOT EXISTS idx_stm_namespace
            ON short_term_memory(namespace, created_at DESC);",
    )
}

fn create_relationships(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS memory_relationships (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            namespace  TEXT NOT NULL,
            source_id  TEXT NOT NULL,
            target_id  TEXT NOT NULL,
            kind       TEXT NOT NULL,
            confidence REAL NOT NULL,
            strength   REAL NOT NULL,
            reason     TEXT NOT NULL DEFAULT '',
            entities   TEXT NOT NULL DEFAULT '[]',
            context    TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_rel_source
            ON memory_relationships(namespace, source_id);
        CREATE INDEX IF NOT EXISTS idx_rel_target
            ON memory_relationships(namespace, target_id);",
    )
}
