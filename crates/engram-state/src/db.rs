use rusqlite::{Connection, Result};

/// Initialise state tables. Safe to call on every startup (idempotent).
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS memory_state (
            memory_id     TEXT PRIMARY KEY,
            namespace     TEXT NOT NULL,
            current_state TEXT NOT NULL,
            updated_at    TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_state_namespace
            ON memory_state(namespace, current_state);

        CREATE TABLE IF NOT EXISTS memory_state_history (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            memory_id     TEXT NOT NULL,
            from_state    TEXT,
            to_state      TEXT NOT NULL,
            timestamp     TEXT NOT NULL,
            reason        TEXT NOT NULL,
            agent_id      TEXT NOT NULL,
            error_message TEXT,
            metadata      TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_history_memory
            ON memory_state_history(memory_id, id);",
    )
}
