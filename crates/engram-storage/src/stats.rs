use rusqlite::{Connection, OpenFlags, OptionalExtension};

use crate::engine::StorageEngine;
use crate::error::{Result, StorageError};
use crate::types::DbStats;

impl StorageEngine {
    /// Aggregate counts for a namespace. File-backed databases run the three
    /// table aggregations on parallel blocking tasks with their own read
    /// connections; `:memory:` databases (not shareable across connections)
    /// fall back to sequential aggregation.
    pub async fn database_stats(&self, namespace: &str) -> Result<DbStats> {
        if self.path == ":memory:" {
            return self.database_stats_sync(namespace);
        }

        let (chat, long_term, short_term) = tokio::try_join!(
            run_aggregation(self.path.clone(), namespace.to_string(), chat_aggregation),
            run_aggregation(self.path.clone(), namespace.to_string(), long_term_aggregation),
            run_aggregation(self.path.clone(), namespace.to_string(), short_term_aggregation),
        )?;

        let (conversation_count, chat_last) = chat;
        let ((long_term_count, conscious_count), lt_last) = long_term;
        let (short_term_count, st_last) = short_term;

        Ok(DbStats {
            conversation_count,
            long_term_count,
            short_term_count,
            conscious_count,
            last_activity: [chat_last, lt_last, st_last].into_iter().flatten().max(),
        })
    }

    fn database_stats_sync(&self, namespace: &str) -> Result<DbStats> {
        let db = self.db.lock().unwrap();
        let (conversation_count, chat_last) = chat_aggregation(&db, namespace)?;
        let ((long_term_count, conscious_count), lt_last) = long_term_aggregation(&db, namespace)?;
        let (short_term_count, st_last) = short_term_aggregation(&db, namespace)?;
        Ok(DbStats {
            conversation_count,
            long_term_count,
            short_term_count,
            conscious_count,
            last_activity: [chat_last, lt_last, st_last].into_iter().flatten().max(),
        })
    }
}

async fn run_aggregation<T: Send + 'static>(
    path: String,
    namespace: String,
    f: fn(&Connection, &str) -> Result<T>,
) -> Result<T> {
    tokio::task::spawn_blocking(move || {
        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        f(&conn, &namespace)
    })
    .await
    .map_err(|e| StorageError::Task(e.to_string()))?
}

fn chat_aggregation(conn: &Connection, namespace: &str) -> Result<(i64, Option<String>)> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM chat_history WHERE namespace = ?1",
        [namespace],
        |row| row.get(0),
    )?;
    let last: Option<String> = conn
        .query_row(
            "SELECT MAX(timestamp) FROM chat_history WHERE namespace = ?1",
            [namespace],
            |row| row.get(0),
        )
        .optional()?
        .flatten();
    Ok((count, last))
}

fn long_term_aggregation(
    conn: &Connection,
    namespace: &str,
) -> Result<((i64, i64), Option<String>)> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM long_term_memory WHERE namespace = ?1",
        [namespace],
        |row| row.get(0),
    )?;
    let conscious = conn.query_row(
        "SELECT COUNT(*) FROM long_term_memory
         WHERE namespace = ?1 AND classification = 'conscious-info'",
        [namespace],
        |row| row.get(0),
    )?;
    let last: Option<String> = conn
        .query_row(
            "SELECT MAX(extraction_timestamp) FROM long_term_memory WHERE namespace = ?1",
            [namespace],
            |row| row.get(0),
        )
        .optional()?
        .flatten();
    Ok(((count, conscious), last))
}

fn short_term_aggregation(conn: &Connection, namespace: &str) -> Result<(i64, Option<String>)> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM short_term_memory WHERE namespace = ?1",
        [namespace],
        |row| row.get(0),
    )?;
    let last: Option<String> = conn
        .query_row(
            "SELECT MAX(created_at) FROM short_term_memory WHERE namespace = ?1",
            [namespace],
            |row| row.get(0),
        )
        .optional()?
        .flatten();
    Ok((count, last))
}
