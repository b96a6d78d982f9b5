use std::collections::HashSet;

use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, instrument};

use engram_core::types::{MemoryRelationship, RelationshipKind};

use crate::engine::StorageEngine;
use crate::error::Result;
use crate::types::RelationshipOutcome;

impl StorageEngine {
    /// Store a batch of directed relationships from `source_id`. Edges that
    /// violate an invariant (self-edge, missing endpoint, out-of-range
    /// scores, supersedes cycle) are skipped with an entry in `errors`.
    #[instrument(skip(self, relationships), fields(source_id, namespace, count = relationships.len()))]
    pub fn store_relationships(
        &self,
        source_id: &str,
        relationships: &[MemoryRelationship],
        namespace: &str,
    ) -> Result<RelationshipOutcome> {
        let mut outcome = RelationshipOutcome::default();
        let db = self.db.lock().unwrap();
        let now = chrono::Utc::now().to_rfc3339();

        for rel in relationships {
            let source = if rel.source_id.is_empty() {
                source_id
            } else {
                rel.source_id.as_str()
            };
            let target = rel.target_id.as_str();

            if source == target {
                outcome
                    .errors
                    .push(format!("self-relationship rejected for {source}"));
                continue;
            }
            if !(0.0..=1.0).contains(&rel.confidence) || !(0.0..=1.0).contains(&rel.strength) {
                outcome.errors.push(format!(
                    "scores out of range for {source} -> {target}"
                ));
                continue;
            }
            if !memory_exists(&db, source, namespace)? {
                outcome
                    .errors
                    .push(format!("unknown source memory: {source}"));
                continue;
            }
            if !memory_exists(&db, target, namespace)? {
                outcome
                    .errors
                    .push(format!("unknown target memory: {target}"));
                continue;
            }
            if rel.kind == RelationshipKind::Supersedes
                && creates_supersedes_cycle(&db, source, target, namespace)?
            {
                outcome.errors.push(format!(
                    "supersedes cycle rejected: {source} -> {target}"
                ));
                continue;
            }

            db.execute(
                "INSERT INTO memory_relationships
                 (namespace, source_id, target_id, kind, confidence, strength,
                  reason, entities, context, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                rusqlite::params![
                    namespace,
                    source,
                    target,
                    rel.kind.to_string(),
                    rel.confidence,
                    rel.strength,
                    rel.reason,
                    serde_json::to_string(&rel.entities)?,
                    rel.context,
                    now,
                ],
            )?;
            outcome.stored += 1;
        }

        debug!(stored = outcome.stored, skipped = outcome.errors.len(), "relationships stored");
        Ok(outcome)
    }

    /// Every edge touching `memory_id` (as source or target).
    pub fn relationships_for(
        &self,
        memory_id: &str,
        namespace: &str,
    ) -> Result<Vec<MemoryRelationship>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT source_id, target_id, kind, confidence, strength, reason, entities, context
             FROM memory_relationships
             WHERE namespace = ?1 AND (source_id = ?2 OR target_id = ?2)
             ORDER BY id",
        )?;
        let rows = stmt.query_map(rusqlite::params![namespace, memory_id], row_to_relationship)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Delete every edge touching `memory_id`. Called when a record reaches
    /// the cleaned state.
    pub fn delete_relationships_for(&self, memory_id: &str, namespace: &str) -> Result<usize> {
        let db = self.db.lock().unwrap();
        let removed = db.execute(
            "DELETE FROM memory_relationships
             WHERE namespace = ?1 AND (source_id = ?2 OR target_id = ?2)",
            rusqlite::params![namespace, memory_id],
        )?;
        Ok(removed)
    }
}

pub(crate) fn memory_exists(db: &Connection, memory_id: &str, namespace: &str) -> Result<bool> {
    let found: Option<i64> = db
        .query_row(
            "SELECT 1 FROM long_term_memory WHERE memory_id = ?1 AND namespace = ?2",
            rusqlite::params![memory_id, namespace],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Would adding `source -> target` close a supersedes loop? Walks the
/// existing supersedes edges from `target`; reaching `source` means yes.
fn creates_supersedes_cycle(
    db: &Connection,
    source: &str,
    target: &str,
    namespace: &str,
) -> Result<bool> {
    let mut visited: HashSet<String> = HashSet::new();
    let mut frontier = vec![target.to_string()];

    while let Some(current) = frontier.pop() {
        if current == source {
            return Ok(true);
        }
        if !visited.insert(current.clone()) {
            continue;
        }
        let mut stmt = db.prepare(
            "SELECT target_id FROM memory_relationships
             WHERE namespace = ?1 AND source_id = ?2 AND kind = 'supersedes'",
        )?;
        let next: Vec<String> = stmt
            .query_map(rusqlite::params![namespace, current], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        frontier.extend(next);
    }
    Ok(false)
}

fn row_to_relationship(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryRelationship> {
    let kind: String = row.get(2)?;
    let entities: String = row.get(6)?;
    Ok(MemoryRelationship {
        source_id: row.get(0)?,
        target_id: row.get(1)?,
        kind: kind.parse().unwrap_or(RelationshipKind::Reference),
        confidence: row.get(3)?,
        strength: row.get(4)?,
        reason: row.get(5)?,
        entities: serde_json::from_str(&entities).unwrap_or_default(),
        context: row.get(7)?,
    })
}
