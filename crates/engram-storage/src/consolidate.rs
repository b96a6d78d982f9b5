use rusqlite::OptionalExtension;
use tracing::{debug, info, instrument, warn};

use engram_core::types::MemoryRecord;
use engram_state::{MemoryState, TransitionOptions};

use crate::engine::StorageEngine;
use crate::error::Result;
use crate::types::ConsolidationOutcome;

impl StorageEngine {
    /// Safety checks gating a consolidation group. Returns one message per
    /// violation; an empty vec means the group may proceed.
    pub fn validate_consolidation(
        &self,
        primary_id: &str,
        duplicate_ids: &[String],
        namespace: &str,
    ) -> Result<Vec<String>> {
        let mut errors = Vec::new();
        let db = self.db.lock().unwrap();

        if !crate::relationships::memory_exists(&db, primary_id, namespace)? {
            errors.push(format!("primary memory not found: {primary_id}"));
        }

        for dup_id in duplicate_ids {
            if dup_id == primary_id {
                errors.push(format!("self-consolidation rejected: {primary_id}"));
                continue;
            }
            let consolidated_into: Option<Option<String>> = db
                .query_row(
                    "SELECT consolidated_into FROM long_term_memory
                     WHERE memory_id = ?1 AND namespace = ?2",
                    rusqlite::params![dup_id, namespace],
                    |row| row.get(0),
                )
                .optional()?;
            match consolidated_into {
                None => errors.push(format!("duplicate memory not found: {dup_id}")),
                Some(Some(into)) if into == primary_id => {
                    errors.push(format!(
                        "cycle prevented: {dup_id} already consolidated into {primary_id}"
                    ));
                }
                _ => {}
            }
        }
        Ok(errors)
    }

    /// Merge near-duplicate records into `primary_id`.
    ///
    /// Per duplicate: entities/keywords merge into the primary, relationships
    /// that pointed at the duplicate are rewritten to point at the primary,
    /// the duplicate's blob gains a `consolidatedInto` back-reference, and
    /// its state moves to consolidated. Invalid duplicates are skipped into
    /// `errors`; valid ones still merge.
    #[instrument(skip(self, duplicate_ids), fields(primary_id, namespace, duplicates = duplicate_ids.len()))]
    pub fn consolidate_duplicate_memories(
        &self,
        primary_id: &str,
        duplicate_ids: &[String],
        namespace: &str,
    ) -> Result<ConsolidationOutcome> {
        let mut outcome = ConsolidationOutcome {
            errors: self.validate_consolidation(primary_id, duplicate_ids, namespace)?,
            ..Default::default()
        };
        if outcome
            .errors
            .iter()
            .any(|e| e.starts_with("primary memory not found"))
        {
            return Ok(outcome);
        }

        let valid: Vec<&String> = duplicate_ids
            .iter()
            .filter(|id| {
                !outcome
                    .errors
                    .iter()
                    .any(|e| e.contains(id.as_str()))
            })
            .collect();
        if valid.is_empty() {
            return Ok(outcome);
        }

        {
            let mut db = self.db.lock().unwrap();
            let tx = db.transaction()?;

            let primary_blob: String = tx.query_row(
                "SELECT processed_data FROM long_term_memory
                 WHERE memory_id = ?1 AND namespace = ?2",
                rusqlite::params![primary_id, namespace],
                |row| row.get(0),
            )?;
            let mut primary: MemoryRecord = serde_json::from_str(&primary_blob)?;

            for dup_id in &valid {
                let dup_blob: String = tx.query_row(
                    "SELECT processed_data FROM long_term_memory
                     WHERE memory_id = ?1 AND namespace = ?2",
                    rusqlite::params![dup_id, namespace],
                    |row| row.get(0),
                )?;
                let mut dup: MemoryRecord = serde_json::from_str(&dup_blob)?;

                // Merge entity/keyword sets, preserving primary order.
                for entity in &dup.entities {
                    if !primary.entities.contains(entity) {
                        primary.entities.push(entity.clone());
                    }
                }
                for keyword in &dup.keywords {
                    if !primary.keywords.contains(keyword) {
                        primary.keywords.push(keyword.clone());
                    }
                }

                // Relationships that pointed at the duplicate now point at
                // the primary; rewrites that became self-loops are dropped.
                tx.execute(
                    "UPDATE memory_relationships SET target_id = ?1
                     WHERE namespace = ?2 AND target_id = ?3",
                    rusqlite::params![primary_id, namespace, dup_id],
                )?;
                tx.execute(
                    "DELETE FROM memory_relationships
                     WHERE namespace = ?1 AND source_id = ?2 AND target_id = ?2",
                    rusqlite::params![namespace, primary_id],
                )?;

                dup.consolidated_into = Some(primary_id.to_string());
                tx.execute(
                    "UPDATE long_term_memory
                     SET consolidated_into = ?1, processed_data = ?2
                     WHERE memory_id = ?3 AND namespace = ?4",
                    rusqlite::params![
                        primary_id,
                        serde_json::to_string(&dup)?,
                        dup_id,
                        namespace
                    ],
                )?;
                debug!(dup_id = %dup_id, "duplicate folded into primary");
            }

            let searchable = primary.searchable_content();
            if self.fts_enabled {
                // external-content FTS: remove the old index entry while the
                // row still holds the old values, re-insert after the update
                tx.execute(
                    "INSERT INTO memory_fts(memory_fts, rowid, searchable_content, summary)
                     SELECT 'delete', rowid, searchable_content, summary
                     FROM long_term_memory WHERE memory_id = ?1",
                    [primary_id],
                )
                .ok();
            }
            tx.execute(
                "UPDATE long_term_memory
                 SET entities = ?1, keywords = ?2, searchable_content = ?3, processed_data = ?4
                 WHERE memory_id = ?5 AND namespace = ?6",
                rusqlite::params![
                    serde_json::to_string(&primary.entities)?,
                    serde_json::to_string(&primary.keywords)?,
                    searchable,
                    serde_json::to_string(&primary)?,
                    primary_id,
                    namespace
                ],
            )?;
            if self.fts_enabled {
                let rowid: i64 = tx.query_row(
                    "SELECT rowid FROM long_term_memory WHERE memory_id = ?1",
                    [primary_id],
                    |row| row.get(0),
                )?;
                tx.execute(
                    "INSERT INTO memory_fts(rowid, searchable_content, summary)
                     VALUES (?1, ?2, ?3)",
                    rusqlite::params![rowid, searchable, primary.summary],
                )?;
            }

            tx.commit()?;
        }

        // Data is committed; advance the duplicates' states. A duplicate that
        // was not staged into consolidation_processing by the caller is
        // staged here first.
        let opts = TransitionOptions::new("consolidated into primary", "storage-engine")
            .with_metadata(serde_json::json!({ "consolidatedInto": primary_id }));
        for dup_id in &valid {
            if self
                .state
                .can_transition(dup_id, MemoryState::ConsolidationProcessing)?
            {
                self.state
                    .transition(dup_id, MemoryState::ConsolidationProcessing, &opts)?;
            }
            if self.state.transition(dup_id, MemoryState::Consolidated, &opts)? {
                outcome.consolidated += 1;
            } else {
                warn!(dup_id = %dup_id, "duplicate merged but state did not reach consolidated");
                outcome.errors.push(format!(
                    "state transition to consolidated failed for {dup_id}"
                ));
            }
        }

        info!(
            consolidated = outcome.consolidated,
            errors = outcome.errors.len(),
            "consolidation finished"
        );
        Ok(outcome)
    }
}
