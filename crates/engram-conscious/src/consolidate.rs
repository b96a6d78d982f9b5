use std::collections::HashSet;
use std::time::Instant;

use futures_util::future::join_all;
use serde::Serialize;
use tracing::{info, warn};

use engram_core::types::Classification;
use engram_state::{MemoryState, TransitionOptions};
use engram_storage::search::{jaccard, tokenize};

use crate::agent::{ConsciousAgent, AGENT_ID};
use crate::error::Result;

/// Candidate discovery runs with a relaxed threshold; group acceptance then
/// requires the *average* pairwise similarity to meet the real threshold.
const PREFILTER_RELAXATION: f64 = 0.8;

#[derive(Debug, Clone, Serialize)]
pub struct ConsolidateOptions {
    pub similarity_threshold: f64,
    pub dry_run: bool,
    pub batch_size: usize,
}

impl Default for ConsolidateOptions {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.7,
            dry_run: false,
            batch_size: 10,
        }
    }
}

/// Conscious-record counts around the run. `peak` is the larger of the two.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MemoryUsage {
    pub before: i64,
    pub after: i64,
    pub peak: i64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ConsolidationStats {
    pub groups_processed: usize,
    pub total_duplicates: usize,
    pub average_similarity: f64,
    pub safety_checks_passed: usize,
    pub safety_checks_failed: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConsolidationReport {
    /// Conscious records examined as primary candidates.
    pub total_processed: usize,
    pub duplicates_found: usize,
    /// Groups merged (or, on a dry run, groups that would merge).
    pub consolidated: usize,
    pub errors: Vec<String>,
    /// Duplicates discovered but not merged (below threshold or safety-failed).
    pub skipped: usize,
    pub processing_time_ms: u64,
    pub memory_usage: MemoryUsage,
    pub consolidation_stats: ConsolidationStats,
}

struct Group {
    primary_id: String,
    duplicate_ids: Vec<String>,
    average_similarity: f64,
}

impl ConsciousAgent {
    /// Find and merge near-duplicate conscious records.
    ///
    /// Primary selection is first-seen-wins over the storage load order; a
    /// record claimed as a duplicate never becomes a later primary. Groups
    /// are processed in concurrent batches of `batch_size`. A dry run
    /// reports the plan and touches nothing.
    pub async fn consolidate_duplicates(
        &self,
        opts: &ConsolidateOptions,
    ) -> Result<ConsolidationReport> {
        let started = Instant::now();
        let namespace = self.namespace().to_string();
        let mut report = ConsolidationReport::default();

        let records = self.storage.conscious_records(&namespace)?;
        report.total_processed = records.len();
        report.memory_usage.before = records.len() as i64;

        let mut used: HashSet<String> = HashSet::new();
        let mut groups: Vec<Group> = Vec::new();
        let prefilter = opts.similarity_threshold * PREFILTER_RELAXATION;

        for record in &records {
            if used.contains(&record.id) {
                continue;
            }
            let primary_tokens = tokenize(&record.content);
            let candidates =
                self.storage
                    .find_potential_duplicates(&record.content, &namespace, prefilter)?;

            let duplicates: Vec<(String, f64)> = candidates
                .into_iter()
                .filter(|(c, _)| {
                    c.id != record.id
                        && !used.contains(&c.id)
                        && c.classification == Classification::ConsciousInfo
                })
                .map(|(c, _)| {
                    let similarity = jaccard(&primary_tokens, &tokenize(&c.content));
                    (c.id, similarity)
                })
                .collect();
            if duplicates.is_empty() {
                continue;
            }
            report.duplicates_found += duplicates.len();

            let duplicate_ids: Vec<String> =
                duplicates.iter().map(|(id, _)| id.clone()).collect();
            let safety_errors =
                self.storage
                    .validate_consolidation(&record.id, &duplicate_ids, &namespace)?;
            if !safety_errors.is_empty() {
                report.consolidation_stats.safety_checks_failed += 1;
                report.skipped += duplicate_ids.len();
                report.errors.extend(safety_errors);
                continue;
            }
            report.consolidation_stats.safety_checks_passed += 1;

            let average_similarity =
                duplicates.iter().map(|(_, s)| s).sum::<f64>() / duplicates.len() as f64;
            if average_similarity < opts.similarity_threshold {
                report.skipped += duplicate_ids.len();
                continue;
            }

            used.insert(record.id.clone());
            used.extend(duplicate_ids.iter().cloned());
            groups.push(Group {
                primary_id: record.id.clone(),
                duplicate_ids,
                average_similarity,
            });
        }

        report.consolidation_stats.groups_processed = groups.len();
        report.consolidation_stats.total_duplicates =
            groups.iter().map(|g| g.duplicate_ids.len()).sum();
        report.consolidation_stats.average_similarity = if groups.is_empty() {
            0.0
        } else {
            groups.iter().map(|g| g.average_similarity).sum::<f64>() / groups.len() as f64
        };

        for batch in groups.chunks(opts.batch_size) {
            let outcomes = join_all(
                batch
                    .iter()
                    .map(|group| self.process_group(group, &namespace, opts)),
            )
            .await;
            for outcome in outcomes {
                match outcome {
                    Ok((merged, mut errors)) => {
                        if merged {
                            report.consolidated += 1;
                        }
                        report.errors.append(&mut errors);
                    }
                    Err(e) => report.errors.push(e.to_string()),
                }
            }
        }

        report.memory_usage.after = self.storage.conscious_records(&namespace)?.len() as i64;
        report.memory_usage.peak = report.memory_usage.before.max(report.memory_usage.after);
        report.processing_time_ms = started.elapsed().as_millis() as u64;

        info!(
            namespace = %namespace,
            groups = report.consolidation_stats.groups_processed,
            consolidated = report.consolidated,
            dry_run = opts.dry_run,
            "consolidation run finished"
        );
        Ok(report)
    }

    /// Merge one group. Returns (merged, errors). Dry runs only log the plan.
    async fn process_group(
        &self,
        group: &Group,
        namespace: &str,
        opts: &ConsolidateOptions,
    ) -> Result<(bool, Vec<String>)> {
        if opts.dry_run {
            info!(
                primary = %group.primary_id,
                duplicates = group.duplicate_ids.len(),
                average_similarity = group.average_similarity,
                "dry run: group would consolidate"
            );
            return Ok((true, Vec::new()));
        }

        let mut errors = Vec::new();
        let stage = TransitionOptions::new("consolidation group staged", AGENT_ID);

        if !self
            .state
            .transition(&group.primary_id, MemoryState::ConsolidationProcessing, &stage)?
        {
            errors.push(format!(
                "could not stage primary {} for consolidation",
                group.primary_id
            ));
            return Ok((false, errors));
        }
        for dup_id in &group.duplicate_ids {
            if !self
                .state
                .transition(dup_id, MemoryState::ConsolidationProcessing, &stage)?
            {
                warn!(dup_id = %dup_id, "duplicate could not be staged, continuing");
            }
        }

        let outcome = self.storage.consolidate_duplicate_memories(
            &group.primary_id,
            &group.duplicate_ids,
            namespace,
        )?;
        errors.extend(outcome.errors);

        let merged = outcome.consolidated > 0;
        if merged {
            self.state.transition(
                &group.primary_id,
                MemoryState::Consolidated,
                &TransitionOptions::new("consolidation group merged", AGENT_ID).with_metadata(
                    serde_json::json!({ "duplicates": group.duplicate_ids.len() }),
                ),
            )?;
        } else {
            // nothing merged; release the primary back out of the
            // processing state via failed so it can be cleaned up
            self.state.transition(
                &group.primary_id,
                MemoryState::Failed,
                &TransitionOptions::new("consolidation produced no merges", AGENT_ID),
            )?;
        }
        Ok((merged, errors))
    }
}
