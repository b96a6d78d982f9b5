use std::collections::HashSet;

use tracing::instrument;

use engram_core::types::MemoryRecord;

use crate::engine::StorageEngine;
use crate::error::Result;
use crate::types::{SearchOptions, SearchResult, SortDirection, SortField};

/// Weight of the lexical component relative to the additive boosts.
const LEXICAL_WEIGHT: f64 = 3.0;
/// Ceiling of the recency boost (fresh records), decaying with age.
const RECENCY_WEIGHT: f64 = 0.1;
/// Half-life of the recency boost, in days.
const RECENCY_HALF_LIFE_DAYS: f64 = 7.0;
/// Candidate pool fetched before in-process scoring.
const CANDIDATE_POOL: usize = 256;

impl StorageEngine {
    /// Ranked lexical search over long-term memories.
    ///
    /// Ranking precedence: weighted token-match score against the searchable
    /// content, then the importance score as an additive boost, then a mild
    /// recency boost, with a deterministic id tiebreak.
    #[instrument(skip(self, opts), fields(namespace = %opts.namespace, limit = opts.limit))]
    pub fn search_memories(&self, query: &str, opts: &SearchOptions) -> Result<Vec<SearchResult>> {
        let query_tokens = tokenize(query);
        let candidates = self.fetch_candidates(query, &query_tokens, opts)?;
        let now = chrono::Utc::now();

        let mut scored: Vec<SearchResult> = candidates
            .into_iter()
            .filter(|record| {
                if let Some(min) = opts.min_importance {
                    if record.importance_score < min.score() {
                        return false;
                    }
                }
                if !opts.categories.is_empty()
                    && !opts.categories.contains(&record.classification)
                {
                    return false;
                }
                true
            })
            .map(|record| {
                let lexical = lexical_score(&query_tokens, &record.searchable_content());
                let age_days = (now - record.extraction_timestamp).num_seconds().max(0) as f64
                    / 86_400.0;
                let recency = RECENCY_WEIGHT * 0.5_f64.powf(age_days / RECENCY_HALF_LIFE_DAYS);
                let score = LEXICAL_WEIGHT * lexical + record.importance_score + recency;
                let metadata = opts.include_metadata.then(|| {
                    serde_json::json!({
                        "lexical_score": lexical,
                        "importance_score": record.importance_score,
                        "recency_boost": recency,
                    })
                });
                SearchResult {
                    record,
                    score,
                    metadata,
                }
            })
            .collect();

        // Records with no lexical overlap only surface when the query itself
        // carries no tokens (browse mode).
        if !query_tokens.is_empty() {
            scored.retain(|r| {
                lexical_score(&query_tokens, &r.record.searchable_content()) > 0.0
            });
        }

        match opts.sort_by {
            None
            | Some(crate::types::SortBy {
                field: SortField::Relevance,
                ..
            }) => {
                scored.sort_by(|a, b| {
                    b.score
                        .partial_cmp(&a.score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| a.record.id.cmp(&b.record.id))
                });
            }
            Some(sort) => {
                scored.sort_by(|a, b| {
                    let ordering = match sort.field {
                        SortField::ImportanceScore => a
                            .record
                            .importance_score
                            .partial_cmp(&b.record.importance_score)
                            .unwrap_or(std::cmp::Ordering::Equal),
                        SortField::ExtractionTimestamp => a
                            .record
                            .extraction_timestamp
                            .cmp(&b.record.extraction_timestamp),
                        SortField::Relevance => unreachable!(),
                    };
                    let ordering = match sort.direction {
                        SortDirection::Asc => ordering,
                        SortDirection::Desc => ordering.reverse(),
                    };
                    ordering.then_with(|| a.record.id.cmp(&b.record.id))
                });
            }
        }

        Ok(scored
            .into_iter()
            .skip(opts.offset)
            .take(opts.limit)
            .collect())
    }

    /// Candidate fetch: FTS5 when available, LIKE scans otherwise. Both paths
    /// fall back to a namespace scan for token-free queries.
    fn fetch_candidates(
        &self,
        _query: &str,
        query_tokens: &HashSet<String>,
        opts: &SearchOptions,
    ) -> Result<Vec<MemoryRecord>> {
        if query_tokens.is_empty() {
            let mut all = self.records_in_namespace(&opts.namespace)?;
            all.truncate(CANDIDATE_POOL);
            return Ok(all);
        }

        let db = self.db.lock().unwrap();
        let mut out = Vec::new();

        if self.fts_enabled {
            // Tokens are OR-joined and quoted so user text can't inject FTS
            // query syntax.
            let match_expr = query_tokens
                .iter()
                .map(|t| format!("\"{}\"", t.replace('"', "")))
                .collect::<Vec<_>>()
                .join(" OR ");
            let mut stmt = db.prepare(
                "SELECT m.processed_data
                 FROM long_term_memory m
                 JOIN memory_fts f ON m.rowid = f.rowid
                 WHERE m.namespace = ?1 AND m.consolidated_into IS NULL
                   AND memory_fts MATCH ?2
                 ORDER BY rank
                 LIMIT ?3",
            )?;
            let rows = stmt.query_map(
                rusqlite::params![opts.namespace, match_expr, CANDIDATE_POOL as i64],
                |row| row.get::<_, String>(0),
            )?;
            for blob in rows {
                out.push(serde_json::from_str(&blob?)?);
            }
        } else {
            let mut conditions = Vec::new();
            let mut bound: Vec<String> = vec![opts.namespace.clone()];
            for token in query_tokens {
                bound.push(format!("%{token}%"));
                conditions.push(format!(
                    "lower(searchable_content) LIKE ?{}",
                    bound.len()
                ));
            }
            let sql = format!(
                "SELECT processed_data FROM long_term_memory
                 WHERE namespace = ?1 AND consolidated_into IS NULL AND ({})
                 LIMIT {CANDIDATE_POOL}",
                conditions.join(" OR ")
            );
            let mut stmt = db.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(bound.iter()), |row| {
                row.get::<_, String>(0)
            })?;
            for blob in rows {
                out.push(serde_json::from_str(&blob?)?);
            }
        }
        Ok(out)
    }

    /// Records in the namespace whose Jaccard similarity (lowercase
    /// whitespace tokens, no stemming or stopwords) with `text` meets the
    /// threshold. Returns `(record, similarity)` pairs, most similar first.
    #[instrument(skip(self, text), fields(namespace = %namespace, threshold))]
    pub fn find_potential_duplicates(
        &self,
        text: &str,
        namespace: &str,
        threshold: f64,
    ) -> Result<Vec<(MemoryRecord, f64)>> {
        let probe = tokenize(text);
        let mut out: Vec<(MemoryRecord, f64)> = self
            .records_in_namespace(namespace)?
            .into_iter()
            .filter_map(|record| {
                let similarity = jaccard(&probe, &tokenize(&record.content));
                (similarity >= threshold).then_some((record, similarity))
            })
            .collect();
        out.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.id.cmp(&b.0.id))
        });
        Ok(out)
    }
}

/// Lowercased whitespace token set. The exact duplicate-similarity contract:
/// no stemming, no stopword filtering.
pub fn tokenize(text: &str) -> HashSet<String> {
    text.split_whitespace()
        .map(|t| t.to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Jaccard similarity of two token sets.
pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = (a.len() + b.len()) as f64 - intersection;
    if union == 0.0 {
        0.0
    } else {
        intersection / union
    }
}

/// Fraction of query tokens present in the content.
fn lexical_score(query_tokens: &HashSet<String>, content: &str) -> f64 {
    if query_tokens.is_empty() {
        return 0.0;
    }
    let content_tokens = tokenize(content);
    let matched = query_tokens
        .iter()
        .filter(|t| content_tokens.contains(*t))
        .count();
    matched as f64 / query_tokens.len() as f64
}
