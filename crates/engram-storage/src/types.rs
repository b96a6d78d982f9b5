use serde::{Deserialize, Serialize};

use engram_core::types::{Classification, Importance, MemoryRecord};

/// Search ordering override. The default is the blended relevance ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    Relevance,
    ImportanceScore,
    ExtractionTimestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SortBy {
    pub field: SortField,
    pub direction: SortDirection,
}

/// Options for ranked memory search.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub namespace: String,
    /// Maximum records returned. Default 5.
    pub limit: usize,
    /// Drop records whose importance score sits below this tier's score.
    pub min_importance: Option<Importance>,
    /// Keep only these classifications. Empty = all.
    pub categories: Vec<Classification>,
    /// Attach scoring metadata to each hit.
    pub include_metadata: bool,
    pub sort_by: Option<SortBy>,
    /// Paging offset, applied after ranking.
    pub offset: usize,
}

impl SearchOptions {
    pub fn for_namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            limit: 5,
            min_importance: None,
            categories: Vec::new(),
            include_metadata: false,
            sort_by: None,
            offset: 0,
        }
    }
}

/// One ranked search hit.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub record: MemoryRecord,
    /// Blended ranking score (lexical + importance + recency).
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Result of a relationship batch store: invalid edges are skipped, not fatal.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RelationshipOutcome {
    pub stored: usize,
    pub errors: Vec<String>,
}

/// Result of one consolidation call.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConsolidationOutcome {
    pub consolidated: usize,
    pub errors: Vec<String>,
}

/// Aggregate counts for one namespace.
#[derive(Debug, Clone, Serialize)]
pub struct DbStats {
    pub conversation_count: i64,
    pub long_term_count: i64,
    pub short_term_count: i64,
    pub conscious_count: i64,
    /// Most recent activity timestamp across all tables (RFC3339).
    pub last_activity: Option<String>,
}
