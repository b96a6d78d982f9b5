//! SQLite persistence for the memory engine: chat history, long/short-term
//! memories, relationships, consolidation, ranked lexical search, and
//! namespace statistics.

pub mod consolidate;
pub mod db;
pub mod engine;
pub mod error;
pub mod relationships;
pub mod search;
pub mod stats;
pub mod types;

pub use engine::StorageEngine;
pub use error::{Result, StorageError};
pub use types::{
    ConsolidationOutcome, DbStats, RelationshipOutcome, SearchOptions, SearchResult, SortBy,
    SortDirection, SortField,
};
