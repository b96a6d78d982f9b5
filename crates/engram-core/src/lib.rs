//! Shared domain types, configuration, and the top-level error taxonomy for
//! the engram memory engine.

pub mod config;
pub mod error;
pub mod types;

pub use config::EngramConfig;
pub use error::{EngramError, Result};
pub use types::{
    ChatTurn, Classification, Importance, IngestMode, MemoryRecord, MemoryRelationship,
    ProviderKind, RelationshipKind, ShortTermRecord,
};
