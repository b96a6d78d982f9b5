//! Background conscious-ingestion worker: promotes conscious-info memory
//! records into the short-term working set and consolidates near-duplicates.

pub mod agent;
pub mod consolidate;
pub mod error;

pub use agent::{ConsciousAgent, IngestReport, AGENT_ID};
pub use consolidate::{
    ConsolidateOptions, ConsolidationReport, ConsolidationStats, MemoryUsage,
};
pub use error::{ConsciousError, Result};
