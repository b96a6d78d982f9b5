//! Durable, queryable memory for conversational LLM applications.
//!
//! [`Engram`] is the user-facing surface: it wires a provider transport (with
//! caching, pooling, and health monitoring), the extraction agent, SQLite
//! storage, the processing-state machine, and the conscious background loop
//! from one minimal config.
//!
//! ```no_run
//! use engram::{Engram, EngramOptions};
//! use engram_provider::{ChatRequest, Message};
//!
//! # async fn demo() -> engram::Result<()> {
//! let engine = Engram::new(EngramOptions::new(
//!     "file:/tmp/memory.db",
//!     "sk-your-key",
//! ))
//! .await?;
//!
//! let reply = engine
//!     .chat(ChatRequest::new("", vec![Message::user("My favorite color is blue.")]))
//!     .await?;
//! println!("{}", reply.content);
//!
//! let hits = engine.search_memories("color", None)?;
//! # engine.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod controller;
pub mod error;
pub mod facade;

pub use controller::{MemoryController, RecordOptions};
pub use facade::{Engram, EngramOptions};

pub use engram_conscious::{ConsolidateOptions, ConsolidationReport};
pub use engram_core::types::{
    Classification, Importance, IngestMode, MemoryRecord, ProviderKind,
};
pub use engram_core::{EngramError, Result};
pub use engram_provider::{ChatRequest, ChatResponse, EmbeddingRequest, Message, Role};
pub use engram_storage::{SearchOptions, SearchResult};
