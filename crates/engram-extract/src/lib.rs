//! Memory extraction agent: distils (user input, AI output) pairs into
//! structured memory records via a secondary LLM call, with a guaranteed
//! fallback shape when the model's output cannot be validated.

pub mod extractor;
pub mod prompt;

pub use extractor::{
    fallback_record, ConversationContext, ConversationInput, ExtractError, MemoryExtractor,
};
