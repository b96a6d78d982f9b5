use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConsciousError {
    #[error("storage error: {0}")]
    Storage(#[from] engram_storage::StorageError),

    #[error("state error: {0}")]
    State(#[from] engram_state::StateError),
}

pub type Result<T> = std::result::Result<T, ConsciousError>;
