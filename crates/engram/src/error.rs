//! Folding of subsystem errors into the public [`EngramError`] taxonomy.

use engram_core::EngramError;
use engram_provider::ProviderError;
use engram_storage::StorageError;

/// Map a provider-layer failure. `Unsupported` and `Timeout` keep their
/// identity; everything else is a transport failure of the named provider.
pub fn from_provider(provider: &str, e: ProviderError) -> EngramError {
    match e {
        ProviderError::Unsupported(msg) => EngramError::Unsupported(msg),
        ProviderError::Timeout { ms } => EngramError::Timeout { ms },
        other => EngramError::Transport {
            provider: provider.to_string(),
            message: other.to_string(),
        },
    }
}

pub fn from_storage(e: StorageError) -> EngramError {
    EngramError::Storage(e.to_string())
}

pub fn from_state(e: engram_state::StateError) -> EngramError {
    EngramError::Storage(e.to_string())
}

pub fn from_conscious(e: engram_conscious::ConsciousError) -> EngramError {
    EngramError::Storage(e.to_string())
}
