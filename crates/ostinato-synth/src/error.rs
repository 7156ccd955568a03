//! Error types for ostinato-synth.

use thiserror::Error;

/// Result type alias for ostinato-synth operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in ostinato-synth.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid configuration parameter.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Voice pool could not be allocated.
    #[error("Failed to allocate voice pool ({0} voices)")]
    PoolAllocation(usize),
}
