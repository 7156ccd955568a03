//! Error types for ostinato-core.

use thiserror::Error;

/// Error type for ostinato-core operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Invalid buffer geometry: period_size={period_size}, period_count={period_count}")]
    InvalidGeometry {
        period_size: usize,
        period_count: usize,
    },

    #[error("Buffer of {requested} frames exceeds preallocated capacity of {capacity}")]
    CapacityExceeded { requested: usize, capacity: usize },

    #[error("Failed to allocate {pool} pool ({entries} entries)")]
    PoolAllocation { pool: &'static str, entries: usize },

    #[error("Invalid part index: {0}")]
    InvalidPart(usize),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
