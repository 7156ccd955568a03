//! Centralized error type for the ostinato umbrella crate.
//!
//! Wraps all subsystem errors so `?` propagates naturally across crate boundaries.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] ostinato_core::Error),

    #[error("Synth: {0}")]
    Synth(#[from] ostinato_synth::Error),

    #[error("Driver: {0}")]
    Driver(#[from] ostinato_io::Error),

    #[error("Part {0} did not become ready in time")]
    ReadyTimeout(usize),

    #[error("Event for part {0} dropped: queue full")]
    EventDropped(usize),

    #[error("Thread: {0}")]
    Thread(#[from] std::io::Error),
}

impl Error {
    /// A pool could not be allocated, at build time or while a restart
    /// rebuilds a part. Nothing can run without it.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Core(ostinato_core::Error::PoolAllocation { .. })
                | Error::Synth(ostinato_synth::Error::PoolAllocation(_))
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
