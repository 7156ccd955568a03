//! Timing core for the Ostinato synthesis engine.
//!
//! # Primary API
//!
//! - [`ClockedBuffer`] / [`OutputRing`]: shared ring geometry, cursors and per-part output
//! - [`MidiClockPll`]: maps wall-clock arrival times onto frame offsets
//! - [`EventQueue`]: per-part, per-sample-slot lock-free event storage
//! - [`EventDispatcher`]: parses, timestamps and routes incoming MIDI
//! - [`EngineConfig`]: startup/resync parameters
//!
//! Every type shared between threads is lock-free on the hot path. Conditions
//! the hot path cannot report directly are counted in [`TimingStats`].
//!
//! # Example
//!
//! ```ignore
//! use ostinato_core::*;
//!
//! let stats = Arc::new(TimingStats::new());
//! let pll = MidiClockPll::new(48000, 256, stats.clone());
//! pll.update_now();
//! let offset = pll.sample_offset_for(pll.now_ns());
//! ```

pub mod error;
pub use error::{Error, Result};

pub mod config;
pub use config::{
    AudioSettings, EngineConfig, EventSettings, KeyMode, PartConfig, SampleRateMode,
    ThreadSettings, MAX_PARTS, MAX_POLYPHONY,
};

pub mod buffer;
pub use buffer::{BufferGeometry, ClockedBuffer, Cursor, OutputRing};

pub mod dispatcher;
pub use dispatcher::{event_from_live, EventDispatcher};

pub mod event;
pub use event::{EventKind, SynthEvent};

pub(crate) mod lockfree;
pub use lockfree::{AtomicCounter, AtomicDouble, AtomicFlag, AtomicFloat};

pub mod pll;
pub use pll::{MidiClockPll, PhaseRegime};

pub mod queue;
pub use queue::EventQueue;

mod ready;
pub use ready::ReadySignal;

mod stats;
pub use stats::{StatsSnapshot, TimingStats};

pub use std::sync::Arc;
