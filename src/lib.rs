//! # Ostinato - Real-time Polyphonic Synthesis Engine
//!
//! Sample-accurate MIDI-to-audio engine built from three subsystems.
//!
//! ## Architecture
//!
//! Ostinato is an umbrella crate that coordinates:
//! - **ostinato-core** - Clocked buffer, MIDI clock PLL, event queues, dispatcher, config
//! - **ostinato-synth** - Voice allocation, envelopes, held-key lists, renderer seam
//! - **ostinato-io** - Audio drivers (none, timer, cpal) and event drivers (none, virtual, midir)
//!
//! The [`SynthEngine`] owns one synthesis thread per part, the audio and
//! event drivers, and a watchdog thread that restarts drivers after faults,
//! device changes and format renegotiation.
//!
//! ## Quick Start
//!
//! ```ignore
//! use ostinato::prelude::*;
//!
//! let engine = SynthEngine::builder()
//!     .part(PartConfig { polyphony: 8, ..Default::default() })
//!     .audio_driver_name("cpal")
//!     .event_driver_name("midir")
//!     .build()?;
//! engine.start()?;
//!
//! // Events can also be injected directly
//! engine.note_on(0, 60, 100);
//! ```
//!
//! ## Feature Flags
//!
//! - `cpal` - Hardware audio output (default)
//! - `midi-io` - Hardware MIDI input through midir (default)

mod builder;
mod callback;
mod engine;
mod error;
mod synthesis;
mod watchdog;

pub use builder::SynthEngineBuilder;
pub use engine::SynthEngine;
pub use error::{Error, Result};
pub use synthesis::RendererFactory;

/// Re-export of ostinato-core for direct access
pub use ostinato_core as core;
/// Re-export of ostinato-io for direct access
pub use ostinato_io as io;
/// Re-export of ostinato-synth for direct access
pub use ostinato_synth as synth;

pub use ostinato_core::{
    BufferGeometry, EngineConfig, EventKind, KeyMode, MidiClockPll, PartConfig, SampleRateMode,
    StatsSnapshot, SynthEvent,
};
pub use ostinato_io::{
    AudioDriver, DeviceInfo, DriverFault, DriverState, DriverStatus, EventDriver, RawMessage,
    Subsystem, VirtualPort,
};
pub use ostinato_synth::{BasicRenderer, Voice, VoiceRenderer};

/// Convenience prelude for common imports
pub mod prelude {
    pub use crate::{Error, Result, SynthEngine, SynthEngineBuilder};

    pub use crate::core::{EngineConfig, EventKind, KeyMode, PartConfig, SampleRateMode, SynthEvent};

    pub use crate::io::{DriverState, Subsystem, VirtualPort};

    pub use crate::synth::{BasicRenderer, VoiceRenderer};
}
