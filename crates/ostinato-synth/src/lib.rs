//! Voice allocation for Ostinato.
//!
//! Everything here is owned by a single part's synthesis thread:
//!
//! - **[`VoiceAllocator`]** - Keymode-aware note handling and voice stealing
//! - **[`Envelope`]** - Attack/Decay/Sustain/Release/Fade interval state machine
//! - **[`HeldKeyList`]** - Press-ordered held keys backed by a fixed array
//! - **[`PartRuntime`]** / **[`Patch`]** - Performance and sound state of a part
//! - **[`VoiceRenderer`]** - Per-sample DSP seam, with [`BasicRenderer`] as a stand-in
//!
//! # Quick Start
//!
//! ```ignore
//! use ostinato_synth::{BasicRenderer, KeyMode, VoiceAllocator, VoiceRenderer};
//!
//! let mut voices = VoiceAllocator::new(8, KeyMode::Poly, 48000.0)?;
//! let mut renderer = BasicRenderer::new(48000.0);
//! voices.note_on(60, 100);
//!
//! let (pool, part, patch) = voices.render_state();
//! let (left, right) = renderer.render_sample(pool, part, patch);
//! voices.tick();
//! ```

pub mod error;
pub use error::{Error, Result};

mod allocator;
pub use allocator::{NoteOnResult, VoiceAllocator};

pub mod envelope;
pub use envelope::{Envelope, EnvelopeInterval, EnvelopeParams, TimeTable};

mod keylist;
pub use keylist::{HeldKeyList, HeldKeys};

pub mod part;
pub use part::PartRuntime;

mod patch;
pub use patch::Patch;

mod render;
pub use render::{pitch_to_hz, BasicRenderer, VoiceRenderer};

mod voice;
pub use voice::{Oscillator, Voice, MAX_OSCILLATORS};

pub use ostinato_core::KeyMode;
