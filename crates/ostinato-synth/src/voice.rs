//! Pre-allocated voice state.
//!
//! Voices are created once per part and reused for the life of the engine;
//! freeing a voice only clears `allocated`.

use crate::envelope::{Envelope, EnvelopeInterval, TimeTable};
use crate::patch::Patch;

/// Oscillator slots per voice, used by Mono-Multikey to spread held keys.
pub const MAX_OSCILLATORS: usize = 4;

/// One pitch source within a voice, with its own glide.
#[derive(Debug, Clone, Default)]
pub struct Oscillator {
    pub note: u8,
    /// Current pitch in semitones (MIDI note numbers, fractional while gliding).
    pub pitch: f32,
    target: f32,
    glide_remaining: u32,
    glide_delta: f32,
    /// Renderer phase in cycles, `[0, 1)`.
    pub phase: f32,
}

impl Oscillator {
    /// Jump straight to `note`.
    pub fn set_note(&mut self, note: u8) {
        self.note = note;
        self.pitch = note as f32;
        self.target = self.pitch;
        self.glide_remaining = 0;
        self.glide_delta = 0.0;
    }

    /// Glide from the current pitch to `note` over `samples` (0 = jump).
    pub fn glide_to(&mut self, note: u8, samples: u32) {
        if samples == 0 {
            self.set_note(note);
            return;
        }
        self.note = note;
        self.target = note as f32;
        self.glide_remaining = samples;
        self.glide_delta = (self.target - self.pitch) / samples as f32;
    }

    pub fn is_gliding(&self) -> bool {
        self.glide_remaining > 0
    }

    #[inline]
    fn tick(&mut self) {
        if self.glide_remaining > 0 {
            self.pitch += self.glide_delta;
            self.glide_remaining -= 1;
            if self.glide_remaining == 0 {
                self.pitch = self.target;
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Voice {
    pub id: usize,
    /// Owned by a note; `false` means the slot is free.
    pub allocated: bool,
    /// Key still down (or held by the pedal). Cleared on release.
    pub active: bool,
    pub note: u8,
    pub velocity: u8,
    /// Samples since allocation.
    pub age: u64,
    /// Released while the hold pedal was down; released on pedal-up.
    pub sustained: bool,
    pub amp_env: Envelope,
    pub filter_env: Envelope,
    pub oscillators: [Oscillator; MAX_OSCILLATORS],
    pub osc_count: usize,
}

impl Voice {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            allocated: false,
            active: false,
            note: 0,
            velocity: 0,
            age: 0,
            sustained: false,
            amp_env: Envelope::new(),
            filter_env: Envelope::new(),
            oscillators: Default::default(),
            osc_count: 1,
        }
    }

    /// Claim the voice for `note` and start both envelopes from Attack.
    pub(crate) fn start(
        &mut self,
        note: u8,
        velocity: u8,
        from_pitch: Option<u8>,
        glide_samples: u32,
        patch: &Patch,
        table: &TimeTable,
    ) {
        self.allocated = true;
        self.active = true;
        self.sustained = false;
        self.note = note;
        self.velocity = velocity;
        self.age = 0;
        self.osc_count = 1;
        let osc = &mut self.oscillators[0];
        osc.phase = 0.0;
        match from_pitch {
            Some(from) if glide_samples > 0 => {
                osc.set_note(from);
                osc.glide_to(note, glide_samples);
            }
            _ => osc.set_note(note),
        }
        self.amp_env.trigger(&patch.amp, table);
        self.filter_env.trigger(&patch.filter, table);
    }

    /// Key released: enter Release unless the pedal holds it.
    pub(crate) fn release(&mut self, hold: bool, patch: &Patch, table: &TimeTable) {
        if !self.allocated || !self.active {
            return;
        }
        if hold {
            self.sustained = true;
            return;
        }
        self.active = false;
        self.sustained = false;
        self.amp_env.release(&patch.amp, table);
        self.filter_env.release(&patch.filter, table);
    }

    /// Mark free. The caller guarantees this happens once per allocation.
    pub(crate) fn free(&mut self) {
        self.allocated = false;
        self.active = false;
        self.sustained = false;
        self.age = 0;
        self.amp_env.kill();
        self.filter_env.kill();
    }

    pub fn is_releasing(&self) -> bool {
        self.allocated && self.amp_env.is_releasing()
    }

    pub fn interval(&self) -> EnvelopeInterval {
        self.amp_env.interval()
    }

    /// Advance one sample. Returns `true` if the voice became free.
    #[inline]
    pub(crate) fn tick(&mut self) -> bool {
        if !self.allocated {
            return false;
        }
        self.age += 1;
        for osc in self.oscillators[..self.osc_count].iter_mut() {
            osc.tick();
        }
        self.filter_env.tick();
        self.amp_env.tick();
        if self.amp_env.is_done() {
            self.free();
            return true;
        }
        false
    }
}
