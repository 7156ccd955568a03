//! Keymode-aware voice allocation and note lifecycle.
//!
//! One allocator per part, owned by that part's synthesis thread. It applies
//! drained events to the voice pool and advances envelopes one sample at a
//! time. Nothing here allocates after construction.
//!
//! Keymodes:
//! - **Poly**: a free voice if any, else steal the strictly oldest (lowest id on ties)
//! - **Mono-Smooth**: one rotating voice; legato notes glide, a releasing voice is
//!   fast-tracked back into Sustain instead of re-attacking
//! - **Mono-Retrigger**: every note releases the others and attacks a freshly rotated voice
//! - **Mono-Multikey**: one voice whose oscillators follow the held keys

use crate::envelope::{EnvelopeInterval, TimeTable};
use crate::part::{cc, PartRuntime};
use crate::patch::Patch;
use crate::voice::{Voice, MAX_OSCILLATORS};
use crate::{Error, Result};
use ostinato_core::{EventKind, KeyMode, PartConfig, MAX_POLYPHONY};

/// Outcome of a note-on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoteOnResult {
    /// A free voice started a fresh Attack.
    Allocated { voice: usize },
    /// A sounding voice was taken over.
    Stolen { voice: usize, previous_note: u8 },
    /// The sounding voice moved to the new note without a new Attack.
    Legato { voice: usize },
    /// Other voices were released and a rotated voice re-attacked.
    Retriggered { voice: usize },
}

impl NoteOnResult {
    pub fn voice(&self) -> usize {
        match *self {
            NoteOnResult::Allocated { voice }
            | NoteOnResult::Stolen { voice, .. }
            | NoteOnResult::Legato { voice }
            | NoteOnResult::Retriggered { voice } => voice,
        }
    }
}

#[derive(Debug)]
pub struct VoiceAllocator {
    voices: Box<[Voice]>,
    keymode: KeyMode,
    part: PartRuntime,
    patch: Patch,
    table: TimeTable,
    freed: u64,
}

impl VoiceAllocator {
    pub fn new(polyphony: usize, keymode: KeyMode, sample_rate: f64) -> Result<Self> {
        if polyphony == 0 || polyphony > MAX_POLYPHONY {
            return Err(Error::InvalidConfig(format!(
                "polyphony {} out of range (1-{})",
                polyphony, MAX_POLYPHONY
            )));
        }
        let mut voices = Vec::new();
        voices
            .try_reserve_exact(polyphony)
            .map_err(|_| Error::PoolAllocation(polyphony))?;
        voices.extend((0..polyphony).map(Voice::new));

        Ok(Self {
            voices: voices.into_boxed_slice(),
            keymode,
            part: PartRuntime::new(),
            patch: Patch::default(),
            table: TimeTable::new(sample_rate),
            freed: 0,
        })
    }

    /// Build from a part's configuration at the given hardware rate.
    pub fn from_config(config: &PartConfig, sample_rate: u32) -> Result<Self> {
        let rate = config.sample_rate_mode.effective_rate(sample_rate);
        Self::new(config.polyphony, config.keymode, rate)
    }

    pub fn polyphony(&self) -> usize {
        self.voices.len()
    }

    pub fn keymode(&self) -> KeyMode {
        self.keymode
    }

    pub fn voices(&self) -> &[Voice] {
        &self.voices
    }

    pub fn part(&self) -> &PartRuntime {
        &self.part
    }

    pub fn patch(&self) -> &Patch {
        &self.patch
    }

    pub fn patch_mut(&mut self) -> &mut Patch {
        &mut self.patch
    }

    pub fn table(&self) -> &TimeTable {
        &self.table
    }

    /// Split borrows for a renderer call.
    pub fn render_state(&mut self) -> (&mut [Voice], &PartRuntime, &Patch) {
        (&mut self.voices[..], &self.part, &self.patch)
    }

    /// Total voices freed since construction.
    pub fn freed_count(&self) -> u64 {
        self.freed
    }

    pub fn allocated_voices(&self) -> usize {
        self.voices.iter().filter(|voice| voice.allocated).count()
    }

    /// Voice currently sounding `note` with its key down, if any.
    pub fn voice_for_note(&self, note: u8) -> Option<usize> {
        self.voices
            .iter()
            .position(|voice| voice.allocated && voice.active && voice.note == note)
    }

    /// Re-derive envelope and glide durations after a rate change.
    pub fn set_sample_rate(&mut self, sample_rate: f64) {
        self.table.rebuild(sample_rate);
    }

    /// Apply one drained event. Internal timing events are left to the caller.
    pub fn handle_event(&mut self, kind: &EventKind) {
        match *kind {
            EventKind::NoteOn { note, velocity } => {
                self.note_on(note, velocity);
            }
            EventKind::NoteOff { note, .. } => self.note_off(note),
            EventKind::PolyPressure { note, pressure } => {
                self.part.key_pressure[(note & 0x7F) as usize] = pressure;
            }
            EventKind::ChannelPressure { pressure } => self.part.channel_pressure = pressure,
            EventKind::Controller { controller, value } => self.controller(controller, value),
            EventKind::ProgramChange { program } => self.part.program = program,
            EventKind::PitchBend { value } => self.part.pitch_bend = value,
            EventKind::BpmChange { bpm } => self.part.bpm = bpm,
            EventKind::Start | EventKind::Continue => self.part.running = true,
            EventKind::Stop => {
                self.part.running = false;
                self.all_notes_off();
            }
            EventKind::Reset => self.reset(),
            EventKind::Resync | EventKind::PhaseCorrection { .. } => {}
        }
    }

    pub fn controller(&mut self, controller: u8, value: u8) {
        self.part.controllers[(controller & 0x7F) as usize] = value;
        match controller {
            cc::HOLD_PEDAL => self.set_hold(value >= 64),
            cc::PORTAMENTO_TIME => self.patch.portamento = value,
            cc::ALL_SOUND_OFF => self.all_sound_off(),
            cc::RESET_CONTROLLERS => {
                self.set_hold(false);
                self.part.reset_controllers();
            }
            cc::ALL_NOTES_OFF => self.all_notes_off(),
            _ => {}
        }
    }

    /// Note-on. Velocity 0 is a note-off and yields `None`.
    pub fn note_on(&mut self, note: u8, velocity: u8) -> Option<NoteOnResult> {
        let note = note & 0x7F;
        if velocity == 0 {
            self.note_off(note);
            return None;
        }
        let result = match self.keymode {
            KeyMode::Poly => self.poly_note_on(note, velocity),
            KeyMode::MonoSmooth => self.smooth_note_on(note, velocity),
            KeyMode::MonoRetrigger => self.retrigger_note_on(note, velocity),
            KeyMode::MonoMultikey => self.multikey_note_on(note, velocity),
        };
        Some(result)
    }

    pub fn note_off(&mut self, note: u8) {
        let note = note & 0x7F;
        match self.keymode {
            KeyMode::Poly => self.poly_note_off(note),
            KeyMode::MonoSmooth => self.smooth_note_off(note),
            KeyMode::MonoRetrigger => self.retrigger_note_off(note),
            KeyMode::MonoMultikey => self.multikey_note_off(note),
        }
    }

    /// Start `note` on voice `index`, reporting whether something was stolen.
    fn start_on(&mut self, index: usize, note: u8, velocity: u8, from: Option<u8>) -> NoteOnResult {
        let glide = self.patch.glide_samples(&self.table);
        let voice = &mut self.voices[index];
        let result = if voice.allocated {
            NoteOnResult::Stolen {
                voice: index,
                previous_note: voice.note,
            }
        } else {
            NoteOnResult::Allocated { voice: index }
        };
        voice.start(note, velocity, from, glide, &self.patch, &self.table);
        result
    }

    /// Step the voice cycle and return the new position. The cycle starts
    /// at 0, so the first rotated note of a part lands on voice 1.
    fn rotate(&mut self) -> usize {
        self.part.vcycle = (self.part.vcycle + 1) % self.voices.len();
        self.part.vcycle
    }

    /// Voice with the strictly greatest age; the first found wins ties.
    fn oldest_voice(&self) -> usize {
        let mut oldest = 0;
        let mut max_age = self.voices[0].age;
        for (index, voice) in self.voices.iter().enumerate().skip(1) {
            if voice.age > max_age {
                oldest = index;
                max_age = voice.age;
            }
        }
        oldest
    }

    fn poly_note_on(&mut self, note: u8, velocity: u8) -> NoteOnResult {
        let from = self.part.last_key;
        self.part.press(note);
        let index = self
            .voices
            .iter()
            .position(|voice| !voice.allocated)
            .unwrap_or_else(|| self.oldest_voice());
        self.start_on(index, note, velocity, from)
    }

    fn poly_note_off(&mut self, note: u8) {
        self.part.release(note);
        let hold = self.part.hold;
        for voice in self.voices.iter_mut() {
            if voice.allocated && voice.active && voice.note == note {
                voice.release(hold, &self.patch, &self.table);
            }
        }
    }

    fn smooth_note_on(&mut self, note: u8, velocity: u8) -> NoteOnResult {
        let legato = !self.part.keys.is_empty();
        let from = self.part.last_key;
        self.part.press(note);

        let index = self.part.vcycle;
        let allocated = self.voices[index].allocated;
        let fading = self.voices[index].interval() == EnvelopeInterval::Fade;
        if allocated && !fading {
            let glide = self.patch.glide_samples(&self.table);
            let voice = &mut self.voices[index];
            if voice.is_releasing() {
                voice.amp_env.fast_track(&self.patch.amp, &self.table);
                voice.filter_env.fast_track(&self.patch.filter, &self.table);
            }
            voice.active = true;
            voice.sustained = false;
            voice.note = note;
            voice.velocity = velocity;
            voice.oscillators[0].glide_to(note, glide);
            return NoteOnResult::Legato { voice: index };
        }

        // Nothing left to bend into: let the fading voice go and attack fresh.
        let index = if allocated { self.rotate() } else { index };
        self.start_on(index, note, velocity, if legato { from } else { None })
    }

    fn smooth_note_off(&mut self, note: u8) {
        self.part.release(note);
        let index = self.part.vcycle;
        let voice = &mut self.voices[index];
        if !voice.allocated || !voice.active || voice.note != note {
            return;
        }
        match self.part.keys.tail() {
            Some(fallback) => {
                let glide = self.patch.glide_samples(&self.table);
                voice.note = fallback;
                voice.oscillators[0].glide_to(fallback, glide);
            }
            None => voice.release(self.part.hold, &self.patch, &self.table),
        }
    }

    fn retrigger_note_on(&mut self, note: u8, velocity: u8) -> NoteOnResult {
        let from = self.part.last_key;
        self.part.press(note);
        self.release_all_forced();
        let index = self.rotate();
        let voice = self.start_on(index, note, velocity, from).voice();
        NoteOnResult::Retriggered { voice }
    }

    fn retrigger_note_off(&mut self, note: u8) {
        self.part.release(note);
        let index = self.part.vcycle;
        let voice = &mut self.voices[index];
        if !voice.allocated || !voice.active || voice.note != note {
            return;
        }
        match self.part.keys.tail() {
            Some(fallback) => {
                let velocity = voice.velocity;
                self.release_all_forced();
                let index = self.rotate();
                self.start_on(index, fallback, velocity, Some(note));
            }
            None => voice.release(self.part.hold, &self.patch, &self.table),
        }
    }

    fn multikey_note_on(&mut self, note: u8, velocity: u8) -> NoteOnResult {
        let from = self.part.last_key;
        self.part.press(note);

        let index = self.part.vcycle;
        let voice = &mut self.voices[index];
        let result = if !voice.allocated || voice.interval() == EnvelopeInterval::Fade {
            self.start_on(index, note, velocity, from)
        } else {
            if voice.is_releasing() {
                voice.amp_env.fast_track(&self.patch.amp, &self.table);
                voice.filter_env.fast_track(&self.patch.filter, &self.table);
            }
            voice.active = true;
            voice.sustained = false;
            voice.note = note;
            voice.velocity = velocity;
            NoteOnResult::Legato { voice: index }
        };
        self.assign_oscillators(index);
        result
    }

    fn multikey_note_off(&mut self, note: u8) {
        self.part.release(note);
        let index = self.part.vcycle;
        let voice = &mut self.voices[index];
        if !voice.allocated || !voice.active {
            return;
        }
        match self.part.keys.tail() {
            Some(fallback) => {
                voice.note = fallback;
                self.assign_oscillators(index);
            }
            None => voice.release(self.part.hold, &self.patch, &self.table),
        }
    }

    /// Spread the most recent held keys over the voice's oscillators, each
    /// gliding from where it was to its new key.
    fn assign_oscillators(&mut self, index: usize) {
        let held = self.part.keys.len();
        if held == 0 {
            return;
        }
        let glide = self.patch.glide_samples(&self.table);
        let voice = &mut self.voices[index];
        let previous = voice.osc_count;
        let base_pitch = voice.oscillators[0].pitch;
        let skip = held.saturating_sub(MAX_OSCILLATORS);

        for (slot, key) in self.part.keys.iter().skip(skip).enumerate() {
            let osc = &mut voice.oscillators[slot];
            if slot >= previous {
                osc.pitch = base_pitch;
                osc.phase = 0.0;
                osc.glide_to(key, glide);
            } else if osc.note != key {
                osc.glide_to(key, glide);
            }
        }
        voice.osc_count = held.min(MAX_OSCILLATORS);
    }

    /// Release every key-down voice, ignoring the hold pedal.
    fn release_all_forced(&mut self) {
        for voice in self.voices.iter_mut() {
            voice.release(false, &self.patch, &self.table);
        }
    }

    /// Hold pedal. Lifting it releases every voice it was holding whose key
    /// is no longer down.
    pub fn set_hold(&mut self, on: bool) {
        self.part.hold = on;
        if on {
            return;
        }
        for voice in self.voices.iter_mut() {
            if voice.allocated && voice.sustained && !self.part.keys.contains(voice.note) {
                voice.release(false, &self.patch, &self.table);
            }
        }
    }

    /// Release every voice (the hold pedal still applies) and forget held keys.
    pub fn all_notes_off(&mut self) {
        self.part.keys.clear();
        self.part.high_key = None;
        self.part.low_key = None;
        let hold = self.part.hold;
        for voice in self.voices.iter_mut() {
            voice.release(hold, &self.patch, &self.table);
        }
    }

    /// Silence and free every voice immediately.
    pub fn all_sound_off(&mut self) {
        self.part.keys.clear();
        self.part.high_key = None;
        self.part.low_key = None;
        for voice in self.voices.iter_mut() {
            if voice.allocated {
                voice.free();
                self.freed += 1;
            }
        }
    }

    /// Free every voice and return the part to its power-on state.
    pub fn reset(&mut self) {
        self.all_sound_off();
        self.part = PartRuntime::new();
    }

    /// Advance every voice one sample. Returns the number freed this sample.
    #[inline]
    pub fn tick(&mut self) -> usize {
        let mut freed = 0;
        for voice in self.voices.iter_mut() {
            if voice.tick() {
                freed += 1;
            }
        }
        self.freed += freed as u64;
        freed
    }
}
