//! Per-part performance state owned by one synthesis thread.

use crate::keylist::HeldKeyList;

/// Controller numbers the allocator acts on.
pub mod cc {
    pub const PORTAMENTO_TIME: u8 = 5;
    pub const VOLUME: u8 = 7;
    pub const HOLD_PEDAL: u8 = 64;
    pub const ALL_SOUND_OFF: u8 = 120;
    pub const RESET_CONTROLLERS: u8 = 121;
    pub const ALL_NOTES_OFF: u8 = 123;
}

pub const DEFAULT_BPM: f32 = 120.0;

#[derive(Debug, Clone)]
pub struct PartRuntime {
    pub keys: HeldKeyList,
    /// Round-robin voice cursor for the mono keymodes.
    pub vcycle: usize,
    pub hold: bool,
    pub last_key: Option<u8>,
    pub high_key: Option<u8>,
    pub low_key: Option<u8>,
    /// Signed bend, -8192..=8191.
    pub pitch_bend: i16,
    pub channel_pressure: u8,
    pub key_pressure: [u8; 128],
    pub controllers: [u8; 128],
    pub program: u8,
    pub bpm: f32,
    /// Cleared by a system Stop, set again by Start/Continue.
    pub running: bool,
}

impl Default for PartRuntime {
    fn default() -> Self {
        let mut controllers = [0; 128];
        controllers[cc::VOLUME as usize] = 100;
        Self {
            keys: HeldKeyList::new(),
            vcycle: 0,
            hold: false,
            last_key: None,
            high_key: None,
            low_key: None,
            pitch_bend: 0,
            channel_pressure: 0,
            key_pressure: [0; 128],
            controllers,
            program: 0,
            bpm: DEFAULT_BPM,
            running: true,
        }
    }
}

impl PartRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a pressed key in the held list and key statistics.
    pub(crate) fn press(&mut self, note: u8) {
        self.keys.press(note);
        self.last_key = Some(note);
        self.high_key = Some(self.high_key.map_or(note, |high| high.max(note)));
        self.low_key = Some(self.low_key.map_or(note, |low| low.min(note)));
    }

    /// Remove a released key and recompute the high/low keys from what is held.
    pub(crate) fn release(&mut self, note: u8) -> bool {
        let was_held = self.keys.release(note);
        self.high_key = self.keys.iter().max();
        self.low_key = self.keys.iter().min();
        was_held
    }

    /// Pitch bend in semitones for a given range.
    pub fn bend_semitones(&self, range: f32) -> f32 {
        self.pitch_bend as f32 / 8192.0 * range
    }

    /// Controllers back to their power-on values; held keys are kept.
    pub fn reset_controllers(&mut self) {
        let keys = std::mem::take(&mut self.keys);
        let vcycle = self.vcycle;
        let last_key = self.last_key;
        let (high_key, low_key) = (self.high_key, self.low_key);
        *self = Self {
            keys,
            vcycle,
            last_key,
            high_key,
            low_key,
            ..Self::default()
        };
    }
}
