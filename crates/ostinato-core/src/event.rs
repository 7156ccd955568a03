//! Event types carried through the per-part queues.
//!
//! The public form is the tagged [`EventKind`]; queue slots store it packed
//! into one `u32` word plus an `f32` payload so a slot can be published with
//! plain atomic stores.

/// Kind and data of a queued event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EventKind {
    NoteOn { note: u8, velocity: u8 },
    NoteOff { note: u8, velocity: u8 },
    PolyPressure { note: u8, pressure: u8 },
    ChannelPressure { pressure: u8 },
    Controller { controller: u8, value: u8 },
    ProgramChange { program: u8 },
    /// Signed bend, -8192..=8191.
    PitchBend { value: i16 },
    /// Internal: re-read geometry and realign the engine cursor.
    Resync,
    /// Internal: shift the part's render position by a fractional frame count.
    PhaseCorrection { frames: f32 },
    /// Internal: tempo change for tempo-synced modulation.
    BpmChange { bpm: f32 },
    Start,
    Stop,
    Continue,
    Reset,
}

mod tag {
    pub const NOTE_ON: u8 = 1;
    pub const NOTE_OFF: u8 = 2;
    pub const POLY_PRESSURE: u8 = 3;
    pub const CHANNEL_PRESSURE: u8 = 4;
    pub const CONTROLLER: u8 = 5;
    pub const PROGRAM_CHANGE: u8 = 6;
    pub const PITCH_BEND: u8 = 7;
    pub const RESYNC: u8 = 8;
    pub const PHASE_CORRECTION: u8 = 9;
    pub const BPM_CHANGE: u8 = 10;
    pub const START: u8 = 11;
    pub const STOP: u8 = 12;
    pub const CONTINUE: u8 = 13;
    pub const RESET: u8 = 14;
}

impl EventKind {
    /// System and internal events go to every part regardless of channel.
    pub fn is_broadcast(&self) -> bool {
        matches!(
            self,
            EventKind::Start
                | EventKind::Stop
                | EventKind::Continue
                | EventKind::Reset
                | EventKind::BpmChange { .. }
        )
    }

    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            EventKind::Resync | EventKind::PhaseCorrection { .. } | EventKind::BpmChange { .. }
        )
    }
}

/// An event addressed to a MIDI channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SynthEvent {
    pub channel: u8,
    pub kind: EventKind,
}

impl SynthEvent {
    pub fn new(channel: u8, kind: EventKind) -> Self {
        Self {
            channel: channel & 0x0F,
            kind,
        }
    }

    pub fn note_on(channel: u8, note: u8, velocity: u8) -> Self {
        Self::new(channel, EventKind::NoteOn { note, velocity })
    }

    pub fn note_off(channel: u8, note: u8) -> Self {
        Self::new(channel, EventKind::NoteOff { note, velocity: 0 })
    }

    pub fn controller(channel: u8, controller: u8, value: u8) -> Self {
        Self::new(channel, EventKind::Controller { controller, value })
    }

    /// Pack into `(word, payload)`: `tag | channel << 8 | data1 << 16 | data2 << 24`.
    pub fn pack(&self) -> (u32, f32) {
        let (tag, data1, data2, payload) = match self.kind {
            EventKind::NoteOn { note, velocity } => (tag::NOTE_ON, note, velocity, 0.0),
            EventKind::NoteOff { note, velocity } => (tag::NOTE_OFF, note, velocity, 0.0),
            EventKind::PolyPressure { note, pressure } => (tag::POLY_PRESSURE, note, pressure, 0.0),
            EventKind::ChannelPressure { pressure } => (tag::CHANNEL_PRESSURE, pressure, 0, 0.0),
            EventKind::Controller { controller, value } => (tag::CONTROLLER, controller, value, 0.0),
            EventKind::ProgramChange { program } => (tag::PROGRAM_CHANGE, program, 0, 0.0),
            EventKind::PitchBend { value } => {
                let raw = (value.clamp(-8192, 8191) + 8192) as u16;
                (tag::PITCH_BEND, (raw & 0x7F) as u8, (raw >> 7) as u8, 0.0)
            }
            EventKind::Resync => (tag::RESYNC, 0, 0, 0.0),
            EventKind::PhaseCorrection { frames } => (tag::PHASE_CORRECTION, 0, 0, frames),
            EventKind::BpmChange { bpm } => (tag::BPM_CHANGE, 0, 0, bpm),
            EventKind::Start => (tag::START, 0, 0, 0.0),
            EventKind::Stop => (tag::STOP, 0, 0, 0.0),
            EventKind::Continue => (tag::CONTINUE, 0, 0, 0.0),
            EventKind::Reset => (tag::RESET, 0, 0, 0.0),
        };
        let word = tag as u32
            | (self.channel as u32) << 8
            | (data1 as u32) << 16
            | (data2 as u32) << 24;
        (word, payload)
    }

    /// Inverse of [`pack`](Self::pack). Unknown tags yield `None`.
    pub fn unpack(word: u32, payload: f32) -> Option<Self> {
        let tag = (word & 0xFF) as u8;
        let channel = ((word >> 8) & 0x0F) as u8;
        let data1 = ((word >> 16) & 0xFF) as u8;
        let data2 = ((word >> 24) & 0xFF) as u8;

        let kind = match tag {
            tag::NOTE_ON => EventKind::NoteOn {
                note: data1,
                velocity: data2,
            },
            tag::NOTE_OFF => EventKind::NoteOff {
                note: data1,
                velocity: data2,
            },
            tag::POLY_PRESSURE => EventKind::PolyPressure {
                note: data1,
                pressure: data2,
            },
            tag::CHANNEL_PRESSURE => EventKind::ChannelPressure { pressure: data1 },
            tag::CONTROLLER => EventKind::Controller {
                controller: data1,
                value: data2,
            },
            tag::PROGRAM_CHANGE => EventKind::ProgramChange { program: data1 },
            tag::PITCH_BEND => {
                let raw = (data1 as i16 & 0x7F) | ((data2 as i16 & 0x7F) << 7);
                EventKind::PitchBend { value: raw - 8192 }
            }
            tag::RESYNC => EventKind::Resync,
            tag::PHASE_CORRECTION => EventKind::PhaseCorrection { frames: payload },
            tag::BPM_CHANGE => EventKind::BpmChange { bpm: payload },
            tag::START => EventKind::Start,
            tag::STOP => EventKind::Stop,
            tag::CONTINUE => EventKind::Continue,
            tag::RESET => EventKind::Reset,
            _ => return None,
        };
        Some(Self { channel, kind })
    }
}
