//! Event producer side: parse, timestamp and route incoming events.
//!
//! Runs on the event-input thread (and on whoever injects internal events).
//! Every dispatch first applies any announced periods to the event cursor,
//! then converts the arrival time into a frame offset through the PLL and
//! enqueues at `event_index + offset` for each part listening.

use crate::buffer::{ClockedBuffer, Cursor};
use crate::config::PartConfig;
use crate::event::{EventKind, SynthEvent};
use crate::pll::MidiClockPll;
use crate::queue::EventQueue;
use midly::live::{LiveEvent, SystemRealtime};
use midly::MidiMessage;
use std::sync::Arc;

/// Convert a parsed live MIDI message into a synth event.
///
/// Note-on with velocity 0 becomes note-off. Timing clock, active sensing and
/// system common messages have no synth meaning and yield `None`.
pub fn event_from_live(event: &LiveEvent<'_>) -> Option<SynthEvent> {
    match *event {
        LiveEvent::Midi { channel, message } => {
            let kind = match message {
                MidiMessage::NoteOn { key, vel } if vel.as_int() == 0 => EventKind::NoteOff {
                    note: key.as_int(),
                    velocity: 0,
                },
                MidiMessage::NoteOn { key, vel } => EventKind::NoteOn {
                    note: key.as_int(),
                    velocity: vel.as_int(),
                },
                MidiMessage::NoteOff { key, vel } => EventKind::NoteOff {
                    note: key.as_int(),
                    velocity: vel.as_int(),
                },
                MidiMessage::Aftertouch { key, vel } => EventKind::PolyPressure {
                    note: key.as_int(),
                    pressure: vel.as_int(),
                },
                MidiMessage::ChannelAftertouch { vel } => EventKind::ChannelPressure {
                    pressure: vel.as_int(),
                },
                MidiMessage::Controller { controller, value } => EventKind::Controller {
                    controller: controller.as_int(),
                    value: value.as_int(),
                },
                MidiMessage::ProgramChange { program } => EventKind::ProgramChange {
                    program: program.as_int(),
                },
                MidiMessage::PitchBend { bend } => EventKind::PitchBend {
                    value: bend.as_int(),
                },
            };
            Some(SynthEvent::new(channel.as_int(), kind))
        }
        LiveEvent::Realtime(realtime) => {
            let kind = match realtime {
                SystemRealtime::Start => EventKind::Start,
                SystemRealtime::Stop => EventKind::Stop,
                SystemRealtime::Continue => EventKind::Continue,
                SystemRealtime::Reset => EventKind::Reset,
                _ => return None,
            };
            Some(SynthEvent::new(0, kind))
        }
        LiveEvent::Common(_) => None,
    }
}

/// Routes events from the input side into the per-part queues.
#[derive(Debug)]
pub struct EventDispatcher {
    buffer: Arc<ClockedBuffer>,
    pll: Arc<MidiClockPll>,
    queue: Arc<EventQueue>,
    /// MIDI channel per part; `None` listens on all channels.
    routes: Vec<Option<u8>>,
}

impl EventDispatcher {
    pub fn new(
        buffer: Arc<ClockedBuffer>,
        pll: Arc<MidiClockPll>,
        queue: Arc<EventQueue>,
        parts: &[PartConfig],
    ) -> Self {
        Self {
            buffer,
            pll,
            queue,
            routes: parts.iter().map(|part| part.midi_channel).collect(),
        }
    }

    pub fn part_count(&self) -> usize {
        self.routes.len()
    }

    /// Whether `part` receives channel messages on `channel`.
    pub fn listens(&self, part: usize, channel: u8) -> bool {
        match self.routes.get(part) {
            Some(Some(route)) => *route == channel,
            Some(None) => true,
            None => false,
        }
    }

    /// Parse raw MIDI bytes and dispatch them as arriving now.
    ///
    /// Unparseable or meaningless messages are ignored. Returns the number of
    /// part queues that accepted the event.
    pub fn dispatch_raw(&self, bytes: &[u8]) -> usize {
        match LiveEvent::parse(bytes) {
            Ok(live) => event_from_live(&live).map_or(0, |event| self.dispatch(event)),
            Err(_) => 0,
        }
    }

    /// Dispatch an event as arriving now.
    pub fn dispatch(&self, event: SynthEvent) -> usize {
        self.dispatch_at(event, self.pll.now_ns())
    }

    /// Dispatch an event that arrived at `now` (ns on the PLL's clock).
    pub fn dispatch_at(&self, event: SynthEvent, now: i64) -> usize {
        let (base, offset) = self.position(now);
        if event.kind.is_broadcast() {
            return self.queue.broadcast(event, offset, base);
        }
        (0..self.routes.len())
            .filter(|&part| self.listens(part, event.channel))
            .filter(|&part| self.queue.enqueue(part, event, offset, base))
            .count()
    }

    /// Deliver an internal event to one part, bypassing channel routing.
    pub fn send_to_part(&self, part: usize, kind: EventKind) -> bool {
        let (base, offset) = self.position(self.pll.now_ns());
        self.queue
            .enqueue(part, SynthEvent::new(0, kind), offset, base)
    }

    /// Current event-timeline base and frame offset for an arrival at `now`.
    fn position(&self, now: i64) -> (usize, usize) {
        self.pll.advance_event_index(&self.buffer);
        let base = self.buffer.read(Cursor::Event);
        // Before the first period the PLL has no reference to measure against.
        let offset = if self.pll.is_started() {
            self.pll.sample_offset_for(now)
        } else {
            0
        };
        (base, offset)
    }
}
