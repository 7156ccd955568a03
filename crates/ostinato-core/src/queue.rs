//! Per-part, per-sample-slot lock-free event storage.
//!
//! Each part owns a fixed arena of cells: one primary cell per ring position,
//! followed by a small overflow ring for bursts landing on an occupied slot.
//! Overflow entries are chained off the primary cell through integer `next`
//! indices into the same arena.
//!
//! Producers (event thread, watchdog, broadcasts) claim cells with CAS and
//! publish them; only the owning synthesis thread drains a part's slots.
//! Neither side blocks or allocates after construction.
//!
//! Cell lifecycle:
//!
//! ```text
//!   Free --CAS--> Claimed --publish--> Ready --drain--> Free
//! ```
//!
//! A drained cell's link is swapped to `LINK_CLOSED` before it is freed, so a
//! producer racing the consumer can never append to a node that is already
//! gone; it restarts from the primary slot instead.
//!
//! Each `next` word carries a tag in its upper half that changes whenever a
//! closed cell is claimed again. A producer walking the chain re-reads the
//! previous hop after loading the next one, and appends with a CAS on the
//! tagged word, so a cell recycled into another chain mid-walk never accepts
//! the link.

use crate::event::SynthEvent;
use crate::stats::TimingStats;
use crate::{Error, Result};
use atomic_float::AtomicF32;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

const FREE: u8 = 0;
const CLAIMED: u8 = 1;
const READY: u8 = 2;

const LINK_NONE: u32 = u32::MAX;
const LINK_CLOSED: u32 = u32::MAX - 1;

/// Spins a drain waits for a claimed-but-unpublished cell.
const CLAIMED_SPIN_LIMIT: usize = 256;

/// Times a producer restarts after meeting a closed chain.
const MAX_RESTARTS: usize = 8;

#[inline]
fn link_of(word: u64) -> u32 {
    word as u32
}

#[inline]
fn tag_of(word: u64) -> u32 {
    (word >> 32) as u32
}

#[inline]
fn tagged(tag: u32, link: u32) -> u64 {
    (tag as u64) << 32 | link as u64
}

#[derive(Debug)]
struct EventCell {
    state: AtomicU8,
    word: AtomicU32,
    payload: AtomicF32,
    frame_offset: AtomicU32,
    next: AtomicU64,
}

impl EventCell {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(FREE),
            word: AtomicU32::new(0),
            payload: AtomicF32::new(0.0),
            frame_offset: AtomicU32::new(0),
            next: AtomicU64::new(tagged(0, LINK_NONE)),
        }
    }

    #[inline]
    fn try_claim(&self) -> bool {
        let claimed = self
            .state
            .compare_exchange(FREE, CLAIMED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if claimed {
            // Only a closed link is reopened. A producer may already have
            // appended to a claimed primary cell, and that link must survive.
            let _ = self
                .next
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                    (link_of(word) == LINK_CLOSED)
                        .then(|| tagged(tag_of(word).wrapping_add(1), LINK_NONE))
                });
        }
        claimed
    }

    #[inline]
    fn publish(&self, word: u32, payload: f32, frame_offset: usize) {
        self.word.store(word, Ordering::Relaxed);
        self.payload.store(payload, Ordering::Relaxed);
        self.frame_offset
            .store(frame_offset as u32, Ordering::Relaxed);
        self.state.store(READY, Ordering::Release);
    }

    #[inline]
    fn release(&self) {
        self.state.store(FREE, Ordering::Release);
    }

    /// Close the link, keeping the tag. Returns the link it replaced.
    #[inline]
    fn close(&self) -> u32 {
        let previous = self
            .next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                Some(tagged(tag_of(word), LINK_CLOSED))
            })
            .unwrap_or_else(|word| word);
        link_of(previous)
    }

    fn reset(&self) {
        self.next.store(tagged(0, LINK_NONE), Ordering::Relaxed);
        self.state.store(FREE, Ordering::Release);
    }
}

#[derive(Debug)]
struct PartSlots {
    cells: Box<[EventCell]>,
    primary: usize,
    overflow: usize,
    overflow_cursor: AtomicUsize,
}

impl PartSlots {
    fn new(primary: usize, overflow: usize) -> Result<Self> {
        let entries = primary + overflow;
        let mut cells = Vec::new();
        cells
            .try_reserve_exact(entries)
            .map_err(|_| Error::PoolAllocation {
                pool: "event slots",
                entries,
            })?;
        cells.extend((0..entries).map(|_| EventCell::new()));
        Ok(Self {
            cells: cells.into_boxed_slice(),
            primary,
            overflow,
            overflow_cursor: AtomicUsize::new(0),
        })
    }

    /// Claim a free overflow entry, scanning at most the whole ring once.
    fn claim_overflow(&self) -> Option<usize> {
        for _ in 0..self.overflow {
            let overflow = self.overflow;
            let position = self
                .overflow_cursor
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cursor| {
                    Some((cursor + 1) % overflow)
                })
                .unwrap_or_else(|cursor| cursor);
            let index = self.primary + position;
            if self.cells[index].try_claim() {
                return Some(index);
            }
        }
        None
    }
}

/// Lock-free event queue for every part of an engine.
#[derive(Debug)]
pub struct EventQueue {
    parts: Box<[PartSlots]>,
    mask: AtomicUsize,
    stats: Arc<TimingStats>,
}

impl EventQueue {
    /// Allocate slot pools for `part_count` parts.
    ///
    /// `primary_capacity` must be the largest ring size the engine can ever be
    /// renegotiated to (a power of two); pools never grow afterwards.
    pub fn new(
        part_count: usize,
        primary_capacity: usize,
        overflow_capacity: usize,
        stats: Arc<TimingStats>,
    ) -> Result<Self> {
        if !primary_capacity.is_power_of_two() {
            return Err(Error::InvalidConfig(format!(
                "event slot capacity {} must be a power of two",
                primary_capacity
            )));
        }
        if primary_capacity + overflow_capacity >= LINK_CLOSED as usize {
            return Err(Error::CapacityExceeded {
                requested: primary_capacity + overflow_capacity,
                capacity: LINK_CLOSED as usize - 1,
            });
        }

        let parts = (0..part_count)
            .map(|_| PartSlots::new(primary_capacity, overflow_capacity))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            parts: parts.into_boxed_slice(),
            mask: AtomicUsize::new(primary_capacity - 1),
            stats,
        })
    }

    pub fn part_count(&self) -> usize {
        self.parts.len()
    }

    pub fn overflow_capacity(&self) -> usize {
        self.parts.first().map_or(0, |slots| slots.overflow)
    }

    /// Install the wrap mask of the current ring and free every cell.
    ///
    /// Only valid while producers and consumers are quiesced.
    pub fn reset(&self, mask: usize) {
        self.mask.store(mask, Ordering::Release);
        for slots in self.parts.iter() {
            for cell in slots.cells.iter() {
                cell.reset();
            }
            slots.overflow_cursor.store(0, Ordering::Release);
        }
    }

    /// Store `event` at ring position `base_index + frame_offset` of `part`.
    ///
    /// Returns `false` if the event was dropped (slot and overflow ring full,
    /// or unknown part); drops are counted, never reported as errors.
    pub fn enqueue(
        &self,
        part: usize,
        event: SynthEvent,
        frame_offset: usize,
        base_index: usize,
    ) -> bool {
        let Some(slots) = self.parts.get(part) else {
            self.stats.dropped_events.increment();
            return false;
        };
        let slot = (base_index + frame_offset) & self.mask.load(Ordering::Acquire);
        let (word, payload) = event.pack();

        'restart: for _ in 0..MAX_RESTARTS {
            let head = &slots.cells[slot];
            if head.try_claim() {
                head.publish(word, payload, frame_offset);
                return true;
            }

            let Some(index) = slots.claim_overflow() else {
                break;
            };
            let cell = &slots.cells[index];
            cell.publish(word, payload, frame_offset);

            // Append at the tail of the chain hanging off the primary slot.
            let mut at = slot;
            let mut current = slots.cells[at].next.load(Ordering::Acquire);
            loop {
                match link_of(current) {
                    LINK_CLOSED => {
                        cell.release();
                        continue 'restart;
                    }
                    LINK_NONE => match slots.cells[at].next.compare_exchange(
                        current,
                        tagged(tag_of(current), index as u32),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => return true,
                        Err(actual) if tag_of(actual) == tag_of(current) => current = actual,
                        Err(_) => {
                            cell.release();
                            continue 'restart;
                        }
                    },
                    next => {
                        let following = slots.cells[next as usize].next.load(Ordering::Acquire);
                        // `at` still linking to `next` means `next` has not
                        // been drained, so `following` belongs to this chain.
                        let recheck = slots.cells[at].next.load(Ordering::Acquire);
                        if recheck != current {
                            if tag_of(recheck) != tag_of(current) {
                                cell.release();
                                continue 'restart;
                            }
                            current = recheck;
                            continue;
                        }
                        at = next as usize;
                        current = following;
                    }
                }
            }
        }

        self.stats.dropped_events.increment();
        false
    }

    /// Enqueue one logical event into every part. Returns how many accepted it.
    pub fn broadcast(&self, event: SynthEvent, frame_offset: usize, base_index: usize) -> usize {
        (0..self.parts.len())
            .filter(|&part| self.enqueue(part, event, frame_offset, base_index))
            .count()
    }

    /// Whether a slot currently holds anything (published or not).
    pub fn is_occupied(&self, part: usize, slot: usize) -> bool {
        self.parts.get(part).is_some_and(|slots| {
            let slot = slot & self.mask.load(Ordering::Acquire);
            slots.cells[slot].state.load(Ordering::Acquire) != FREE
        })
    }

    /// Hand every event at `slot` of `part` to `handler` in insertion order and
    /// free the cells. Returns the number of events handled.
    ///
    /// Must only be called by the thread owning `part`. A primary cell still
    /// being written after a short spin is counted late and left for the next
    /// lap rather than waited on.
    pub fn drain<F>(&self, part: usize, slot: usize, mut handler: F) -> usize
    where
        F: FnMut(SynthEvent, usize),
    {
        let Some(slots) = self.parts.get(part) else {
            return 0;
        };
        let mut at = slot & self.mask.load(Ordering::Acquire);
        let mut handled = 0;

        loop {
            let cell = &slots.cells[at];
            let mut state = cell.state.load(Ordering::Acquire);
            let mut spins = 0;
            while state == CLAIMED && spins < CLAIMED_SPIN_LIMIT {
                std::hint::spin_loop();
                spins += 1;
                state = cell.state.load(Ordering::Acquire);
            }
            match state {
                READY => {}
                CLAIMED => {
                    self.stats.late_events.increment();
                    break;
                }
                _ => break,
            }

            let word = cell.word.load(Ordering::Relaxed);
            let payload = cell.payload.load(Ordering::Relaxed);
            let frame_offset = cell.frame_offset.load(Ordering::Relaxed) as usize;
            if let Some(event) = SynthEvent::unpack(word, payload) {
                handler(event, frame_offset);
                handled += 1;
            }

            let next = cell.close();
            cell.release();
            if next == LINK_NONE || next == LINK_CLOSED {
                break;
            }
            at = next as usize;
        }
        handled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;

    fn queue(parts: usize, overflow: usize) -> (EventQueue, Arc<TimingStats>) {
        let stats = Arc::new(TimingStats::new());
        let queue = EventQueue::new(parts, 1024, overflow, stats.clone()).unwrap();
        (queue, stats)
    }

    fn collect(queue: &EventQueue, part: usize, slot: usize) -> Vec<u8> {
        let mut notes = Vec::new();
        queue.drain(part, slot, |event, _| {
            if let EventKind::NoteOn { note, .. } = event.kind {
                notes.push(note);
            }
        });
        notes
    }

    #[test]
    fn test_single_event_round_trip() {
        let (queue, _) = queue(1, 4);
        assert!(queue.enqueue(0, SynthEvent::note_on(0, 60, 100), 5, 256));
        assert!(queue.is_occupied(0, 261));

        let mut seen = Vec::new();
        let handled = queue.drain(0, 261, |event, offset| seen.push((event, offset)));
        assert_eq!(handled, 1);
        assert_eq!(seen, vec![(SynthEvent::note_on(0, 60, 100), 5)]);
        assert!(!queue.is_occupied(0, 261));
    }

    #[test]
    fn test_slot_wraps_by_mask() {
        let (queue, _) = queue(1, 4);
        assert!(queue.enqueue(0, SynthEvent::note_on(0, 1, 1), 10, 1020));
        assert_eq!(collect(&queue, 0, 6), vec![1]);
    }

    #[test]
    fn test_overflow_keeps_insertion_order() {
        let (queue, stats) = queue(1, 3);
        for note in 0..4 {
            assert!(queue.enqueue(0, SynthEvent::note_on(0, note, 1), 0, 0));
        }
        assert_eq!(collect(&queue, 0, 0), vec![0, 1, 2, 3]);
        assert_eq!(stats.dropped_events.get(), 0);
    }

    #[test]
    fn test_exhaustion_drops_and_counts() {
        let (queue, stats) = queue(1, 2);
        for note in 0..3 {
            assert!(queue.enqueue(0, SynthEvent::note_on(0, note, 1), 0, 0));
        }
        assert!(!queue.enqueue(0, SynthEvent::note_on(0, 99, 1), 0, 0));
        assert_eq!(stats.dropped_events.get(), 1);

        // The chain survives the drop intact and is reusable afterwards.
        assert_eq!(collect(&queue, 0, 0), vec![0, 1, 2]);
        assert!(queue.enqueue(0, SynthEvent::note_on(0, 7, 1), 0, 0));
        assert!(queue.enqueue(0, SynthEvent::note_on(0, 8, 1), 0, 0));
        assert_eq!(collect(&queue, 0, 0), vec![7, 8]);
    }

    #[test]
    fn test_overflow_shared_between_slots() {
        let (queue, stats) = queue(1, 2);
        queue.enqueue(0, SynthEvent::note_on(0, 1, 1), 0, 0);
        queue.enqueue(0, SynthEvent::note_on(0, 2, 1), 0, 0);
        queue.enqueue(0, SynthEvent::note_on(0, 3, 1), 1, 0);
        queue.enqueue(0, SynthEvent::note_on(0, 4, 1), 1, 0);
        // Slot 2's primary is free, but its first collision finds no overflow.
        assert!(queue.enqueue(0, SynthEvent::note_on(0, 5, 1), 2, 0));
        assert!(!queue.enqueue(0, SynthEvent::note_on(0, 6, 1), 2, 0));
        assert_eq!(stats.dropped_events.get(), 1);

        assert_eq!(collect(&queue, 0, 0), vec![1, 2]);
        assert_eq!(collect(&queue, 0, 1), vec![3, 4]);
        assert_eq!(collect(&queue, 0, 2), vec![5]);
    }

    #[test]
    fn test_broadcast_reaches_every_part() {
        let (queue, _) = queue(3, 2);
        let event = SynthEvent::new(0, EventKind::Reset);
        assert_eq!(queue.broadcast(event, 3, 0), 3);
        for part in 0..3 {
            let mut kinds = Vec::new();
            queue.drain(part, 3, |event, _| kinds.push(event.kind));
            assert_eq!(kinds, vec![EventKind::Reset]);
        }
    }

    #[test]
    fn test_unknown_part_is_dropped() {
        let (queue, stats) = queue(1, 2);
        assert!(!queue.enqueue(5, SynthEvent::note_on(0, 60, 1), 0, 0));
        assert_eq!(stats.dropped_events.get(), 1);
        assert_eq!(queue.drain(5, 0, |_, _| {}), 0);
    }

    #[test]
    fn test_claimed_slot_counted_late() {
        let (queue, stats) = queue(1, 2);
        assert!(queue.parts[0].cells[4].try_claim());
        assert_eq!(queue.drain(0, 4, |_, _| {}), 0);
        assert_eq!(stats.late_events.get(), 1);

        queue.parts[0].cells[4].publish(SynthEvent::note_on(0, 61, 1).pack().0, 0.0, 4);
        assert_eq!(collect(&queue, 0, 4), vec![61]);
    }

    #[test]
    fn test_closed_chain_restarts_at_primary() {
        let (queue, _) = queue(1, 2);
        queue.enqueue(0, SynthEvent::note_on(0, 1, 1), 0, 0);
        collect(&queue, 0, 0);
        // Drained primary is free again but still carries the closed link.
        assert!(queue.enqueue(0, SynthEvent::note_on(0, 2, 1), 0, 0));
        assert!(queue.enqueue(0, SynthEvent::note_on(0, 3, 1), 0, 0));
        assert_eq!(collect(&queue, 0, 0), vec![2, 3]);
    }

    #[test]
    fn test_claim_keeps_a_link_appended_to_a_fresh_primary() {
        let (queue, _) = queue(1, 2);
        let slots = &queue.parts[0];
        // A producer links overflow cell 1024 to slot 7 before the claimant
        // of slot 7 gets to touch the link word.
        assert!(slots.cells[1024].try_claim());
        slots.cells[1024].publish(SynthEvent::note_on(0, 2, 1).pack().0, 0.0, 0);
        slots.cells[7].next.store(tagged(0, 1024), Ordering::Release);

        assert!(slots.cells[7].try_claim());
        slots.cells[7].publish(SynthEvent::note_on(0, 1, 1).pack().0, 0.0, 0);
        assert_eq!(collect(&queue, 0, 7), vec![1, 2]);
    }

    #[test]
    fn test_reclaimed_cell_changes_tag() {
        let (queue, _) = queue(1, 2);
        queue.enqueue(0, SynthEvent::note_on(0, 1, 1), 0, 0);
        let before = queue.parts[0].cells[0].next.load(Ordering::Acquire);
        collect(&queue, 0, 0);
        assert_eq!(
            link_of(queue.parts[0].cells[0].next.load(Ordering::Acquire)),
            LINK_CLOSED
        );

        queue.enqueue(0, SynthEvent::note_on(0, 2, 1), 0, 0);
        let after = queue.parts[0].cells[0].next.load(Ordering::Acquire);
        assert_eq!(link_of(after), LINK_NONE);
        assert_ne!(tag_of(after), tag_of(before));

        // A link attempt holding the pre-drain word no longer lands.
        let stale = queue.parts[0].cells[0].next.compare_exchange(
            before,
            tagged(tag_of(before), 1025),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        assert!(stale.is_err());
        assert_eq!(collect(&queue, 0, 0), vec![2]);
    }

    #[test]
    fn test_reset_frees_everything() {
        let (queue, _) = queue(1, 2);
        queue.enqueue(0, SynthEvent::note_on(0, 1, 1), 0, 0);
        queue.enqueue(0, SynthEvent::note_on(0, 2, 1), 0, 0);
        queue.reset(511);
        assert!(!queue.is_occupied(0, 0));
        assert_eq!(queue.drain(0, 0, |_, _| {}), 0);
    }
}
