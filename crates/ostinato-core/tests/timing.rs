//! Integration tests for the PLL and the event queue under realistic load.
//!
//! The PLL is fed synthetic wakeup timelines; the queue is hammered from
//! several producer threads while a single consumer drains.

use ostinato_core::{
    EventKind, EventQueue, MidiClockPll, PhaseRegime, SynthEvent, TimingStats,
};
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// 1. PLL convergence and recovery
// ---------------------------------------------------------------------------

fn pll(period_size: usize) -> MidiClockPll {
    MidiClockPll::new(48000, period_size, Arc::new(TimingStats::new()))
}

/// A hardware clock running 0.1% slow: the period estimate converges onto the
/// true period and the loop settles into the locked regime.
#[test]
fn test_pll_converges_on_skewed_clock() {
    let pll = pll(256);
    let frame = pll.frame_ns();
    let nominal = pll.nominal_period_ns();
    let true_period = nominal * 1.001;
    let start = 1_000_000.0;

    let mut recent = Vec::new();
    for k in 0..4096 {
        let now = start + k as f64 * true_period + pll.phase_lock_target() * frame;
        let regime = pll.update(now as i64);
        if k >= 4096 - 256 {
            recent.push(regime);
        }
    }

    let measured = pll.measured_period_ns();
    let initial_error = (true_period - nominal).abs();
    let final_error = (true_period - measured).abs();
    assert!(final_error / true_period < 0.02);
    assert!(
        final_error < initial_error * 0.5,
        "estimate did not converge: measured={} true={}",
        measured,
        true_period
    );

    let locked = recent.iter().filter(|r| **r == PhaseRegime::Locked).count();
    assert!(
        locked * 100 >= recent.len() * 80,
        "only {} of {} recent periods locked",
        locked,
        recent.len()
    );
    assert!(recent.iter().all(|r| matches!(
        r,
        PhaseRegime::Locked | PhaseRegime::SlightlyLate
    )));
}

/// Scheduling jitter well inside the lock window never disturbs the loop.
#[test]
fn test_pll_rejects_wakeup_jitter() {
    let pll = pll(128);
    let frame = pll.frame_ns();
    let period = pll.nominal_period_ns();
    let target = pll.phase_lock_target() * frame;
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);

    let mut locked = 0;
    for k in 0..2000 {
        let jitter = rng.gen_range(-0.2..0.2) * frame;
        let now = k as f64 * period + target + jitter;
        if pll.update(now as i64) == PhaseRegime::Locked {
            locked += 1;
        }
    }
    assert!(locked >= 1900, "locked {} of 2000", locked);
    approx::assert_relative_eq!(pll.measured_period_ns(), period, max_relative = 1e-3);
}

/// A stalled callback is caught as far-late, and the next on-grid wakeup is
/// locked again.
#[test]
fn test_pll_recovers_from_stalled_callback() {
    let pll = pll(256);
    let frame = pll.frame_ns();
    let period = pll.nominal_period_ns();
    let target = pll.phase_lock_target() * frame;
    let at = |k: usize| (k as f64 * period + target) as i64;

    for k in 0..16 {
        pll.update(at(k));
    }
    // Three periods go by without a wakeup.
    assert_eq!(pll.update(at(19)), PhaseRegime::FarLate);
    assert_eq!(pll.update(at(20)), PhaseRegime::Locked);
    assert_eq!(pll.update(at(21)), PhaseRegime::Locked);
    assert_eq!(pll.regime_count(PhaseRegime::FarLate), 1);
}

/// A wakeup far ahead of the expected boundary re-latches the reference.
#[test]
fn test_pll_latches_far_early() {
    let pll = pll(256);
    let frame = pll.frame_ns();
    let period = pll.nominal_period_ns();
    pll.update(0);
    let early = (period - 10.0 * frame) as i64;
    assert_eq!(pll.update(early), PhaseRegime::FarEarly);
    let offset = pll.sample_offset_for(early);
    assert!(offset <= 1);
}

// ---------------------------------------------------------------------------
// 2. Event queue under concurrent producers
// ---------------------------------------------------------------------------

/// Several producers share a handful of slots; every event is drained exactly
/// once while the consumer races them.
#[test]
fn test_queue_no_loss_with_concurrent_producers() {
    const PRODUCERS: usize = 4;
    const PER_PRODUCER: usize = 2000;
    const SLOTS: usize = 16;

    let stats = Arc::new(TimingStats::new());
    let queue = Arc::new(EventQueue::new(1, 1024, 8192, stats.clone()).unwrap());

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|producer| {
            let queue = queue.clone();
            thread::spawn(move || {
                for sequence in 0..PER_PRODUCER {
                    let event = SynthEvent::new(
                        producer as u8,
                        EventKind::PolyPressure {
                            note: (sequence & 0x7F) as u8,
                            pressure: (sequence >> 7) as u8,
                        },
                    );
                    queue.enqueue(0, event, sequence % SLOTS, 0);
                }
            })
        })
        .collect();

    let mut seen = HashSet::new();
    let deadline = Instant::now() + Duration::from_secs(20);
    let expected = PRODUCERS * PER_PRODUCER - stats.dropped_events.get() as usize;
    while seen.len() < expected && Instant::now() < deadline {
        for slot in 0..SLOTS {
            queue.drain(0, slot, |event, _| {
                if let EventKind::PolyPressure { note, pressure } = event.kind {
                    let sequence = note as usize | (pressure as usize) << 7;
                    assert!(seen.insert((event.channel, sequence)), "duplicate event");
                }
            });
        }
    }
    for producer in producers {
        producer.join().unwrap();
    }
    for slot in 0..SLOTS {
        queue.drain(0, slot, |event, _| {
            if let EventKind::PolyPressure { note, pressure } = event.kind {
                let sequence = note as usize | (pressure as usize) << 7;
                assert!(seen.insert((event.channel, sequence)), "duplicate event");
            }
        });
    }

    assert_eq!(stats.dropped_events.get(), 0);
    assert_eq!(seen.len(), PRODUCERS * PER_PRODUCER);
}

/// Two producers meet on a freshly reset slot: one wins the primary cell, the
/// other links into it while the winner is still claiming. Nothing is lost.
#[test]
fn test_queue_same_slot_race_keeps_both_events() {
    const ROUNDS: usize = 2000;

    let stats = Arc::new(TimingStats::new());
    let queue = Arc::new(EventQueue::new(1, 1024, 4, stats.clone()).unwrap());
    let barrier = Arc::new(Barrier::new(3));
    let accepted = Arc::new(AtomicUsize::new(0));

    let producers: Vec<_> = (0..2u8)
        .map(|producer| {
            let queue = queue.clone();
            let barrier = barrier.clone();
            let accepted = accepted.clone();
            thread::spawn(move || {
                for _ in 0..ROUNDS {
                    barrier.wait();
                    if queue.enqueue(0, SynthEvent::note_on(0, producer, 1), 0, 0) {
                        accepted.fetch_add(1, Ordering::SeqCst);
                    }
                    barrier.wait();
                }
            })
        })
        .collect();

    for round in 0..ROUNDS {
        queue.reset(1023);
        accepted.store(0, Ordering::SeqCst);
        barrier.wait();
        barrier.wait();

        let mut notes = Vec::new();
        queue.drain(0, 0, |event, _| {
            if let EventKind::NoteOn { note, .. } = event.kind {
                notes.push(note);
            }
        });
        notes.sort_unstable();
        assert_eq!(notes.len(), accepted.load(Ordering::SeqCst), "round {}", round);
        assert_eq!(notes, vec![0, 1], "round {}", round);
    }
    for producer in producers {
        producer.join().unwrap();
    }
    assert_eq!(stats.dropped_events.get(), 0);
}

/// Producers keep appending overflow chains while the consumer drains and
/// recycles their cells. Every event comes out at the slot it was queued for,
/// and every accepted event comes out.
#[test]
fn test_queue_chains_stay_with_their_slot_under_recycling() {
    const PRODUCERS: usize = 4;
    const PER_PRODUCER: usize = 20_000;
    const SLOTS: usize = 4;

    let stats = Arc::new(TimingStats::new());
    let queue = Arc::new(EventQueue::new(1, 1024, 16, stats.clone()).unwrap());
    let accepted = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicBool::new(false));

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|producer| {
            let queue = queue.clone();
            let accepted = accepted.clone();
            thread::spawn(move || {
                for sequence in 0..PER_PRODUCER {
                    let slot = sequence % SLOTS;
                    let event = SynthEvent::new(
                        producer as u8,
                        EventKind::PolyPressure {
                            note: slot as u8,
                            pressure: (sequence & 0x7F) as u8,
                        },
                    );
                    if queue.enqueue(0, event, slot, 0) {
                        accepted.fetch_add(1, Ordering::SeqCst);
                    }
                }
            })
        })
        .collect();

    let consumer = {
        let queue = queue.clone();
        let done = done.clone();
        thread::spawn(move || {
            let mut handled = 0;
            let drain_all = |handled: &mut usize| {
                for slot in 0..SLOTS {
                    *handled += queue.drain(0, slot, |event, _| {
                        if let EventKind::PolyPressure { note, .. } = event.kind {
                            assert_eq!(note as usize, slot, "event drained at the wrong slot");
                        }
                    });
                }
            };
            while !done.load(Ordering::SeqCst) {
                drain_all(&mut handled);
            }
            drain_all(&mut handled);
            handled
        })
    };

    for producer in producers {
        producer.join().unwrap();
    }
    done.store(true, Ordering::SeqCst);
    let handled = consumer.join().unwrap();

    assert_eq!(handled, accepted.load(Ordering::SeqCst));
    assert_eq!(
        handled + stats.dropped_events.get() as usize,
        PRODUCERS * PER_PRODUCER
    );
}

/// Exactly `1 + overflow` events fit in one sample slot.
#[test]
fn test_queue_capacity_per_slot() {
    let stats = Arc::new(TimingStats::new());
    let queue = EventQueue::new(2, 512, 5, stats.clone()).unwrap();

    for note in 0..6 {
        assert!(queue.enqueue(1, SynthEvent::note_on(0, note, 64), 3, 100));
    }
    assert!(!queue.enqueue(1, SynthEvent::note_on(0, 6, 64), 3, 100));
    assert_eq!(stats.dropped_events.get(), 1);

    let mut notes = Vec::new();
    queue.drain(1, 103, |event, offset| {
        assert_eq!(offset, 3);
        if let EventKind::NoteOn { note, .. } = event.kind {
            notes.push(note);
        }
    });
    assert_eq!(notes, vec![0, 1, 2, 3, 4, 5]);
    // Part 0 shares nothing with part 1.
    assert_eq!(queue.drain(0, 103, |_, _| {}), 0);
}
