//! Integration tests for voice allocation.
//!
//! Drives the allocator the way a synthesis thread does: events applied at
//! sample positions, one `tick` per rendered sample.

use ostinato_core::{EventKind, SynthEvent};
use ostinato_synth::{
    BasicRenderer, EnvelopeInterval, KeyMode, NoteOnResult, VoiceAllocator, VoiceRenderer,
};
use proptest::prelude::*;

fn run(alloc: &mut VoiceAllocator, renderer: &mut BasicRenderer, samples: usize) {
    for _ in 0..samples {
        let (voices, part, patch) = alloc.render_state();
        renderer.render_sample(voices, part, patch);
        alloc.tick();
    }
}

// ---------------------------------------------------------------------------
// 1. Poly scenario: four notes fill the pool, the fifth steals the oldest
// ---------------------------------------------------------------------------

#[test]
fn test_fifth_note_steals_voice_zero() {
    let mut alloc = VoiceAllocator::new(4, KeyMode::Poly, 48000.0).unwrap();
    let mut renderer = BasicRenderer::new(48000.0);

    let mut results = Vec::new();
    for note in [60, 64, 67, 72, 76] {
        let event = SynthEvent::note_on(0, note, 100);
        if let EventKind::NoteOn { note, velocity } = event.kind {
            results.push(alloc.note_on(note, velocity).unwrap());
        }
        run(&mut alloc, &mut renderer, 256);
    }

    assert_eq!(
        &results[..4],
        &[
            NoteOnResult::Allocated { voice: 0 },
            NoteOnResult::Allocated { voice: 1 },
            NoteOnResult::Allocated { voice: 2 },
            NoteOnResult::Allocated { voice: 3 },
        ]
    );
    assert_eq!(
        results[4],
        NoteOnResult::Stolen {
            voice: 0,
            previous_note: 60
        }
    );
    let notes: Vec<u8> = alloc.voices().iter().map(|voice| voice.note).collect();
    assert_eq!(notes, vec![76, 64, 67, 72]);
}

/// Events landing on the same sample slot all see age 0: voice 0 still wins.
#[test]
fn test_same_slot_burst_steals_lowest_id() {
    let mut alloc = VoiceAllocator::new(4, KeyMode::Poly, 48000.0).unwrap();
    for note in [60, 64, 67, 72] {
        alloc.handle_event(&EventKind::NoteOn { note, velocity: 100 });
    }
    assert_eq!(
        alloc.note_on(76, 100),
        Some(NoteOnResult::Stolen {
            voice: 0,
            previous_note: 60
        })
    );
}

// ---------------------------------------------------------------------------
// 2. Properties
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// The voice stolen is the one with the strictly greatest age, lowest id
    /// among equals.
    #[test]
    fn steal_picks_strictly_oldest(
        polyphony in 1usize..8,
        gaps in prop::collection::vec(0usize..50, 8..24),
    ) {
        let mut alloc = VoiceAllocator::new(polyphony, KeyMode::Poly, 48000.0).unwrap();
        for (i, gap) in gaps.into_iter().enumerate() {
            let full = alloc.allocated_voices() == polyphony;
            let expected = full.then(|| {
                let voices = alloc.voices();
                let max_age = voices.iter().map(|voice| voice.age).max().unwrap();
                voices.iter().position(|voice| voice.age == max_age).unwrap()
            });

            let note = 36 + (i % 48) as u8;
            let result = alloc.note_on(note, 100).unwrap();
            if let Some(expected) = expected {
                prop_assert!(matches!(result, NoteOnResult::Stolen { .. }), "expected Stolen, got {:?}", result);
                prop_assert_eq!(result.voice(), expected);
            } else {
                prop_assert!(matches!(result, NoteOnResult::Allocated { .. }), "expected Allocated, got {:?}", result);
            }
            for _ in 0..gap {
                alloc.tick();
            }
        }
    }

    /// A released voice reaches Done within its release bound and is freed
    /// exactly once.
    #[test]
    fn release_terminates_within_bound(
        release in 0u8..64,
        attack in 0u8..40,
        held in 0usize..3000,
        polyphony in 1usize..4,
    ) {
        let mut alloc = VoiceAllocator::new(polyphony, KeyMode::Poly, 48000.0).unwrap();
        alloc.patch_mut().amp.release = release;
        alloc.patch_mut().amp.attack = attack;
        alloc.patch_mut().filter.release = release;

        alloc.note_on(60, 100);
        for _ in 0..held {
            alloc.tick();
        }
        alloc.note_off(60);
        prop_assert!(alloc.voices()[0].is_releasing());

        let bound = alloc.patch().amp.release_bound(alloc.table()) as usize;
        let mut samples = 0;
        while alloc.voices()[0].allocated {
            prop_assert!(samples <= bound, "not done after {} samples", samples);
            alloc.tick();
            samples += 1;
        }
        prop_assert_eq!(alloc.voices()[0].interval(), EnvelopeInterval::Done);
        prop_assert_eq!(alloc.freed_count(), 1);

        for _ in 0..1000 {
            alloc.tick();
        }
        prop_assert_eq!(alloc.freed_count(), 1);
    }
}

// ---------------------------------------------------------------------------
// 3. Mono keymodes over a phrase
// ---------------------------------------------------------------------------

#[test]
fn test_mono_smooth_phrase_uses_one_voice() {
    let mut alloc = VoiceAllocator::new(4, KeyMode::MonoSmooth, 48000.0).unwrap();
    let mut renderer = BasicRenderer::new(48000.0);
    alloc.controller(5, 20);

    for note in [60, 62, 64, 65, 67] {
        alloc.note_on(note, 90);
        run(&mut alloc, &mut renderer, 128);
    }
    assert_eq!(alloc.allocated_voices(), 1);
    assert_eq!(alloc.voices()[0].note, 67);
    assert_eq!(alloc.part().keys.len(), 5);
}

#[test]
fn test_mono_retrigger_phrase_alternates_voices() {
    let mut alloc = VoiceAllocator::new(2, KeyMode::MonoRetrigger, 48000.0).unwrap();
    let mut renderer = BasicRenderer::new(48000.0);
    let mut voices = Vec::new();
    for note in [60, 62, 64, 65] {
        voices.push(alloc.note_on(note, 90).unwrap().voice());
        alloc.note_off(note);
        run(&mut alloc, &mut renderer, 64);
    }
    assert_eq!(voices, vec![1, 0, 1, 0]);
}

/// The voice cycle advances before each retrigger, so a phrase begins on
/// voice 1, and a part reset starts the cycle over.
#[test]
fn test_mono_retrigger_phrase_starts_on_voice_one_after_reset() {
    let mut alloc = VoiceAllocator::new(3, KeyMode::MonoRetrigger, 48000.0).unwrap();
    assert_eq!(alloc.note_on(60, 90).unwrap().voice(), 1);
    assert_eq!(alloc.note_on(62, 90).unwrap().voice(), 2);

    alloc.reset();
    assert_eq!(alloc.note_on(64, 90).unwrap().voice(), 1);
}
