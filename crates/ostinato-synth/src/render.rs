//! Per-sample voice rendering.
//!
//! The DSP itself lives behind [`VoiceRenderer`]; the synthesis thread calls
//! it once per output sample with the part's voice pool. [`BasicRenderer`] is
//! a plain sine-per-oscillator stand-in so an engine produces sound without
//! an external DSP library.

use crate::part::{cc, PartRuntime};
use crate::patch::Patch;
use crate::voice::Voice;
use std::f32::consts::TAU;

/// Renders one stereo sample from a part's voices.
///
/// Called from the synthesis thread's hot loop: must not block or allocate.
pub trait VoiceRenderer: Send {
    /// Called at start and on every resync with the rate the renderer runs at.
    fn prepare(&mut self, _sample_rate: f64) {}

    fn render_sample(&mut self, voices: &mut [Voice], part: &PartRuntime, patch: &Patch)
        -> (f32, f32);
}

/// Frequency in Hz of a (fractional) MIDI pitch.
#[inline]
pub fn pitch_to_hz(pitch: f32) -> f32 {
    440.0 * ((pitch - 69.0) / 12.0).exp2()
}

#[derive(Debug, Clone)]
pub struct BasicRenderer {
    inverse_rate: f32,
}

impl BasicRenderer {
    pub fn new(sample_rate: f64) -> Self {
        Self {
            inverse_rate: (1.0 / sample_rate) as f32,
        }
    }
}

impl Default for BasicRenderer {
    fn default() -> Self {
        Self::new(48000.0)
    }
}

impl VoiceRenderer for BasicRenderer {
    fn prepare(&mut self, sample_rate: f64) {
        self.inverse_rate = (1.0 / sample_rate) as f32;
    }

    fn render_sample(
        &mut self,
        voices: &mut [Voice],
        part: &PartRuntime,
        patch: &Patch,
    ) -> (f32, f32) {
        let bend = part.bend_semitones(patch.bend_range);
        let channel_volume = part.controllers[cc::VOLUME as usize] as f32 / 127.0;
        let mut mix = 0.0;

        for voice in voices.iter_mut().filter(|voice| voice.allocated) {
            let amplitude = voice.amp_env.value() * patch.velocity_gain(voice.velocity);
            // Filter envelope brightens the tone with a second partial.
            let brightness = voice.filter_env.value() * 0.3;
            let count = voice.osc_count.max(1);
            let mut sample = 0.0;
            for osc in voice.oscillators[..count].iter_mut() {
                let increment = pitch_to_hz(osc.pitch + bend) * self.inverse_rate;
                let angle = osc.phase * TAU;
                sample += angle.sin() + brightness * (2.0 * angle).sin();
                osc.phase = (osc.phase + increment).fract();
            }
            mix += sample * amplitude / count as f32;
        }

        let out = mix * patch.volume * channel_volume;
        (out, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{KeyMode, VoiceAllocator};
    use approx::assert_relative_eq;

    #[test]
    fn test_pitch_to_hz() {
        assert_relative_eq!(pitch_to_hz(69.0), 440.0);
        assert_relative_eq!(pitch_to_hz(81.0), 880.0, max_relative = 1e-6);
    }

    #[test]
    fn test_silent_without_voices() {
        let mut alloc = VoiceAllocator::new(4, KeyMode::Poly, 48000.0).unwrap();
        let mut renderer = BasicRenderer::new(48000.0);
        let (voices, part, patch) = alloc.render_state();
        assert_eq!(renderer.render_sample(voices, part, patch), (0.0, 0.0));
    }

    #[test]
    fn test_note_produces_signal() {
        let mut alloc = VoiceAllocator::new(4, KeyMode::Poly, 48000.0).unwrap();
        let mut renderer = BasicRenderer::new(48000.0);
        alloc.note_on(69, 127);

        let mut peak: f32 = 0.0;
        for _ in 0..4800 {
            let (voices, part, patch) = alloc.render_state();
            let (left, right) = renderer.render_sample(voices, part, patch);
            assert_eq!(left, right);
            peak = peak.max(left.abs());
            alloc.tick();
        }
        assert!(peak > 0.05, "peak {}", peak);
        assert!(peak <= 1.0);
    }
}
