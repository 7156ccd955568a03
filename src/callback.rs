//! Audio period callback.
//!
//! Runs on the audio driver's thread. Ticks the PLL once per period, applies
//! the ticks to the event cursor, then mixes every part ring at the audio
//! cursor into the hardware buffer and clears what it read.
//!
//! A block spanning several periods ticks the PLL once for each of them,
//! stamped one measured period apart and ending at the wakeup. A block longer
//! than the whole ring mixes one ring's worth and leaves the rest silent.

use crate::engine::EngineShared;
use ostinato_core::Cursor;
use ostinato_io::PeriodCallback;
use std::sync::Arc;

pub(crate) struct AudioCallbackState {
    shared: Arc<EngineShared>,
    /// Frames left in the current period before the next PLL tick.
    pending_frames: i64,
}

impl AudioCallbackState {
    pub(crate) fn new(shared: Arc<EngineShared>) -> Self {
        Self {
            shared,
            pending_frames: 0,
        }
    }

    /// Fill an interleaved stereo buffer. Never blocks, allocates or logs.
    pub(crate) fn process(&mut self, output: &mut [f32]) {
        let shared = &*self.shared;
        let frames = output.len() / 2;
        let geometry = shared.buffer.geometry();

        let mut ticks = 0usize;
        while self.pending_frames <= 0 {
            ticks += 1;
            self.pending_frames += geometry.period_size as i64;
        }
        self.pending_frames -= frames as i64;
        if ticks > 0 {
            let now = shared.pll.now_ns();
            let period_ns = shared.pll.measured_period_ns();
            for behind in (0..ticks).rev() {
                shared.pll.update(now - (behind as f64 * period_ns) as i64);
            }
        }
        shared.pll.advance_event_index(&shared.buffer);

        let start = shared.buffer.read(Cursor::Audio);
        let mixed = frames.min(geometry.total_size);
        let (body, tail) = output.split_at_mut(mixed * 2);
        tail.fill(0.0);

        let mut peak = 0.0f32;
        for (frame, out) in body.chunks_exact_mut(2).enumerate() {
            let index = geometry.add(start, frame);
            let (mut left, mut right) = (0.0f32, 0.0f32);
            for ring in shared.rings.iter() {
                let (l, r) = ring.read(index);
                left += l;
                right += r;
                ring.write(index, 0.0, 0.0);
            }
            out[0] = left;
            out[1] = right;
            peak = peak.max(left.abs()).max(right.abs());
        }

        shared.buffer.advance(Cursor::Audio, frames);
        shared.meter.record(peak, frames);
    }
}

/// Period callback handed to the audio driver on every (re)start.
pub(crate) fn period_callback(shared: Arc<EngineShared>) -> PeriodCallback {
    let mut state = AudioCallbackState::new(shared);
    Box::new(move |output: &mut [f32]| state.process(output))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ostinato_core::{EngineConfig, PhaseRegime};
    use std::thread;
    use std::time::Duration;

    fn shared() -> Arc<EngineShared> {
        Arc::new(EngineShared::new(EngineConfig::default()).unwrap())
    }

    #[test]
    fn test_callback_ticks_once_per_period() {
        let shared = shared();
        let mut state = AudioCallbackState::new(shared.clone());
        let mut output = vec![0.0f32; 512];

        state.process(&mut output);
        assert_eq!(shared.buffer.read(Cursor::Event), 256);
        state.process(&mut output);
        assert_eq!(shared.buffer.read(Cursor::Event), 512);
    }

    #[test]
    fn test_short_callbacks_accumulate_to_one_tick() {
        let shared = shared();
        let mut state = AudioCallbackState::new(shared.clone());
        let mut output = vec![0.0f32; 256];

        state.process(&mut output);
        state.process(&mut output);
        assert_eq!(shared.buffer.read(Cursor::Event), 256);
        state.process(&mut output);
        assert_eq!(shared.buffer.read(Cursor::Event), 512);
    }

    #[test]
    fn test_mixes_and_clears_rings() {
        let shared = shared();
        let audio = shared.buffer.read(Cursor::Audio);
        assert_eq!(audio, 512);
        shared.rings[0].write(audio, 0.5, -0.25);

        let mut state = AudioCallbackState::new(shared.clone());
        let mut output = vec![0.0f32; 512];
        state.process(&mut output);

        assert_eq!(output[0], 0.5);
        assert_eq!(output[1], -0.25);
        assert_eq!(shared.rings[0].read(audio), (0.0, 0.0));
        assert_eq!(shared.buffer.read(Cursor::Audio), 768);
        assert_eq!(shared.meter.frames(), 256);
        assert_eq!(shared.meter.take_peak(), 0.5);
    }

    #[test]
    fn test_multi_period_blocks_stay_out_of_far_early() {
        let shared = shared();
        let mut state = AudioCallbackState::new(shared.clone());
        let geometry = shared.buffer.geometry();
        let mut output = vec![0.0f32; geometry.period_size * 2 * 2];
        let block = Duration::from_secs_f64(shared.pll.nominal_period_ns() * 2.0 / 1e9);

        for _ in 0..20 {
            state.process(&mut output);
            thread::sleep(block);
        }

        assert_eq!(shared.pll.regime_count(PhaseRegime::FarEarly), 0);
        // One tick up front, then two per block.
        let event = shared.buffer.read(Cursor::Event);
        assert_eq!(event, geometry.wrap(39 * geometry.period_size));
    }

    #[test]
    fn test_block_longer_than_ring_reads_it_once() {
        let shared = shared();
        let geometry = shared.buffer.geometry();
        let audio = shared.buffer.read(Cursor::Audio);
        shared.rings[0].write(audio, 0.5, 0.5);

        let mut state = AudioCallbackState::new(shared.clone());
        let frames = geometry.total_size + geometry.period_size;
        let mut output = vec![1.0f32; frames * 2];
        state.process(&mut output);

        assert_eq!(output[0], 0.5);
        assert!(output[2..].iter().all(|&sample| sample == 0.0));
        assert_eq!(shared.meter.frames(), frames as u64);
        assert_eq!(shared.buffer.read(Cursor::Audio), geometry.add(audio, frames));
    }
}
