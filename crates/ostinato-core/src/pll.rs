//! Software phase-locked loop mapping wall-clock time onto period frames.
//!
//! The true start of a hardware period is never observable, only the time the
//! audio thread wakes up for it. Once per period the PLL compares that wakeup
//! against where it expected the boundary to be, smooths its period estimate
//! and corrects its reference, so any thread can convert "now" into a frame
//! offset within the current period.
//!
//! Correction regimes, measured against `phase_lock_target`:
//!
//! ```text
//!   far-early | slightly-early |  locked  | slightly-late | far-late
//!  ---------- -2 ------------ -0.5 ---- +0.5 ----------- +2 --------- frames
//!   latch       nudge -1/2      none      nudge +1/2       latch + period nudge
//! ```
//!
//! All state lives in atomics: `update` is only ever run by one thread per
//! period, every other thread just reads.

use crate::buffer::{ClockedBuffer, Cursor};
use crate::lockfree::{AtomicCounter, AtomicDouble, AtomicFlag};
use crate::stats::TimingStats;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Weight of each new inter-wakeup interval in the period estimate.
pub const PERIOD_SMOOTHING: f64 = 1.0 / 2048.0;

/// Half-width of the locked window, in frames.
pub const LOCK_WINDOW_FRAMES: f64 = 0.5;

/// Error beyond which the reference is latched to the wakeup, in frames.
pub const LATCH_THRESHOLD_FRAMES: f64 = 2.0;

/// Reference correction applied in the slightly-early/late regimes.
pub const NUDGE_FRAMES: f64 = 0.5;

/// Period-estimate correction applied on a far-late wakeup, in frames.
pub const PERIOD_NUDGE_FRAMES: f64 = 0.125;

/// Default expected wakeup position after the boundary, in frames.
pub const DEFAULT_PHASE_LOCK_TARGET: f64 = 1.0;

/// Where a wakeup landed relative to the expected boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PhaseRegime {
    FarEarly = 0,
    SlightlyEarly = 1,
    Locked = 2,
    SlightlyLate = 3,
    FarLate = 4,
}

impl PhaseRegime {
    /// Classify a phase error given in frames.
    pub fn classify(error_frames: f64) -> Self {
        if error_frames < -LATCH_THRESHOLD_FRAMES {
            PhaseRegime::FarEarly
        } else if error_frames < -LOCK_WINDOW_FRAMES {
            PhaseRegime::SlightlyEarly
        } else if error_frames <= LOCK_WINDOW_FRAMES {
            PhaseRegime::Locked
        } else if error_frames <= LATCH_THRESHOLD_FRAMES {
            PhaseRegime::SlightlyLate
        } else {
            PhaseRegime::FarLate
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => PhaseRegime::FarEarly,
            1 => PhaseRegime::SlightlyEarly,
            3 => PhaseRegime::SlightlyLate,
            4 => PhaseRegime::FarLate,
            _ => PhaseRegime::Locked,
        }
    }
}

/// MIDI clock PLL shared by the audio, event and synthesis threads.
#[derive(Debug)]
pub struct MidiClockPll {
    epoch: Instant,
    started: AtomicFlag,
    period_size: AtomicUsize,
    frame_ns: AtomicDouble,
    nominal_period_ns: AtomicDouble,
    measured_period_ns: AtomicDouble,
    phase_lock_target: AtomicDouble,
    /// Start of the current nominal period, ns since `epoch`.
    reference_ns: AtomicI64,
    last_wakeup_ns: AtomicI64,
    last_regime: AtomicU8,
    regime_counts: [AtomicCounter; 5],
    /// Periods announced by `update`.
    pending_periods: AtomicU64,
    /// Periods already applied to the event cursor.
    consumed_periods: AtomicU64,
    stats: Arc<TimingStats>,
}

impl MidiClockPll {
    pub fn new(sample_rate: u32, period_size: usize, stats: Arc<TimingStats>) -> Self {
        let pll = Self {
            epoch: Instant::now(),
            started: AtomicFlag::new(false),
            period_size: AtomicUsize::new(period_size),
            frame_ns: AtomicDouble::default(),
            nominal_period_ns: AtomicDouble::default(),
            measured_period_ns: AtomicDouble::default(),
            phase_lock_target: AtomicDouble::new(DEFAULT_PHASE_LOCK_TARGET),
            reference_ns: AtomicI64::new(0),
            last_wakeup_ns: AtomicI64::new(0),
            last_regime: AtomicU8::new(PhaseRegime::Locked as u8),
            regime_counts: Default::default(),
            pending_periods: AtomicU64::new(0),
            consumed_periods: AtomicU64::new(0),
            stats,
        };
        pll.reset(sample_rate, period_size);
        pll
    }

    /// Re-initialise after the sample rate or period size changed.
    ///
    /// Only valid while the threads that tick and consume periods are quiesced.
    pub fn reset(&self, sample_rate: u32, period_size: usize) {
        let frame_ns = 1.0e9 / sample_rate as f64;
        let nominal = frame_ns * period_size as f64;
        self.period_size.store(period_size, Ordering::Release);
        self.frame_ns.set(frame_ns);
        self.nominal_period_ns.set(nominal);
        self.measured_period_ns.set(nominal);
        self.pending_periods.store(0, Ordering::Release);
        self.consumed_periods.store(0, Ordering::Release);
        self.started.set(false);
    }

    /// Nanoseconds elapsed since this PLL was created.
    #[inline]
    pub fn now_ns(&self) -> i64 {
        self.epoch.elapsed().as_nanos() as i64
    }

    pub fn period_size(&self) -> usize {
        self.period_size.load(Ordering::Acquire)
    }

    pub fn frame_ns(&self) -> f64 {
        self.frame_ns.get()
    }

    pub fn nominal_period_ns(&self) -> f64 {
        self.nominal_period_ns.get()
    }

    pub fn measured_period_ns(&self) -> f64 {
        self.measured_period_ns.get()
    }

    pub fn reference_timestamp(&self) -> i64 {
        self.reference_ns.load(Ordering::Acquire)
    }

    pub fn phase_lock_target(&self) -> f64 {
        self.phase_lock_target.get()
    }

    /// Set where (in frames after the boundary) the wakeup is expected.
    pub fn set_phase_lock_target(&self, frames: f64) {
        self.phase_lock_target.set(frames);
    }

    pub fn is_started(&self) -> bool {
        self.started.get()
    }

    pub fn last_regime(&self) -> PhaseRegime {
        PhaseRegime::from_u8(self.last_regime.load(Ordering::Acquire))
    }

    pub fn regime_count(&self, regime: PhaseRegime) -> u64 {
        self.regime_counts[regime as usize].get()
    }

    /// Run one PLL step for a period wakeup observed now.
    pub fn update_now(&self) -> PhaseRegime {
        self.update(self.now_ns())
    }

    /// Run one PLL step for a period wakeup at `now` (ns since epoch).
    ///
    /// Must be called exactly once per hardware period.
    pub fn update(&self, now: i64) -> PhaseRegime {
        let frame_ns = self.frame_ns.get();
        let target_ns = self.phase_lock_target.get() * frame_ns;

        if !self.started.get() {
            self.reference_ns
                .store(now - target_ns.round() as i64, Ordering::Release);
            self.last_wakeup_ns.store(now, Ordering::Release);
            self.started.set(true);
            self.record(PhaseRegime::Locked);
            self.tick();
            return PhaseRegime::Locked;
        }

        let nominal = self.nominal_period_ns.get();
        let mut measured = self.measured_period_ns.get();
        let reference = self.reference_ns.load(Ordering::Acquire);
        let boundary = reference as f64 + measured;
        let delta = now as f64 - boundary;

        let interval = (now - self.last_wakeup_ns.swap(now, Ordering::AcqRel)) as f64;
        let plausible = interval > nominal * 0.5 && interval < nominal * 1.5;
        if plausible {
            measured += (interval - measured) * PERIOD_SMOOTHING;
        }

        let error_frames = (delta - target_ns) / frame_ns;
        let regime = PhaseRegime::classify(error_frames);
        let next_reference = match regime {
            PhaseRegime::FarEarly => now as f64 - target_ns,
            PhaseRegime::SlightlyEarly => boundary - NUDGE_FRAMES * frame_ns,
            PhaseRegime::Locked => boundary,
            PhaseRegime::SlightlyLate => boundary + NUDGE_FRAMES * frame_ns,
            PhaseRegime::FarLate => {
                self.stats.far_late_periods.increment();
                if plausible {
                    measured += PERIOD_NUDGE_FRAMES * frame_ns;
                }
                now as f64 - target_ns
            }
        };

        let measured = measured.clamp(nominal * 0.9, nominal * 1.1);
        self.measured_period_ns.set(measured);
        self.reference_ns
            .store(next_reference.round() as i64, Ordering::Release);
        self.record(regime);
        self.tick();
        regime
    }

    fn record(&self, regime: PhaseRegime) {
        self.last_regime.store(regime as u8, Ordering::Release);
        self.regime_counts[regime as usize].increment();
    }

    /// Unclamped frame position of `now` relative to the current period start.
    #[inline]
    pub fn frames_since_reference(&self, now: i64) -> f64 {
        let reference = self.reference_ns.load(Ordering::Acquire);
        (now - reference) as f64 / self.frame_ns.get()
    }

    /// Frame offset of `now` within the current period, in `[0, period_size)`.
    ///
    /// Out-of-range positions mean a period was missed; they are clamped and
    /// counted as timing violations.
    #[inline]
    pub fn sample_offset_for(&self, now: i64) -> usize {
        let period_size = self.period_size.load(Ordering::Acquire);
        let frames = self.frames_since_reference(now).floor();
        if frames < 0.0 {
            self.stats.timing_violations.increment();
            0
        } else if frames >= period_size as f64 {
            self.stats.timing_violations.increment();
            period_size - 1
        } else {
            frames as usize
        }
    }

    /// Nanoseconds until the next expected period boundary (negative if overdue).
    #[inline]
    pub fn ns_until_next_period(&self, now: i64) -> f64 {
        let reference = self.reference_ns.load(Ordering::Acquire);
        reference as f64 + self.measured_period_ns.get() - now as f64
    }

    fn tick(&self) {
        self.pending_periods.fetch_add(1, Ordering::AcqRel);
    }

    /// Periods announced but not yet applied to the event cursor.
    pub fn outstanding_periods(&self) -> u64 {
        let pending = self.pending_periods.load(Ordering::Acquire);
        pending.saturating_sub(self.consumed_periods.load(Ordering::Acquire))
    }

    /// Claim one announced period. Exactly one caller wins each period.
    #[inline]
    pub fn try_consume_period(&self) -> bool {
        let mut consumed = self.consumed_periods.load(Ordering::Acquire);
        loop {
            if consumed >= self.pending_periods.load(Ordering::Acquire) {
                return false;
            }
            match self.consumed_periods.compare_exchange_weak(
                consumed,
                consumed + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => consumed = actual,
            }
        }
    }

    /// Apply every announced period to the shared event cursor.
    ///
    /// Safe to call from any thread at any time; each period moves the event
    /// cursor by exactly one `period_size` no matter how many threads race.
    /// Returns the number of periods this caller applied.
    #[inline]
    pub fn advance_event_index(&self, buffer: &ClockedBuffer) -> usize {
        let period_size = self.period_size.load(Ordering::Acquire);
        let mut applied = 0;
        while self.try_consume_period() {
            buffer.advance(Cursor::Event, period_size);
            applied += 1;
        }
        applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: u32 = 48000;
    const PERIOD: usize = 256;

    fn pll() -> MidiClockPll {
        MidiClockPll::new(RATE, PERIOD, Arc::new(TimingStats::new()))
    }

    #[test]
    fn test_classify_boundaries() {
        assert_eq!(PhaseRegime::classify(-3.0), PhaseRegime::FarEarly);
        assert_eq!(PhaseRegime::classify(-1.0), PhaseRegime::SlightlyEarly);
        assert_eq!(PhaseRegime::classify(0.0), PhaseRegime::Locked);
        assert_eq!(PhaseRegime::classify(0.5), PhaseRegime::Locked);
        assert_eq!(PhaseRegime::classify(1.5), PhaseRegime::SlightlyLate);
        assert_eq!(PhaseRegime::classify(2.5), PhaseRegime::FarLate);
    }

    #[test]
    fn test_first_update_latches() {
        let pll = pll();
        let frame = pll.frame_ns();
        assert_eq!(pll.update(1_000_000), PhaseRegime::Locked);
        assert!(pll.is_started());
        let expected = 1_000_000 - (DEFAULT_PHASE_LOCK_TARGET * frame).round() as i64;
        assert_eq!(pll.reference_timestamp(), expected);
    }

    #[test]
    fn test_exact_wakeups_stay_locked() {
        let pll = pll();
        let period = pll.nominal_period_ns();
        for k in 0..100 {
            let now = 10_000_000 + (k as f64 * period) as i64;
            assert_eq!(pll.update(now), PhaseRegime::Locked, "period {}", k);
        }
        assert_eq!(pll.regime_count(PhaseRegime::Locked), 100);
    }

    #[test]
    fn test_far_late_latches_to_wakeup() {
        let pll = pll();
        let frame = pll.frame_ns();
        let period = pll.nominal_period_ns();
        pll.update(0);
        let late = (period + 10.0 * frame) as i64;
        assert_eq!(pll.update(late), PhaseRegime::FarLate);
        let target = (DEFAULT_PHASE_LOCK_TARGET * frame).round() as i64;
        assert!((pll.reference_timestamp() - (late - target)).abs() <= 1);
        assert!(pll.measured_period_ns() > period);
        assert_eq!(pll.stats.far_late_periods.get(), 1);
    }

    #[test]
    fn test_slightly_early_nudges_half_frame() {
        let pll = pll();
        let frame = pll.frame_ns();
        let period = pll.nominal_period_ns();
        pll.update(0);
        let reference = pll.reference_timestamp() as f64;
        let early = (period - frame).round() as i64;
        assert_eq!(pll.update(early), PhaseRegime::SlightlyEarly);
        let expected = reference + pll.measured_period_ns() - 0.5 * frame;
        // The period estimate moved by at most a hair between the two reads.
        assert!((pll.reference_timestamp() as f64 - expected).abs() < 10.0);
    }

    #[test]
    fn test_sample_offset_in_period() {
        let pll = pll();
        let frame = pll.frame_ns();
        pll.update(0);
        let reference = pll.reference_timestamp();
        let now = reference + (100.5 * frame) as i64;
        assert_eq!(pll.sample_offset_for(now), 100);
        assert_eq!(pll.stats.timing_violations.get(), 0);
    }

    #[test]
    fn test_sample_offset_clamps_and_counts() {
        let pll = pll();
        let frame = pll.frame_ns();
        pll.update(1_000_000_000);
        let reference = pll.reference_timestamp();
        assert_eq!(pll.sample_offset_for(reference - 1000), 0);
        let missed = reference + (PERIOD as f64 * 1.5 * frame) as i64;
        assert_eq!(pll.sample_offset_for(missed), PERIOD - 1);
        assert_eq!(pll.stats.timing_violations.get(), 2);
    }

    #[test]
    fn test_each_period_consumed_once() {
        let pll = pll();
        assert!(!pll.try_consume_period());
        pll.update(0);
        pll.update(pll.nominal_period_ns() as i64);
        assert_eq!(pll.outstanding_periods(), 2);
        assert!(pll.try_consume_period());
        assert!(pll.try_consume_period());
        assert!(!pll.try_consume_period());
    }

    #[test]
    fn test_reset_clears_periods() {
        let pll = pll();
        pll.update(0);
        pll.reset(44100, 128);
        assert!(!pll.is_started());
        assert_eq!(pll.outstanding_periods(), 0);
        assert_eq!(pll.period_size(), 128);
        approx::assert_relative_eq!(
            pll.nominal_period_ns(),
            128.0 * 1.0e9 / 44100.0,
            epsilon = 1e-6
        );
    }
}
