//! Interval-based envelopes.
//!
//! ```text
//!   Attack -> Decay -> Sustain -> Release -> Fade -> Done
//! ```
//!
//! Each interval is a linear segment with a precomputed sample count and
//! per-sample delta, except Fade, which multiplies by a fixed coefficient so
//! the tail ends smoothly instead of with a final step. Durations come from a
//! [`TimeTable`] keyed by the 0-127 control value.

/// Shortest segment the table maps to (control value 0), in milliseconds.
pub const MIN_TIME_MS: f64 = 0.5;

/// Longest segment the table maps to (control value 127), in milliseconds.
pub const MAX_TIME_MS: f64 = 8000.0;

/// Level the Release segment ramps down to before Fade takes over.
pub const RELEASE_FLOOR: f32 = 1.0e-2;

/// Level below which a fading envelope is considered silent.
pub const AUDIBLE_FLOOR: f32 = 1.0e-4;

/// Per-sample multiplier applied during Fade.
pub const FADE_COEFFICIENT: f32 = 0.99;

/// Upper bound on Fade length in samples, from `RELEASE_FLOOR` to `AUDIBLE_FLOOR`.
pub const MAX_FADE_SAMPLES: u32 = 460;

/// Segment duration in milliseconds for a 0-127 control value (exponential).
pub fn control_to_ms(value: u8) -> f64 {
    let position = value.min(127) as f64 / 127.0;
    MIN_TIME_MS * (MAX_TIME_MS / MIN_TIME_MS).powf(position)
}

/// Control value to sample count lookup for one sample rate.
///
/// Rebuilt in place when the rate changes; never allocates.
#[derive(Debug, Clone)]
pub struct TimeTable {
    samples: [u32; 128],
    sample_rate: f64,
}

impl TimeTable {
    pub fn new(sample_rate: f64) -> Self {
        let mut table = Self {
            samples: [1; 128],
            sample_rate,
        };
        table.rebuild(sample_rate);
        table
    }

    pub fn rebuild(&mut self, sample_rate: f64) {
        self.sample_rate = sample_rate;
        for (value, samples) in self.samples.iter_mut().enumerate() {
            let ms = control_to_ms(value as u8);
            *samples = ((ms * sample_rate / 1000.0).round() as u32).max(1);
        }
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    #[inline]
    pub fn samples(&self, value: u8) -> u32 {
        self.samples[value.min(127) as usize]
    }
}

/// Envelope controls, each a 0-127 value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvelopeParams {
    pub attack: u8,
    pub decay: u8,
    /// Sustain level (0 = silent, 127 = full).
    pub sustain: u8,
    pub release: u8,
}

impl Default for EnvelopeParams {
    fn default() -> Self {
        Self {
            attack: 10,
            decay: 50,
            sustain: 100,
            release: 50,
        }
    }
}

impl EnvelopeParams {
    pub fn sustain_level(&self) -> f32 {
        self.sustain.min(127) as f32 / 127.0
    }

    /// Samples from entering Release until Done, at most.
    pub fn release_bound(&self, table: &TimeTable) -> u32 {
        table.samples(self.release) + MAX_FADE_SAMPLES
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnvelopeInterval {
    Attack,
    Decay,
    Sustain,
    Release,
    Fade,
    #[default]
    Done,
}

#[derive(Debug, Clone, Default)]
pub struct Envelope {
    interval: EnvelopeInterval,
    remaining: u32,
    delta: f32,
    value: f32,
    decay_samples: u32,
    sustain_level: f32,
}

impl Envelope {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn interval(&self) -> EnvelopeInterval {
        self.interval
    }

    #[inline]
    pub fn value(&self) -> f32 {
        self.value
    }

    /// Samples left in the current linear segment.
    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.interval == EnvelopeInterval::Done
    }

    pub fn is_releasing(&self) -> bool {
        matches!(
            self.interval,
            EnvelopeInterval::Release | EnvelopeInterval::Fade
        )
    }

    /// Start a fresh Attack from the current level up to full scale.
    pub fn trigger(&mut self, params: &EnvelopeParams, table: &TimeTable) {
        self.decay_samples = table.samples(params.decay);
        self.sustain_level = params.sustain_level();
        self.enter(EnvelopeInterval::Attack, table.samples(params.attack), 1.0);
    }

    /// Cancel a release and glide back to the sustain level without a new
    /// Attack. Envelopes not releasing are left untouched.
    pub fn fast_track(&mut self, params: &EnvelopeParams, table: &TimeTable) {
        if !self.is_releasing() {
            return;
        }
        self.decay_samples = table.samples(params.decay);
        self.sustain_level = params.sustain_level();
        let target = self.sustain_level;
        self.enter(EnvelopeInterval::Sustain, self.decay_samples, target);
    }

    /// Enter Release. Already-quiet envelopes go straight to Fade.
    pub fn release(&mut self, params: &EnvelopeParams, table: &TimeTable) {
        match self.interval {
            EnvelopeInterval::Release | EnvelopeInterval::Fade | EnvelopeInterval::Done => {}
            _ if self.value <= RELEASE_FLOOR => self.enter_fade(),
            _ => self.enter(
                EnvelopeInterval::Release,
                table.samples(params.release),
                RELEASE_FLOOR,
            ),
        }
    }

    /// Jump to Done and silence.
    pub fn kill(&mut self) {
        self.interval = EnvelopeInterval::Done;
        self.remaining = 0;
        self.delta = 0.0;
        self.value = 0.0;
    }

    fn enter(&mut self, interval: EnvelopeInterval, samples: u32, target: f32) {
        let samples = samples.max(1);
        self.interval = interval;
        self.remaining = samples;
        self.delta = (target - self.value) / samples as f32;
    }

    fn enter_fade(&mut self) {
        self.interval = EnvelopeInterval::Fade;
        self.remaining = 0;
        self.delta = 0.0;
    }

    /// Advance one sample and return the new level.
    #[inline]
    pub fn tick(&mut self) -> f32 {
        match self.interval {
            EnvelopeInterval::Attack => {
                self.value += self.delta;
                self.remaining -= 1;
                if self.remaining == 0 {
                    self.value = 1.0;
                    let target = self.sustain_level;
                    self.enter(EnvelopeInterval::Decay, self.decay_samples, target);
                }
            }
            EnvelopeInterval::Decay => {
                self.value += self.delta;
                self.remaining -= 1;
                if self.remaining == 0 {
                    self.value = self.sustain_level;
                    self.interval = EnvelopeInterval::Sustain;
                }
            }
            EnvelopeInterval::Sustain => {
                if self.remaining > 0 {
                    self.value += self.delta;
                    self.remaining -= 1;
                    if self.remaining == 0 {
                        self.value = self.sustain_level;
                    }
                }
            }
            EnvelopeInterval::Release => {
                self.value += self.delta;
                self.remaining -= 1;
                if self.remaining == 0 {
                    self.value = self.value.min(RELEASE_FLOOR);
                    self.enter_fade();
                }
            }
            EnvelopeInterval::Fade => {
                self.value *= FADE_COEFFICIENT;
                if self.value < AUDIBLE_FLOOR {
                    self.kill();
                }
            }
            EnvelopeInterval::Done => {}
        }
        self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn table() -> TimeTable {
        TimeTable::new(48000.0)
    }

    #[test]
    fn test_control_range() {
        assert_relative_eq!(control_to_ms(0), MIN_TIME_MS, epsilon = 1e-9);
        assert_relative_eq!(control_to_ms(127), MAX_TIME_MS, max_relative = 1e-9);
        assert!(control_to_ms(64) > control_to_ms(63));
    }

    #[test]
    fn test_table_never_zero() {
        let table = TimeTable::new(8000.0);
        assert_eq!(table.samples(0), 4);
        let table = TimeTable::new(1000.0);
        assert!(table.samples(0) >= 1);
    }

    #[test]
    fn test_fade_bound_holds() {
        let mut value = RELEASE_FLOOR;
        let mut samples = 0;
        while value >= AUDIBLE_FLOOR {
            value *= FADE_COEFFICIENT;
            samples += 1;
        }
        assert!(samples <= MAX_FADE_SAMPLES);
    }

    #[test]
    fn test_attack_decay_sustain() {
        let table = table();
        let params = EnvelopeParams {
            attack: 0,
            decay: 0,
            sustain: 64,
            release: 0,
        };
        let mut env = Envelope::new();
        env.trigger(&params, &table);
        assert_eq!(env.interval(), EnvelopeInterval::Attack);

        let attack = table.samples(0);
        for _ in 0..attack {
            env.tick();
        }
        assert_eq!(env.interval(), EnvelopeInterval::Decay);
        for _ in 0..table.samples(0) {
            env.tick();
        }
        assert_eq!(env.interval(), EnvelopeInterval::Sustain);
        assert_relative_eq!(env.value(), params.sustain_level());
        for _ in 0..1000 {
            env.tick();
        }
        assert_relative_eq!(env.value(), params.sustain_level());
    }

    #[test]
    fn test_release_reaches_done_within_bound() {
        let table = table();
        let params = EnvelopeParams {
            attack: 0,
            decay: 0,
            sustain: 127,
            release: 30,
        };
        let mut env = Envelope::new();
        env.trigger(&params, &table);
        for _ in 0..100 {
            env.tick();
        }
        env.release(&params, &table);
        assert_eq!(env.interval(), EnvelopeInterval::Release);

        let bound = params.release_bound(&table);
        let mut samples = 0;
        while !env.is_done() {
            env.tick();
            samples += 1;
            assert!(samples <= bound, "release exceeded {} samples", bound);
        }
        assert_eq!(env.value(), 0.0);
    }

    #[test]
    fn test_fast_track_cancels_release() {
        let table = table();
        let params = EnvelopeParams::default();
        let mut env = Envelope::new();
        env.trigger(&params, &table);
        for _ in 0..20000 {
            env.tick();
        }
        env.release(&params, &table);
        env.tick();
        env.fast_track(&params, &table);
        assert_eq!(env.interval(), EnvelopeInterval::Sustain);

        for _ in 0..table.samples(params.decay) {
            env.tick();
        }
        assert_relative_eq!(env.value(), params.sustain_level(), epsilon = 1e-4);
    }

    #[test]
    fn test_quiet_release_goes_to_fade() {
        let table = table();
        let params = EnvelopeParams {
            sustain: 0,
            ..Default::default()
        };
        let mut env = Envelope::new();
        env.trigger(&params, &table);
        for _ in 0..200_000 {
            env.tick();
        }
        env.release(&params, &table);
        assert_eq!(env.interval(), EnvelopeInterval::Fade);
    }

    #[test]
    fn test_release_is_idempotent() {
        let table = table();
        let params = EnvelopeParams::default();
        let mut env = Envelope::new();
        env.trigger(&params, &table);
        env.tick();
        env.release(&params, &table);
        let remaining = env.remaining();
        env.release(&params, &table);
        assert_eq!(env.remaining(), remaining);
    }
}
