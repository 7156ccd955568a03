//! Engine configuration.
//!
//! Everything here is a startup/resync parameter: the hot path only ever sees
//! local copies taken when a thread (re)synchronises.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Maximum number of parts an engine can run.
pub const MAX_PARTS: usize = 16;

/// Maximum polyphony per part.
pub const MAX_POLYPHONY: usize = 64;

/// Policy for mapping MIDI keys to voices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyMode {
    /// One voice per key, stealing the oldest when exhausted.
    #[default]
    Poly,
    /// One rotating voice; legato notes glide without a new attack.
    MonoSmooth,
    /// One sounding voice; every note retriggers a fresh attack.
    MonoRetrigger,
    /// One voice whose oscillators are spread across the held keys.
    MonoMultikey,
}

/// Internal rendering rate relative to the hardware rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SampleRateMode {
    #[default]
    Normal,
    /// Render at twice the hardware rate and average each pair.
    Oversample,
    /// Render at half the hardware rate and interpolate.
    Undersample,
}

impl SampleRateMode {
    /// Rate the renderer runs at for a given hardware rate.
    pub fn effective_rate(self, sample_rate: u32) -> f64 {
        match self {
            SampleRateMode::Normal => sample_rate as f64,
            SampleRateMode::Oversample => sample_rate as f64 * 2.0,
            SampleRateMode::Undersample => sample_rate as f64 * 0.5,
        }
    }
}

/// Per-part configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartConfig {
    /// MIDI channel (0-15) this part listens on; `None` listens on all.
    pub midi_channel: Option<u8>,
    pub polyphony: usize,
    pub keymode: KeyMode,
    pub sample_rate_mode: SampleRateMode,
}

impl Default for PartConfig {
    fn default() -> Self {
        Self {
            midi_channel: None,
            polyphony: 8,
            keymode: KeyMode::Poly,
            sample_rate_mode: SampleRateMode::Normal,
        }
    }
}

/// Audio driver selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioSettings {
    /// Driver name: "cpal", "timer" or "none".
    pub driver: String,
    /// Device name filter; `None` uses the system default.
    pub device: Option<String>,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            driver: "cpal".to_string(),
            device: None,
        }
    }
}

/// Event (MIDI input) driver selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventSettings {
    /// Driver name: "midir", "virtual" or "none".
    pub driver: String,
    /// Port name filter; `None` connects to the first available port.
    pub device: Option<String>,
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            driver: "midir".to_string(),
            device: None,
        }
    }
}

/// Scheduling settings for the real-time threads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadSettings {
    /// Request elevated priority for synthesis threads.
    pub realtime: bool,
    /// Cross-platform priority value (0-99) for synthesis threads.
    pub synth_priority: u8,
}

impl Default for ThreadSettings {
    fn default() -> Self {
        Self {
            realtime: true,
            synth_priority: 80,
        }
    }
}

/// Configuration for the synthesis engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub sample_rate: u32,
    /// Frames per period (power of two).
    pub period_size: usize,
    /// Periods in the shared ring (power of two).
    pub period_count: usize,
    /// How many periods the audio reader trails the writers.
    pub latency_periods: usize,
    /// Upper bound for any renegotiated ring size; pools are sized to this.
    pub max_buffer_frames: usize,
    /// Overflow entries per part for bursts sharing one sample slot.
    pub overflow_capacity: usize,
    pub watchdog_interval_ms: u64,
    pub parts: Vec<PartConfig>,
    pub audio: AudioSettings,
    pub events: EventSettings,
    pub threads: ThreadSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            period_size: 256,
            period_count: 4,
            latency_periods: 2,
            max_buffer_frames: 16384,
            overflow_capacity: 64,
            watchdog_interval_ms: 250,
            parts: vec![PartConfig::default()],
            audio: AudioSettings::default(),
            events: EventSettings::default(),
            threads: ThreadSettings::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    pub fn part_count(&self) -> usize {
        self.parts.len()
    }

    /// Ring size in frames.
    pub fn total_size(&self) -> usize {
        self.period_size * self.period_count
    }

    /// Audio reader lag in frames.
    pub fn latency_frames(&self) -> usize {
        self.period_size * self.latency_periods
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_rate < 8000 || self.sample_rate > 384000 {
            return Err(Error::InvalidConfig(format!(
                "sample_rate {} out of range (8000-384000 Hz)",
                self.sample_rate
            )));
        }
        if !self.period_size.is_power_of_two() || !(16..=4096).contains(&self.period_size) {
            return Err(Error::InvalidConfig(format!(
                "period_size {} must be a power of two in 16-4096",
                self.period_size
            )));
        }
        if !self.period_count.is_power_of_two() || self.period_count < 4 {
            return Err(Error::InvalidConfig(format!(
                "period_count {} must be a power of two >= 4",
                self.period_count
            )));
        }
        if !self.max_buffer_frames.is_power_of_two() || self.total_size() > self.max_buffer_frames
        {
            return Err(Error::InvalidConfig(format!(
                "max_buffer_frames {} must be a power of two >= {}",
                self.max_buffer_frames,
                self.total_size()
            )));
        }
        if self.latency_periods < 2 || self.latency_periods >= self.period_count {
            return Err(Error::InvalidConfig(format!(
                "latency_periods {} must be in 2..{}",
                self.latency_periods, self.period_count
            )));
        }
        if self.overflow_capacity == 0 {
            return Err(Error::InvalidConfig(
                "overflow_capacity must be at least 1".to_string(),
            ));
        }
        if self.parts.is_empty() || self.parts.len() > MAX_PARTS {
            return Err(Error::InvalidConfig(format!(
                "part count {} out of range (1-{})",
                self.parts.len(),
                MAX_PARTS
            )));
        }
        for (index, part) in self.parts.iter().enumerate() {
            if part.polyphony == 0 || part.polyphony > MAX_POLYPHONY {
                return Err(Error::InvalidConfig(format!(
                    "part {} polyphony {} out of range (1-{})",
                    index, part.polyphony, MAX_POLYPHONY
                )));
            }
            if matches!(part.midi_channel, Some(channel) if channel > 15) {
                return Err(Error::InvalidConfig(format!(
                    "part {} midi channel must be 0-15",
                    index
                )));
            }
        }
        if self.threads.synth_priority > 99 {
            return Err(Error::InvalidConfig(
                "synth_priority must be 0-99".to_string(),
            ));
        }
        Ok(())
    }
}
