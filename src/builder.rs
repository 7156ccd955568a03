//! Builder for configuring and constructing a `SynthEngine`.

use crate::engine::{EngineShared, SynthEngine};
use crate::synthesis::{basic_renderer_factory, PartEngine, RendererFactory, SynthPool};
use crate::watchdog::Runtime;
use crate::Result;
use ostinato_core::{EngineConfig, PartConfig};
use ostinato_io::{create_audio_driver, create_event_driver, AudioDriver, EventDriver};
use ostinato_synth::VoiceRenderer;
use std::sync::Arc;
use tracing::info;

/// Starts from [`EngineConfig::default`] or a loaded config; every setter
/// overrides one field. Drivers are picked by name unless a driver object is
/// supplied directly.
///
/// Pools (voice slots, event slots, output rings) are allocated in
/// [`build`](Self::build); nothing is allocated after that.
///
/// # Example
///
/// ```ignore
/// use ostinato::prelude::*;
///
/// let engine = SynthEngine::builder()
///     .period_size(128)
///     .part(PartConfig { polyphony: 16, ..Default::default() })
///     .audio_driver_name("cpal")
///     .event_driver_name("midir")
///     .build()?;
/// ```
pub struct SynthEngineBuilder {
    config: EngineConfig,
    explicit_parts: Vec<PartConfig>,
    audio_driver: Option<Box<dyn AudioDriver>>,
    event_driver: Option<Box<dyn EventDriver>>,
    renderers: Option<RendererFactory>,
}

impl Default for SynthEngineBuilder {
    fn default() -> Self {
        Self {
            config: EngineConfig::default(),
            explicit_parts: Vec::new(),
            audio_driver: None,
            event_driver: None,
            renderers: None,
        }
    }
}

impl SynthEngineBuilder {
    /// Replace the whole configuration. Later setters still apply on top.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Default: 48000
    pub fn sample_rate(mut self, sample_rate: u32) -> Self {
        self.config.sample_rate = sample_rate;
        self
    }

    /// Default: 256
    pub fn period_size(mut self, frames: usize) -> Self {
        self.config.period_size = frames;
        self
    }

    /// Default: 4
    pub fn period_count(mut self, count: usize) -> Self {
        self.config.period_count = count;
        self
    }

    /// Default: 2
    pub fn latency_periods(mut self, periods: usize) -> Self {
        self.config.latency_periods = periods;
        self
    }

    /// Add a part. Once any part is added here, the configured parts are replaced.
    pub fn part(mut self, part: PartConfig) -> Self {
        self.explicit_parts.push(part);
        self
    }

    pub fn parts(mut self, parts: impl IntoIterator<Item = PartConfig>) -> Self {
        self.explicit_parts.extend(parts);
        self
    }

    /// "cpal", "timer" or "none".
    pub fn audio_driver_name(mut self, name: &str) -> Self {
        self.config.audio.driver = name.to_string();
        self
    }

    pub fn audio_device(mut self, device: &str) -> Self {
        self.config.audio.device = Some(device.to_string());
        self
    }

    /// "midir", "virtual" or "none".
    pub fn event_driver_name(mut self, name: &str) -> Self {
        self.config.events.driver = name.to_string();
        self
    }

    pub fn event_device(mut self, device: &str) -> Self {
        self.config.events.device = Some(device.to_string());
        self
    }

    /// Use this audio driver instead of the one named in the config.
    pub fn audio_driver(mut self, driver: Box<dyn AudioDriver>) -> Self {
        self.audio_driver = Some(driver);
        self
    }

    /// Use this event driver instead of the one named in the config.
    pub fn event_driver(mut self, driver: Box<dyn EventDriver>) -> Self {
        self.event_driver = Some(driver);
        self
    }

    /// Supply the per-part renderer. Called with the part index and the
    /// rate the part renders at; called again if the part has to be rebuilt.
    pub fn renderer<F>(mut self, factory: F) -> Self
    where
        F: Fn(usize, f64) -> Box<dyn VoiceRenderer> + Send + Sync + 'static,
    {
        self.renderers = Some(Arc::new(factory));
        self
    }

    /// Default: 250 ms
    pub fn watchdog_interval_ms(mut self, interval: u64) -> Self {
        self.config.watchdog_interval_ms = interval;
        self
    }

    /// Request elevated priority for synthesis threads. Default: true
    pub fn realtime(mut self, enabled: bool) -> Self {
        self.config.threads.realtime = enabled;
        self
    }

    pub fn build(self) -> Result<SynthEngine> {
        let mut config = self.config;
        if !self.explicit_parts.is_empty() {
            config.parts = self.explicit_parts;
        }
        config.validate()?;

        let audio = match self.audio_driver {
            Some(driver) => driver,
            None => create_audio_driver(&config.audio.driver)?,
        };
        let events = match self.event_driver {
            Some(driver) => driver,
            None => create_event_driver(&config.events.driver)?,
        };

        let shared = Arc::new(EngineShared::new(config)?);
        let renderers = self.renderers.unwrap_or_else(basic_renderer_factory);
        let parts = shared
            .config
            .parts
            .iter()
            .enumerate()
            .map(|(index, part)| PartEngine::new(index, part, shared.sample_rate(), &renderers))
            .collect::<Result<Vec<_>>>()?;

        info!(
            "Engine built: {} part(s), {} x {} frames, audio '{}', events '{}'",
            parts.len(),
            shared.config.period_count,
            shared.config.period_size,
            audio.name(),
            events.name()
        );

        let pool = SynthPool::new(parts, renderers);
        let runtime = Runtime::new(shared.clone(), audio, events, pool);
        Ok(SynthEngine::from_parts(shared, runtime))
    }
}
