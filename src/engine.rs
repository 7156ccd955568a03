//! `SynthEngine`: the context that owns every shared atomic and driver.

use crate::builder::SynthEngineBuilder;
use crate::watchdog::{Runtime, Watchdog};
use crate::{Error, Result};
use ostinato_core::{
    AtomicCounter, AtomicFloat, BufferGeometry, ClockedBuffer, EngineConfig, EventDispatcher,
    EventKind, EventQueue, MidiClockPll, OutputRing, ReadySignal, StatsSnapshot, SynthEvent,
    TimingStats,
};
use ostinato_io::{DeviceInfo, DeviceRegistry, DriverState, DriverStatus, Subsystem, VirtualPort};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

/// Marks a voice slot with no note in a [`PartMonitor`].
const NO_NOTE: u8 = u8::MAX;

/// What a part's synthesis thread last published about its voices.
///
/// Written once per rendered period, never per sample.
#[derive(Debug)]
pub(crate) struct PartMonitor {
    notes: Box<[AtomicU8]>,
    allocated: AtomicUsize,
    pub(crate) periods: AtomicCounter,
    pub(crate) ready: ReadySignal,
}

impl PartMonitor {
    fn new(polyphony: usize) -> Self {
        Self {
            notes: (0..polyphony).map(|_| AtomicU8::new(NO_NOTE)).collect(),
            allocated: AtomicUsize::new(0),
            periods: AtomicCounter::new(),
            ready: ReadySignal::new(),
        }
    }

    pub(crate) fn publish(&self, voices: impl Iterator<Item = (bool, u8)>) {
        let mut allocated = 0;
        for (slot, (active, note)) in self.notes.iter().zip(voices) {
            if active {
                allocated += 1;
                slot.store(note, Ordering::Relaxed);
            } else {
                slot.store(NO_NOTE, Ordering::Relaxed);
            }
        }
        self.allocated.store(allocated, Ordering::Release);
        self.periods.increment();
    }

    fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }

    fn snapshot(&self) -> Vec<Option<u8>> {
        self.notes
            .iter()
            .map(|note| match note.load(Ordering::Relaxed) {
                NO_NOTE => None,
                note => Some(note),
            })
            .collect()
    }
}

/// Peak and frame count of what the audio callback delivered.
#[derive(Debug, Default)]
pub(crate) struct OutputMeter {
    peak: AtomicFloat,
    frames: AtomicU64,
}

impl OutputMeter {
    #[inline]
    pub(crate) fn record(&self, peak: f32, frames: usize) {
        self.peak.raise_to(peak);
        self.frames.fetch_add(frames as u64, Ordering::Relaxed);
    }

    pub(crate) fn take_peak(&self) -> f32 {
        self.peak.replace(0.0)
    }

    pub(crate) fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }
}

/// State shared by the audio callback, event input, synthesis threads and
/// watchdog. Everything behind it is allocated once at build time.
#[derive(Debug)]
pub(crate) struct EngineShared {
    pub(crate) config: EngineConfig,
    /// Hardware rate currently negotiated.
    sample_rate: AtomicU32,
    pub(crate) stats: Arc<TimingStats>,
    pub(crate) buffer: Arc<ClockedBuffer>,
    pub(crate) pll: Arc<MidiClockPll>,
    pub(crate) queue: Arc<EventQueue>,
    pub(crate) dispatcher: Arc<EventDispatcher>,
    pub(crate) rings: Box<[OutputRing]>,
    pub(crate) monitors: Box<[PartMonitor]>,
    pub(crate) meter: OutputMeter,
    pub(crate) registry: DeviceRegistry,
}

impl EngineShared {
    pub(crate) fn new(config: EngineConfig) -> Result<Self> {
        let parts = config.part_count();
        let capacity = config.max_buffer_frames;
        let stats = Arc::new(TimingStats::new());

        let geometry =
            BufferGeometry::new(config.period_size, config.period_count, config.latency_periods)?;
        let buffer = Arc::new(ClockedBuffer::new(geometry, capacity, parts)?);
        let pll = Arc::new(MidiClockPll::new(
            config.sample_rate,
            config.period_size,
            stats.clone(),
        ));
        let queue = Arc::new(EventQueue::new(
            parts,
            capacity,
            config.overflow_capacity,
            stats.clone(),
        )?);
        queue.reset(geometry.mask);
        let dispatcher = Arc::new(EventDispatcher::new(
            buffer.clone(),
            pll.clone(),
            queue.clone(),
            &config.parts,
        ));

        let mut rings = Vec::new();
        rings
            .try_reserve_exact(parts)
            .map_err(|_| ostinato_core::Error::PoolAllocation {
                pool: "output ring",
                entries: parts,
            })?;
        for _ in 0..parts {
            rings.push(OutputRing::new(capacity)?);
        }
        let monitors = config
            .parts
            .iter()
            .map(|part| PartMonitor::new(part.polyphony))
            .collect();

        Ok(Self {
            sample_rate: AtomicU32::new(config.sample_rate),
            config,
            stats,
            buffer,
            pll,
            queue,
            dispatcher,
            rings: rings.into_boxed_slice(),
            monitors,
            meter: OutputMeter::default(),
            registry: DeviceRegistry::new(),
        })
    }

    pub(crate) fn sample_rate(&self) -> u32 {
        self.sample_rate.load(Ordering::Acquire)
    }

    pub(crate) fn set_sample_rate(&self, sample_rate: u32) {
        self.sample_rate.store(sample_rate, Ordering::Release);
    }

    /// Install a negotiated format. Only while every cursor owner is quiesced.
    pub(crate) fn reset_timeline(
        &self,
        sample_rate: u32,
        period_size: usize,
    ) -> Result<BufferGeometry> {
        let geometry = self.buffer.resize(
            period_size,
            self.config.period_count,
            self.config.latency_periods,
        )?;
        self.queue.reset(geometry.mask);
        self.pll.reset(sample_rate, period_size);
        for ring in self.rings.iter() {
            ring.clear();
        }
        self.set_sample_rate(sample_rate);
        Ok(geometry)
    }
}

/// Polyphonic synthesis engine.
///
/// Owns the clocked buffer, PLL, event queues and output rings, the audio and
/// event drivers, one synthesis thread per part and the watchdog that keeps
/// them running.
///
/// # Example
///
/// ```ignore
/// use ostinato::prelude::*;
///
/// let engine = SynthEngine::builder()
///     .audio_driver_name("timer")
///     .event_driver_name("virtual")
///     .build()?;
/// engine.start()?;
///
/// engine.note_on(0, 60, 100);
/// ```
pub struct SynthEngine {
    shared: Arc<EngineShared>,
    runtime: Arc<Mutex<Runtime>>,
    watchdog: Mutex<Option<Watchdog>>,
}

impl SynthEngine {
    pub fn builder() -> SynthEngineBuilder {
        SynthEngineBuilder::default()
    }

    pub fn from_config(config: EngineConfig) -> Result<Self> {
        SynthEngineBuilder::default().config(config).build()
    }

    pub(crate) fn from_parts(shared: Arc<EngineShared>, runtime: Runtime) -> Self {
        Self {
            shared,
            runtime: Arc::new(Mutex::new(runtime)),
            watchdog: Mutex::new(None),
        }
    }

    /// Bring up synthesis threads, audio and event input, then the watchdog.
    pub fn start(&self) -> Result<()> {
        let mut watchdog = self.watchdog.lock();
        if watchdog.is_some() && self.runtime.lock().is_running() {
            return Ok(());
        }
        if let Some(mut stale) = watchdog.take() {
            stale.shutdown();
        }
        self.runtime.lock().start()?;
        *watchdog = Some(Watchdog::spawn(self.shared.clone(), self.runtime.clone())?);
        Ok(())
    }

    /// Stop the watchdog, then every driver and synthesis thread.
    pub fn stop(&self) {
        if let Some(mut watchdog) = self.watchdog.lock().take() {
            watchdog.shutdown();
        }
        self.runtime.lock().stop();
    }

    /// Running until stopped, or until the watchdog hits a fatal error.
    pub fn is_running(&self) -> bool {
        self.watchdog.lock().is_some() && self.runtime.lock().is_running()
    }

    /// Take the fatal error that made the watchdog stop the engine.
    ///
    /// Pool allocation failing during a restart cannot be retried; the
    /// engine is left stopped and the error is returned here once.
    pub fn take_fatal_error(&self) -> Option<Error> {
        self.runtime.lock().take_fatal()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Negotiated hardware sample rate.
    pub fn sample_rate(&self) -> u32 {
        self.shared.sample_rate()
    }

    pub fn geometry(&self) -> BufferGeometry {
        self.shared.buffer.geometry()
    }

    pub fn part_count(&self) -> usize {
        self.shared.config.part_count()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn pll(&self) -> &Arc<MidiClockPll> {
        &self.shared.pll
    }

    pub fn audio_state(&self) -> DriverState {
        self.audio_status().state()
    }

    pub fn event_state(&self) -> DriverState {
        self.event_status().state()
    }

    pub fn audio_status(&self) -> Arc<DriverStatus> {
        self.runtime.lock().audio_status()
    }

    pub fn event_status(&self) -> Arc<DriverStatus> {
        self.runtime.lock().event_status()
    }

    /// Sending end of the event driver, when it is the virtual one.
    pub fn virtual_input(&self) -> Option<VirtualPort> {
        self.runtime.lock().virtual_port()
    }

    /// Parse and route raw MIDI as if it arrived from the event driver now.
    pub fn dispatch_raw(&self, bytes: &[u8]) -> usize {
        self.shared.dispatcher.dispatch_raw(bytes)
    }

    pub fn dispatch(&self, event: SynthEvent) -> usize {
        self.shared.dispatcher.dispatch(event)
    }

    pub fn note_on(&self, channel: u8, note: u8, velocity: u8) -> usize {
        self.dispatch(SynthEvent::note_on(channel, note, velocity))
    }

    pub fn note_off(&self, channel: u8, note: u8) -> usize {
        self.dispatch(SynthEvent::note_off(channel, note))
    }

    pub fn controller(&self, channel: u8, controller: u8, value: u8) -> usize {
        self.dispatch(SynthEvent::controller(channel, controller, value))
    }

    /// Deliver an event to one part regardless of its channel.
    pub fn send_to_part(&self, part: usize, kind: EventKind) -> Result<()> {
        if part >= self.part_count() {
            return Err(Error::Core(ostinato_core::Error::InvalidPart(part)));
        }
        if self.shared.dispatcher.send_to_part(part, kind) {
            Ok(())
        } else {
            Err(Error::EventDropped(part))
        }
    }

    /// Ask every part to realign its engine cursor with the event cursor.
    pub fn request_resync(&self) {
        self.shared.buffer.request_resync_all();
    }

    /// Notes currently held by each voice of `part` (`None` = free voice).
    pub fn part_voices(&self, part: usize) -> Option<Vec<Option<u8>>> {
        self.shared.monitors.get(part).map(PartMonitor::snapshot)
    }

    pub fn active_voices(&self, part: usize) -> usize {
        self.shared.monitors.get(part).map_or(0, PartMonitor::allocated)
    }

    /// Periods rendered by `part` since the engine was built.
    pub fn rendered_periods(&self, part: usize) -> u64 {
        self.shared
            .monitors
            .get(part)
            .map_or(0, |monitor| monitor.periods.get())
    }

    /// Highest absolute sample delivered since the last call.
    pub fn take_output_peak(&self) -> f32 {
        self.shared.meter.take_peak()
    }

    /// Frames delivered to the audio driver since the engine was built.
    pub fn frames_played(&self) -> u64 {
        self.shared.meter.frames()
    }

    pub fn devices(&self, subsystem: Subsystem) -> Vec<DeviceInfo> {
        self.shared.registry.devices(subsystem)
    }

    /// Ask the watchdog to move `subsystem` onto the device called `name`.
    pub fn request_device(&self, subsystem: Subsystem, name: &str) -> bool {
        self.shared.registry.request_hotplug(subsystem, name)
    }

    /// Re-enumerate devices now instead of waiting for the watchdog.
    pub fn refresh_devices(&self) {
        self.runtime.lock().refresh_devices();
    }
}

impl Drop for SynthEngine {
    fn drop(&mut self) {
        self.stop();
    }
}
