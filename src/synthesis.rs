//! One synthesis thread per part.
//!
//! The thread waits for the event cursor to move a full period past its own
//! engine cursor, then renders that period one sample at a time: drain the
//! events of the sample slot, apply them to the voice allocator, render, write
//! into the part's output ring, advance the engine cursor.
//!
//! ```text
//!   WaitPeriodBoundary --period ready--> DrainEvents <--> RenderSample
//!          ^    |                                              |
//!          |    +--resync flag / geometry change--> Resync     |
//!          +------------------ period done --------------------+
//! ```
//!
//! A resync re-reads the geometry and sample rate and realigns the engine
//! cursor to the event cursor. It happens on start, on the per-part flag, on
//! an internal `Resync` event and when the part fell so far behind that its
//! output would land where the audio thread already read.

use crate::engine::EngineShared;
use crate::Result;
use ostinato_core::{
    AtomicFlag, BufferGeometry, Cursor, EventKind, PartConfig, SampleRateMode, SynthEvent,
    ThreadSettings,
};
use ostinato_synth::{BasicRenderer, VoiceAllocator, VoiceRenderer};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thread_priority::{ThreadPriority, ThreadPriorityValue};
use tracing::{debug, error};

/// Shortest idle sleep while waiting for a period boundary.
const MIN_SLEEP_NS: f64 = 50_000.0;

/// Builds the renderer of a part for a given effective sample rate.
pub type RendererFactory = Arc<dyn Fn(usize, f64) -> Box<dyn VoiceRenderer> + Send + Sync>;

pub(crate) fn basic_renderer_factory() -> RendererFactory {
    Arc::new(|_, sample_rate| Box::new(BasicRenderer::new(sample_rate)))
}

/// Everything a part's thread owns. Handed back when the thread is joined so
/// a restart reuses the same voice pool.
pub(crate) struct PartEngine {
    index: usize,
    mode: SampleRateMode,
    allocator: VoiceAllocator,
    renderer: Box<dyn VoiceRenderer>,
}

impl PartEngine {
    pub(crate) fn new(
        index: usize,
        config: &PartConfig,
        sample_rate: u32,
        renderers: &RendererFactory,
    ) -> Result<Self> {
        let allocator = VoiceAllocator::from_config(config, sample_rate)?;
        let renderer = renderers(index, config.sample_rate_mode.effective_rate(sample_rate));
        Ok(Self {
            index,
            mode: config.sample_rate_mode,
            allocator,
            renderer,
        })
    }
}

enum PartSlot {
    Idle(Box<PartEngine>),
    Running(JoinHandle<Box<PartEngine>>),
    /// The thread panicked; the part is rebuilt on the next start.
    Lost,
}

/// The synthesis threads of every part, with one shared stop flag.
pub(crate) struct SynthPool {
    slots: Vec<PartSlot>,
    stop: Arc<AtomicFlag>,
    renderers: RendererFactory,
}

impl SynthPool {
    pub(crate) fn new(parts: Vec<PartEngine>, renderers: RendererFactory) -> Self {
        Self {
            slots: parts
                .into_iter()
                .map(|part| PartSlot::Idle(Box::new(part)))
                .collect(),
            stop: Arc::new(AtomicFlag::new(false)),
            renderers,
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.slots
            .iter()
            .any(|slot| matches!(slot, PartSlot::Running(_)))
    }

    /// A running thread exited without being asked to.
    pub(crate) fn has_exited(&self) -> bool {
        self.slots
            .iter()
            .any(|slot| matches!(slot, PartSlot::Running(handle) if handle.is_finished()))
    }

    /// Spawn a thread for every idle part. Parts lost to a panic are rebuilt.
    pub(crate) fn start(&mut self, shared: &Arc<EngineShared>) -> Result<()> {
        self.stop.set(false);
        let threads = shared.config.threads.clone();

        for index in 0..self.slots.len() {
            let part = match std::mem::replace(&mut self.slots[index], PartSlot::Lost) {
                PartSlot::Idle(part) => part,
                PartSlot::Running(handle) => {
                    self.slots[index] = PartSlot::Running(handle);
                    continue;
                }
                PartSlot::Lost => Box::new(PartEngine::new(
                    index,
                    &shared.config.parts[index],
                    shared.sample_rate(),
                    &self.renderers,
                )?),
            };

            shared.monitors[index].ready.reset();
            let context = shared.clone();
            let stop = self.stop.clone();
            let threads = threads.clone();
            let handle = thread::Builder::new()
                .name(format!("ostinato-part-{}", index))
                .spawn(move || {
                    elevate_priority(&threads);
                    SynthesisThread::new(part, context, stop).run()
                })?;
            self.slots[index] = PartSlot::Running(handle);
        }
        Ok(())
    }

    /// Raise the stop flag and join every thread.
    pub(crate) fn stop(&mut self) {
        self.stop.set(true);
        for slot in self.slots.iter_mut() {
            if !matches!(slot, PartSlot::Running(_)) {
                continue;
            }
            if let PartSlot::Running(handle) = std::mem::replace(slot, PartSlot::Lost) {
                *slot = match handle.join() {
                    Ok(part) => PartSlot::Idle(part),
                    Err(_) => {
                        error!("Synthesis thread panicked; part will be rebuilt");
                        PartSlot::Lost
                    }
                };
            }
        }
    }
}

fn elevate_priority(threads: &ThreadSettings) {
    if !threads.realtime {
        return;
    }
    let priority = ThreadPriorityValue::try_from(threads.synth_priority)
        .map(ThreadPriority::Crossplatform)
        .unwrap_or(ThreadPriority::Max);
    if let Err(e) = thread_priority::set_current_thread_priority(priority) {
        debug!("Could not elevate synthesis thread priority: {:?}", e);
    }
}

enum PeriodOutcome {
    Rendered,
    Resync,
    Stopped,
}

/// Per-thread state. Geometry and rate are local copies taken at resync.
struct SynthesisThread {
    part: Box<PartEngine>,
    shared: Arc<EngineShared>,
    stop: Arc<AtomicFlag>,
    geometry: BufferGeometry,
    generation: u64,
    engine: usize,
    /// Last rendered sample, for undersample interpolation.
    previous: (f32, f32),
}

impl SynthesisThread {
    fn new(part: Box<PartEngine>, shared: Arc<EngineShared>, stop: Arc<AtomicFlag>) -> Self {
        let geometry = shared.buffer.geometry();
        Self {
            part,
            shared,
            stop,
            geometry,
            generation: 0,
            engine: 0,
            previous: (0.0, 0.0),
        }
    }

    fn run(mut self) -> Box<PartEngine> {
        let index = self.part.index;
        self.resync();
        self.shared.monitors[index].ready.announce();

        while !self.stop.get() {
            if self.shared.buffer.resync_flag(index).take()
                || self.shared.buffer.generation() != self.generation
            {
                self.resync();
                continue;
            }

            let shared = &self.shared;
            shared.pll.advance_event_index(&shared.buffer);
            let event = shared.buffer.read(Cursor::Event);
            let behind = self.geometry.distance(self.engine, event);

            if behind > self.geometry.latency {
                // Output for these periods would land behind the audio reader.
                shared.stats.timing_violations.increment();
                self.skip_to(event);
                continue;
            }

            if behind >= self.geometry.period_size {
                match self.render_period() {
                    PeriodOutcome::Rendered => self.publish(),
                    PeriodOutcome::Resync => self.resync(),
                    PeriodOutcome::Stopped => break,
                }
                continue;
            }

            thread::sleep(self.idle_sleep());
        }
        self.part
    }

    fn resync(&mut self) {
        let shared = &self.shared;
        self.shared.buffer.resync_flag(self.part.index).take();
        self.geometry = shared.buffer.geometry();
        self.generation = shared.buffer.generation();

        let rate = self.part.mode.effective_rate(shared.sample_rate());
        self.part.allocator.set_sample_rate(rate);
        self.part.renderer.prepare(rate);

        shared.pll.advance_event_index(&shared.buffer);
        self.engine = shared.buffer.read(Cursor::Event);
        shared.buffer.store(Cursor::Part(self.part.index), self.engine);
        self.previous = (0.0, 0.0);
    }

    /// Apply the events of every skipped slot without rendering, then realign.
    fn skip_to(&mut self, target: usize) {
        let mut resync = false;
        while self.engine != target {
            self.drain(self.engine, &mut resync);
            self.engine = self.geometry.add(self.engine, 1);
        }
        self.shared
            .buffer
            .store(Cursor::Part(self.part.index), self.engine);
    }

    /// Hand the events of `slot` to the allocator.
    #[inline]
    fn drain(&mut self, slot: usize, resync: &mut bool) {
        let index = self.part.index;
        let allocator = &mut self.part.allocator;
        let pll = &self.shared.pll;
        self.shared
            .queue
            .drain(index, slot, |event: SynthEvent, _| match event.kind {
                EventKind::Resync => *resync = true,
                EventKind::PhaseCorrection { frames } => {
                    pll.set_phase_lock_target(pll.phase_lock_target() + frames as f64)
                }
                kind => allocator.handle_event(&kind),
            });
    }

    #[inline]
    fn render_one(&mut self) -> (f32, f32) {
        let (voices, part, patch) = self.part.allocator.render_state();
        let sample = self.part.renderer.render_sample(voices, part, patch);
        self.part.allocator.tick();
        sample
    }

    #[inline]
    fn write(&mut self, left: f32, right: f32) {
        self.shared.rings[self.part.index].write(self.engine, left, right);
        self.engine = self
            .shared
            .buffer
            .advance(Cursor::Part(self.part.index), 1);
    }

    fn render_period(&mut self) -> PeriodOutcome {
        let mut resync = false;
        let mut frame = 0;

        while frame < self.geometry.period_size {
            if self.stop.get() {
                return PeriodOutcome::Stopped;
            }

            match self.part.mode {
                SampleRateMode::Normal => {
                    self.drain(self.engine, &mut resync);
                    let (left, right) = self.render_one();
                    self.write(left, right);
                    frame += 1;
                }
                SampleRateMode::Oversample => {
                    self.drain(self.engine, &mut resync);
                    let (l1, r1) = self.render_one();
                    let (l2, r2) = self.render_one();
                    self.write((l1 + l2) * 0.5, (r1 + r2) * 0.5);
                    frame += 1;
                }
                SampleRateMode::Undersample => {
                    self.drain(self.engine, &mut resync);
                    self.drain(self.geometry.add(self.engine, 1), &mut resync);
                    let (left, right) = self.render_one();
                    let (prev_left, prev_right) = self.previous;
                    self.write((prev_left + left) * 0.5, (prev_right + right) * 0.5);
                    self.write(left, right);
                    self.previous = (left, right);
                    frame += 2;
                }
            }

            if resync {
                return PeriodOutcome::Resync;
            }
        }
        PeriodOutcome::Rendered
    }

    fn publish(&self) {
        let voices = self
            .part
            .allocator
            .voices()
            .iter()
            .map(|voice| (voice.allocated, voice.note));
        self.shared.monitors[self.part.index].publish(voices);
    }

    /// Sleep toward the next period boundary, never longer than one period.
    fn idle_sleep(&self) -> Duration {
        let pll = &self.shared.pll;
        let nominal = pll.nominal_period_ns();
        let until = if pll.is_started() {
            pll.ns_until_next_period(pll.now_ns())
        } else {
            nominal
        };
        Duration::from_nanos(until.clamp(MIN_SLEEP_NS, nominal.max(MIN_SLEEP_NS)) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ostinato_core::{EngineConfig, KeyMode};

    fn shared(mode: SampleRateMode) -> Arc<EngineShared> {
        let config = EngineConfig {
            parts: vec![PartConfig {
                polyphony: 4,
                keymode: KeyMode::Poly,
                sample_rate_mode: mode,
                ..Default::default()
            }],
            ..Default::default()
        };
        Arc::new(EngineShared::new(config).unwrap())
    }

    fn thread(shared: &Arc<EngineShared>) -> SynthesisThread {
        let part = PartEngine::new(
            0,
            &shared.config.parts[0],
            shared.sample_rate(),
            &basic_renderer_factory(),
        )
        .unwrap();
        let mut thread =
            SynthesisThread::new(Box::new(part), shared.clone(), Arc::new(AtomicFlag::new(false)));
        thread.resync();
        thread
    }

    #[test]
    fn test_render_period_advances_engine_cursor() {
        let shared = shared(SampleRateMode::Normal);
        let mut thread = thread(&shared);
        let start = thread.engine;
        assert!(matches!(thread.render_period(), PeriodOutcome::Rendered));
        assert_eq!(thread.engine, thread.geometry.add(start, 256));
        assert_eq!(shared.buffer.read(Cursor::Part(0)), thread.engine);
    }

    #[test]
    fn test_event_applied_at_its_slot() {
        let shared = shared(SampleRateMode::Normal);
        let mut thread = thread(&shared);
        let base = thread.engine;
        assert!(shared.queue.enqueue(0, SynthEvent::note_on(0, 60, 100), 100, base));

        thread.render_period();
        let voice = &thread.part.allocator.voices()[0];
        assert!(voice.allocated);
        assert_eq!(voice.note, 60);
        // Allocated at frame 100, ticked for the remaining 156 frames.
        assert_eq!(voice.age, 156);
    }

    #[test]
    fn test_undersample_drains_both_slots_of_a_pair() {
        let shared = shared(SampleRateMode::Undersample);
        let mut thread = thread(&shared);
        let base = thread.engine;
        assert!(shared.queue.enqueue(0, SynthEvent::note_on(0, 60, 100), 1, base));

        thread.render_period();
        // The odd slot is applied before the pair renders: 128 renders in total.
        assert_eq!(thread.part.allocator.voices()[0].age, 128);
        assert!(!shared.queue.is_occupied(0, base + 1));
    }

    #[test]
    fn test_oversample_ticks_twice_per_frame() {
        let shared = shared(SampleRateMode::Oversample);
        let mut thread = thread(&shared);
        let base = thread.engine;
        assert!(shared.queue.enqueue(0, SynthEvent::note_on(0, 60, 100), 0, base));
        thread.render_period();
        assert_eq!(thread.part.allocator.voices()[0].age, 512);
    }

    #[test]
    fn test_internal_resync_event_interrupts_period() {
        let shared = shared(SampleRateMode::Normal);
        let mut thread = thread(&shared);
        let base = thread.engine;
        assert!(shared
            .queue
            .enqueue(0, SynthEvent::new(0, EventKind::Resync), 10, base));
        assert!(matches!(thread.render_period(), PeriodOutcome::Resync));
        assert_eq!(thread.engine, thread.geometry.add(base, 11));
    }

    #[test]
    fn test_stop_flag_checked_per_sample() {
        let shared = shared(SampleRateMode::Normal);
        let mut thread = thread(&shared);
        thread.stop.set(true);
        let start = thread.engine;
        assert!(matches!(thread.render_period(), PeriodOutcome::Stopped));
        assert_eq!(thread.engine, start);
    }

    #[test]
    fn test_skip_applies_events_without_rendering() {
        let shared = shared(SampleRateMode::Normal);
        let mut thread = thread(&shared);
        let base = thread.engine;
        shared.queue.enqueue(0, SynthEvent::note_on(0, 64, 90), 3, base);
        shared.queue.enqueue(0, SynthEvent::note_off(0, 64), 700, base);

        let target = thread.geometry.add(base, 768);
        thread.skip_to(target);
        assert_eq!(thread.engine, target);
        assert!(!thread.part.allocator.voices()[0].active);
        assert_eq!(shared.buffer.read(Cursor::Part(0)), target);
    }
}
