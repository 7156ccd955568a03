//! Driver supervision.
//!
//! [`Runtime`] owns the audio driver, the event driver and the synthesis
//! threads, and knows the one order in which they may be torn down and
//! brought back up:
//!
//! 1. stop event input, stop audio, join the synthesis threads
//! 2. initialise the audio driver and take the format it negotiated
//! 3. resize the clocked buffer, reset the event queues and the PLL
//! 4. start the synthesis threads and wait until each one is ready
//! 5. start audio, then event input
//!
//! The watchdog thread polls driver status at a coarse interval and funnels
//! faults, format changes, hot-plug requests and stalls into that sequence.
//! Event input is restarted on its own; an audio restart that fails leaves
//! the audio driver in `Error` and is retried on the next poll. A restart
//! that fails with a fatal error (pool allocation) stops the engine instead,
//! and the error is held for the owner to collect.

use crate::callback::period_callback;
use crate::engine::EngineShared;
use crate::synthesis::SynthPool;
use crate::{Error, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use ostinato_core::StatsSnapshot;
use ostinato_io::{
    AudioDriver, AudioRequest, DriverFault, DriverState, DriverStatus, EventDriver, EventSink,
    RegistryChange, Subsystem, VirtualPort,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thread_priority::ThreadPriority;
use tracing::{debug, error, info, warn};

/// How long a synthesis thread may take to announce itself after a start.
const READY_TIMEOUT: Duration = Duration::from_secs(2);

/// Polls between device enumerations.
const REFRESH_EVERY: u64 = 8;

/// Minimum number of polls without an audio heartbeat before a restart.
const STALL_POLLS: u64 = 4;

/// Drivers and synthesis threads, guarded by the engine's runtime mutex.
pub(crate) struct Runtime {
    shared: Arc<EngineShared>,
    audio: Box<dyn AudioDriver>,
    events: Box<dyn EventDriver>,
    pool: SynthPool,
    audio_device: Option<String>,
    event_device: Option<String>,
    running: bool,
    fatal: Option<Error>,
}

impl Runtime {
    pub(crate) fn new(
        shared: Arc<EngineShared>,
        audio: Box<dyn AudioDriver>,
        events: Box<dyn EventDriver>,
        pool: SynthPool,
    ) -> Self {
        let audio_device = shared.config.audio.device.clone();
        let event_device = shared.config.events.device.clone();
        Self {
            shared,
            audio,
            events,
            pool,
            audio_device,
            event_device,
            running: false,
            fatal: None,
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running
    }

    /// The fatal error that stopped the engine from the watchdog, if any.
    pub(crate) fn take_fatal(&mut self) -> Option<Error> {
        self.fatal.take()
    }

    /// Act on the outcome of a supervised restart.
    fn settle(&mut self, result: Result<()>) {
        match result {
            Ok(()) => {}
            Err(e) if e.is_fatal() => {
                error!("Fatal error during restart, stopping engine: {}", e);
                self.stop();
                self.fatal = Some(e);
            }
            Err(e) => debug!("Restart incomplete, retrying on the next poll: {}", e),
        }
    }

    /// Bring every subsystem up. Event input failing to open is not fatal;
    /// the watchdog keeps retrying it.
    pub(crate) fn start(&mut self) -> Result<()> {
        if self.running {
            return Ok(());
        }
        self.fatal = None;
        self.refresh_devices();
        if let Err(e) = self.start_audio_path() {
            self.pool.stop();
            return Err(e);
        }
        if let Err(e) = self.start_events() {
            warn!("Event input unavailable, will retry: {}", e);
        }
        self.running = true;
        info!(
            "Engine started: {} part(s), audio '{}', events '{}'",
            self.shared.config.part_count(),
            self.audio.name(),
            self.events.name()
        );
        Ok(())
    }

    pub(crate) fn stop(&mut self) {
        if !self.running && !self.pool.is_running() {
            return;
        }
        self.events.stop();
        self.audio.stop();
        self.pool.stop();
        self.running = false;
        info!("Engine stopped");
    }

    /// Ordered restart of audio and synthesis. `device` replaces the audio
    /// device for this and every later restart.
    pub(crate) fn restart_audio(&mut self, device: Option<String>) -> Result<()> {
        if let Some(device) = device {
            self.audio_device = Some(device);
        }
        self.shared.stats.restarts.increment();

        self.events.stop();
        self.audio.stop();
        self.pool.stop();

        let result = self.start_audio_path();
        if let Err(e) = &result {
            error!("Audio restart failed: {}", e);
            self.audio.status().set_state(DriverState::Error);
        }
        if let Err(e) = self.start_events() {
            warn!("Event input unavailable after audio restart: {}", e);
        }
        result
    }

    /// Restart event input only. Audio and synthesis keep running.
    pub(crate) fn restart_events(&mut self, device: Option<String>) -> Result<()> {
        if let Some(device) = device {
            self.event_device = Some(device);
        }
        self.shared.stats.restarts.increment();
        self.events.stop();
        self.start_events()
    }

    fn start_audio_path(&mut self) -> Result<()> {
        let config = &self.shared.config;
        let request = AudioRequest {
            sample_rate: config.sample_rate,
            period_size: config.period_size,
            device: self.audio_device.clone(),
        };

        let format = match self.audio.init(&request) {
            Ok(format) => format,
            Err(e) => {
                self.audio.status().set_state(DriverState::Error);
                return Err(e.into());
            }
        };
        let geometry = self
            .shared
            .reset_timeline(format.sample_rate, format.period_size)?;
        debug!(
            "Timeline reset: {} Hz, {} x {} frames, latency {} frames",
            format.sample_rate, geometry.period_count, geometry.period_size, geometry.latency
        );

        self.pool.start(&self.shared)?;
        self.wait_ready()?;
        self.audio.start(period_callback(self.shared.clone()))?;
        info!(
            "Audio running on '{}' at {} Hz / {} frames",
            self.audio.device_name().unwrap_or_else(|| self.audio.name().to_string()),
            format.sample_rate,
            format.period_size
        );
        Ok(())
    }

    fn wait_ready(&self) -> Result<()> {
        for (part, monitor) in self.shared.monitors.iter().enumerate() {
            if !monitor.ready.wait_timeout(READY_TIMEOUT) {
                return Err(Error::ReadyTimeout(part));
            }
        }
        Ok(())
    }

    fn start_events(&mut self) -> Result<()> {
        let started = self
            .events
            .init(self.event_device.as_deref())
            .and_then(|()| {
                let sink: Arc<dyn EventSink> = self.shared.dispatcher.clone();
                self.events.start(sink)
            });
        if let Err(e) = started {
            self.events.status().set_state(DriverState::Error);
            return Err(e.into());
        }
        Ok(())
    }

    pub(crate) fn audio_status(&self) -> Arc<DriverStatus> {
        self.audio.status()
    }

    pub(crate) fn event_status(&self) -> Arc<DriverStatus> {
        self.events.status()
    }

    pub(crate) fn virtual_port(&self) -> Option<VirtualPort> {
        self.events.virtual_port()
    }

    /// Re-enumerate both subsystems into the shared registry.
    pub(crate) fn refresh_devices(&self) -> (RegistryChange, RegistryChange) {
        let registry = &self.shared.registry;
        let audio = match self.audio.list_devices() {
            Ok(names) => registry.refresh(Subsystem::Audio, &names),
            Err(e) => {
                debug!("Audio device enumeration failed: {}", e);
                RegistryChange::default()
            }
        };
        let events = match self.events.list_devices() {
            Ok(names) => registry.refresh(Subsystem::Event, &names),
            Err(e) => {
                debug!("Event device enumeration failed: {}", e);
                RegistryChange::default()
            }
        };
        (audio, events)
    }

    /// Deal with a fault the audio driver reported.
    fn recover_audio(&mut self, fault: DriverFault) {
        match self.audio.xrun_recovery(fault) {
            Ok(()) => {
                debug!("Recovered from {:?}; resyncing parts", fault);
                self.shared.stats.xruns.increment();
                self.shared.buffer.request_resync_all();
            }
            Err(e) => {
                warn!("Audio recovery from {:?} failed ({}); restarting", fault, e);
                let result = self.restart_audio(None);
                self.settle(result);
            }
        }
    }
}

enum WatchdogCommand {
    Shutdown,
}

/// Handle to the watchdog thread.
pub(crate) struct Watchdog {
    commands: Sender<WatchdogCommand>,
    thread: Option<JoinHandle<()>>,
}

impl Watchdog {
    pub(crate) fn spawn(shared: Arc<EngineShared>, runtime: Arc<Mutex<Runtime>>) -> Result<Self> {
        let (commands, receiver) = bounded(4);
        let interval = Duration::from_millis(shared.config.watchdog_interval_ms.max(1));
        let supervisor = Supervisor::new(shared, runtime, interval);

        let thread = thread::Builder::new()
            .name("ostinato-watchdog".into())
            .spawn(move || {
                let _ = thread_priority::set_current_thread_priority(ThreadPriority::Min);
                supervisor.run(receiver);
            })?;

        Ok(Self {
            commands,
            thread: Some(thread),
        })
    }

    pub(crate) fn shutdown(&mut self) {
        let _ = self.commands.send(WatchdogCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// State carried between polls on the watchdog thread.
struct Supervisor {
    shared: Arc<EngineShared>,
    runtime: Arc<Mutex<Runtime>>,
    interval: Duration,
    polls: u64,
    last_stats: StatsSnapshot,
    last_heartbeat: u64,
    silent_polls: u64,
}

impl Supervisor {
    fn new(shared: Arc<EngineShared>, runtime: Arc<Mutex<Runtime>>, interval: Duration) -> Self {
        let last_stats = shared.stats.snapshot();
        Self {
            shared,
            runtime,
            interval,
            polls: 0,
            last_stats,
            last_heartbeat: 0,
            silent_polls: 0,
        }
    }

    fn run(mut self, commands: Receiver<WatchdogCommand>) {
        debug!("Watchdog polling every {:?}", self.interval);
        loop {
            match commands.recv_timeout(self.interval) {
                Ok(WatchdogCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => self.poll(),
            }
        }
        debug!("Watchdog exiting");
    }

    fn poll(&mut self) {
        self.polls += 1;
        self.report_stats();

        let runtime = self.runtime.clone();
        let mut runtime = runtime.lock();
        if !runtime.is_running() {
            return;
        }

        self.supervise_audio(&mut runtime);
        if !runtime.is_running() {
            return;
        }
        self.supervise_events(&mut runtime);

        if runtime.pool.has_exited() {
            error!("A synthesis thread exited unexpectedly; restarting");
            self.restart_audio(&mut runtime, None);
        }
    }

    fn supervise_audio(&mut self, runtime: &mut Runtime) {
        let status = runtime.audio_status();

        if let Some((rate, period)) = status.take_format_change() {
            info!(
                "Audio format changed to {} Hz / {} frames; renegotiating",
                rate, period
            );
            status.take_fault();
            self.restart_audio(runtime, None);
            return;
        }

        if let Some(fault) = status.take_fault() {
            runtime.recover_audio(fault);
            self.silent_polls = 0;
            return;
        }

        if status.state() == DriverState::Error {
            self.restart_audio(runtime, None);
            return;
        }

        if let Some(device) = self.shared.registry.take_hotplug(Subsystem::Audio) {
            info!("Switching audio to '{}'", device.name);
            self.restart_audio(runtime, Some(device.name));
            return;
        }

        let heartbeat = status.heartbeat();
        if status.state() == DriverState::Active && heartbeat == self.last_heartbeat {
            self.silent_polls += 1;
        } else {
            self.silent_polls = 0;
        }
        self.last_heartbeat = heartbeat;
        if self.silent_polls >= self.stall_limit() {
            warn!(
                "No audio callback for {} polls; restarting audio",
                self.silent_polls
            );
            self.restart_audio(runtime, None);
        }
    }

    fn supervise_events(&mut self, runtime: &mut Runtime) {
        let status = runtime.event_status();

        if let Some(device) = self.shared.registry.take_hotplug(Subsystem::Event) {
            info!("Switching event input to '{}'", device.name);
            if let Err(e) = runtime.restart_events(Some(device.name)) {
                warn!("Event input restart failed: {}", e);
            }
            return;
        }

        if let Some(fault) = status.take_fault() {
            warn!("Event input reported {:?}; restarting it", fault);
            if let Err(e) = runtime.restart_events(None) {
                warn!("Event input restart failed: {}", e);
            }
            return;
        }

        if self.polls % REFRESH_EVERY != 0 {
            return;
        }
        let (audio, events) = runtime.refresh_devices();
        if !audio.is_empty() || !events.is_empty() {
            info!(
                "Devices changed: audio +{:?} -{:?}, events +{:?} -{:?}",
                audio.appeared, audio.vanished, events.appeared, events.vanished
            );
        }

        let lost = runtime
            .events
            .device_name()
            .is_some_and(|name| events.vanished.contains(&name));
        if lost || status.state() == DriverState::Error {
            if let Err(e) = runtime.restart_events(None) {
                debug!("Event input still unavailable: {}", e);
            }
        }
    }

    fn restart_audio(&mut self, runtime: &mut Runtime, device: Option<String>) {
        let result = runtime.restart_audio(device);
        runtime.settle(result);
        self.silent_polls = 0;
        self.last_heartbeat = runtime.audio_status().heartbeat();
    }

    /// Polls without a heartbeat that count as a stall: at least
    /// [`STALL_POLLS`], and never less than four periods.
    fn stall_limit(&self) -> u64 {
        let geometry = self.shared.buffer.geometry();
        let period = Duration::from_secs_f64(
            geometry.period_size as f64 / self.shared.sample_rate().max(1) as f64,
        );
        let periods = (period * 4).as_nanos() / self.interval.as_nanos().max(1);
        STALL_POLLS.max(periods as u64 + 1)
    }

    fn report_stats(&mut self) {
        let now = self.shared.stats.snapshot();
        let delta = now.since(&self.last_stats);
        self.last_stats = now;
        if delta.is_zero() {
            return;
        }
        if delta.dropped_events > 0 || delta.xruns > 0 || delta.restarts > 0 {
            warn!(
                "Timing: {} violations, {} dropped, {} late, {} xruns, {} far-late, {} restarts",
                delta.timing_violations,
                delta.dropped_events,
                delta.late_events,
                delta.xruns,
                delta.far_late_periods,
                delta.restarts
            );
        } else {
            debug!(
                "Timing: {} violations, {} late, {} far-late",
                delta.timing_violations, delta.late_events, delta.far_late_periods
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthesis::{basic_renderer_factory, PartEngine};
    use ostinato_core::EngineConfig;
    use ostinato_io::{create_audio_driver, create_event_driver};

    fn runtime() -> Runtime {
        let mut config = EngineConfig::default();
        config.threads.realtime = false;
        let shared = Arc::new(EngineShared::new(config).unwrap());
        let renderers = basic_renderer_factory();
        let parts = shared
            .config
            .parts
            .iter()
            .enumerate()
            .map(|(index, part)| {
                PartEngine::new(index, part, shared.sample_rate(), &renderers).unwrap()
            })
            .collect();
        let pool = SynthPool::new(parts, renderers);
        Runtime::new(
            shared,
            create_audio_driver("timer").unwrap(),
            create_event_driver("none").unwrap(),
            pool,
        )
    }

    #[test]
    fn test_failed_allocation_on_restart_stops_the_engine() {
        let mut runtime = runtime();
        runtime.start().unwrap();
        assert!(runtime.is_running());

        runtime.settle(Err(Error::Core(ostinato_core::Error::PoolAllocation {
            pool: "voices",
            entries: 4,
        })));
        assert!(!runtime.is_running());
        assert!(!runtime.pool.is_running());
        assert!(matches!(runtime.take_fatal(), Some(e) if e.is_fatal()));
        assert!(runtime.take_fatal().is_none());
    }

    #[test]
    fn test_recoverable_restart_failure_keeps_running() {
        let mut runtime = runtime();
        runtime.start().unwrap();

        runtime.settle(Err(Error::ReadyTimeout(0)));
        assert!(runtime.is_running());
        assert!(runtime.take_fatal().is_none());
        runtime.stop();
    }

    #[test]
    fn test_stopped_runtime_is_left_alone_by_polls() {
        let mut runtime = runtime();
        runtime.start().unwrap();
        let shared = runtime.shared.clone();
        runtime.settle(Err(Error::Core(ostinato_core::Error::PoolAllocation {
            pool: "voices",
            entries: 4,
        })));

        let runtime = Arc::new(Mutex::new(runtime));
        let mut supervisor =
            Supervisor::new(shared.clone(), runtime.clone(), Duration::from_millis(1));
        runtime.lock().audio_status().set_state(DriverState::Error);
        for _ in 0..3 {
            supervisor.poll();
        }
        assert_eq!(shared.stats.restarts.get(), 0);
        assert!(!runtime.lock().is_running());
    }
}
