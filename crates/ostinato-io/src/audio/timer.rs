//! Wall-clock audio driver.
//!
//! Calls the period callback from a plain thread paced by `Instant` deadlines
//! and discards the output. Runs the whole engine without hardware, which is
//! what the integration tests use.

use super::{AudioDriver, AudioRequest, PeriodCallback};
use crate::state::{AudioFormat, DriverFault, DriverState, DriverStatus};
use crate::{Error, Result};
use ostinato_core::AtomicFlag;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Default)]
pub struct TimerDriver {
    format: Option<AudioFormat>,
    status: Arc<DriverStatus>,
    stop: Arc<AtomicFlag>,
    thread: Option<JoinHandle<()>>,
}

impl TimerDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }

    fn run(
        format: AudioFormat,
        mut callback: PeriodCallback,
        status: Arc<DriverStatus>,
        stop: Arc<AtomicFlag>,
    ) {
        let period = Duration::from_secs_f64(format.period_size as f64 / format.sample_rate as f64);
        let mut buffer = vec![0.0f32; format.period_size * 2];
        let mut deadline = Instant::now() + period;

        while !stop.get() {
            let now = Instant::now();
            if now < deadline {
                thread::sleep(deadline - now);
            }

            // A whole period behind: the consumer missed it, re-anchor the clock.
            if Instant::now().saturating_duration_since(deadline) > period {
                status.record_fault(DriverFault::Underrun);
                deadline = Instant::now();
            }

            buffer.fill(0.0);
            callback(&mut buffer);
            status.beat();
            deadline += period;
        }
    }
}

impl AudioDriver for TimerDriver {
    fn name(&self) -> &'static str {
        "timer"
    }

    /// Honours the request unless a format was forced through the status.
    fn init(&mut self, request: &AudioRequest) -> Result<AudioFormat> {
        if self.thread.is_some() {
            return Err(Error::AlreadyRunning("timer"));
        }
        let (sample_rate, period_size) = self
            .status
            .forced_format()
            .unwrap_or((request.sample_rate, request.period_size));
        if sample_rate == 0 || period_size == 0 {
            return Err(Error::UnsupportedFormat(format!(
                "{} Hz / {} frames",
                sample_rate, period_size
            )));
        }

        let format = AudioFormat {
            sample_rate,
            period_size,
            channels: 2,
        };
        self.format = Some(format);
        self.status.set_state(DriverState::Stopped);
        Ok(format)
    }

    fn start(&mut self, callback: PeriodCallback) -> Result<()> {
        if self.thread.is_some() {
            return Err(Error::AlreadyRunning("timer"));
        }
        let format = self.format.ok_or(Error::NotInitialized("timer"))?;

        self.stop.set(false);
        let status = self.status.clone();
        let stop = self.stop.clone();
        let handle = thread::Builder::new()
            .name("ostinato-timer-audio".into())
            .spawn(move || Self::run(format, callback, status, stop))?;

        self.thread = Some(handle);
        self.status.set_state(DriverState::Active);
        debug!(
            "Timer audio driver started: {} Hz, {} frames",
            format.sample_rate, format.period_size
        );
        Ok(())
    }

    fn stop(&mut self) {
        self.stop.set(true);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
        if self.status.state() == DriverState::Active {
            self.status.set_state(DriverState::Stopped);
        }
    }

    /// The clock is re-anchored in place; there is nothing else to recover.
    fn xrun_recovery(&mut self, fault: DriverFault) -> Result<()> {
        match fault {
            DriverFault::Disconnected => Err(Error::DeviceLost("timer".to_string())),
            _ if self.thread.is_none() => Err(Error::NotInitialized("timer")),
            _ => Ok(()),
        }
    }

    fn status(&self) -> Arc<DriverStatus> {
        self.status.clone()
    }

    fn list_devices(&self) -> Result<Vec<String>> {
        Ok(vec!["timer".to_string()])
    }

    fn device_name(&self) -> Option<String> {
        self.format.map(|_| "timer".to_string())
    }
}

impl Drop for TimerDriver {
    fn drop(&mut self) {
        self.stop();
    }
}
