//! Driver lifecycle state shared between driver threads and the watchdog.
//!
//! Driver threads only ever touch atomics here: they report faults and
//! heartbeats, and the watchdog polls and acts on them.

use ostinato_core::{AtomicCounter, AtomicFlag};
use std::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};

/// Lifecycle of an audio or event driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum DriverState {
    /// Never initialised, or the `none` driver.
    #[default]
    None = 0,
    Active = 1,
    Stopped = 2,
    Error = 3,
}

impl DriverState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => DriverState::Active,
            2 => DriverState::Stopped,
            3 => DriverState::Error,
            _ => DriverState::None,
        }
    }
}

/// Hardware-side fault reported by a driver thread.
///
/// Ordered by severity: a pending fault is only ever replaced by a worse one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum DriverFault {
    Underrun = 1,
    Overrun = 2,
    Suspended = 3,
    Disconnected = 4,
}

impl DriverFault {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(DriverFault::Underrun),
            2 => Some(DriverFault::Overrun),
            3 => Some(DriverFault::Suspended),
            4 => Some(DriverFault::Disconnected),
            _ => None,
        }
    }

    /// Transient faults the driver can recover from without a restart.
    pub fn is_xrun(self) -> bool {
        matches!(self, DriverFault::Underrun | DriverFault::Overrun)
    }
}

/// Format the hardware actually runs at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub period_size: usize,
    pub channels: u16,
}

#[derive(Debug, Default)]
pub struct DriverStatus {
    state: AtomicU8,
    fault: AtomicU8,
    /// Callbacks or messages delivered since creation.
    heartbeat: AtomicCounter,
    pub xruns: AtomicCounter,
    format_changed: AtomicFlag,
    forced_rate: AtomicU32,
    forced_period: AtomicUsize,
}

impl DriverStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> DriverState {
        DriverState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: DriverState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Record a fault from a driver thread. Never blocks.
    pub fn record_fault(&self, fault: DriverFault) {
        if fault.is_xrun() {
            self.xruns.increment();
        }
        self.fault.fetch_max(fault as u8, Ordering::AcqRel);
    }

    /// Take the worst fault reported since the last call.
    pub fn take_fault(&self) -> Option<DriverFault> {
        DriverFault::from_u8(self.fault.swap(0, Ordering::AcqRel))
    }

    #[inline]
    pub fn beat(&self) {
        self.heartbeat.increment();
    }

    pub fn heartbeat(&self) -> u64 {
        self.heartbeat.get()
    }

    /// Hardware forced a new sample rate or period size.
    pub fn announce_format(&self, sample_rate: u32, period_size: usize) {
        self.forced_rate.store(sample_rate, Ordering::Release);
        self.forced_period.store(period_size, Ordering::Release);
        self.format_changed.set(true);
    }

    /// Whether a renegotiation is pending. Does not consume it.
    pub fn format_changed(&self) -> bool {
        self.format_changed.get()
    }

    /// Consume a pending renegotiation, returning the forced rate and period.
    pub fn take_format_change(&self) -> Option<(u32, usize)> {
        self.format_changed.take().then(|| {
            (
                self.forced_rate.load(Ordering::Acquire),
                self.forced_period.load(Ordering::Acquire),
            )
        })
    }

    /// Forced rate and period, if the hardware ever announced one.
    pub fn forced_format(&self) -> Option<(u32, usize)> {
        let rate = self.forced_rate.load(Ordering::Acquire);
        let period = self.forced_period.load(Ordering::Acquire);
        (rate != 0 && period != 0).then_some((rate, period))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worst_fault_wins() {
        let status = DriverStatus::new();
        status.record_fault(DriverFault::Suspended);
        status.record_fault(DriverFault::Underrun);
        assert_eq!(status.take_fault(), Some(DriverFault::Suspended));
        assert_eq!(status.take_fault(), None);
        assert_eq!(status.xruns.get(), 1);
    }

    #[test]
    fn test_format_change_consumed_once() {
        let status = DriverStatus::new();
        assert_eq!(status.forced_format(), None);
        status.announce_format(44100, 512);
        assert!(status.format_changed());
        assert_eq!(status.take_format_change(), Some((44100, 512)));
        assert_eq!(status.take_format_change(), None);
        assert_eq!(status.forced_format(), Some((44100, 512)));
    }

    #[test]
    fn test_state_roundtrip() {
        let status = DriverStatus::new();
        assert_eq!(status.state(), DriverState::None);
        status.set_state(DriverState::Error);
        assert_eq!(status.state(), DriverState::Error);
    }
}
