//! Counters for conditions the hot path must not log.
//!
//! The audio, event and synthesis threads only bump these; the watchdog
//! compares snapshots between polls and logs the deltas.

use crate::lockfree::AtomicCounter;

/// Lock-free diagnostic counters shared by every thread of an engine.
#[derive(Debug, Default)]
pub struct TimingStats {
    /// Sample offsets computed outside the current period (clamped).
    pub timing_violations: AtomicCounter,
    /// Events dropped because a slot and its overflow ring were full.
    pub dropped_events: AtomicCounter,
    /// Events a consumer found still being written when it drained.
    pub late_events: AtomicCounter,
    /// Hardware xruns reported by the audio driver.
    pub xruns: AtomicCounter,
    /// Periods the PLL classified far-late.
    pub far_late_periods: AtomicCounter,
    /// Subsystem restarts performed by the watchdog.
    pub restarts: AtomicCounter,
}

/// Point-in-time copy of [`TimingStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub timing_violations: u64,
    pub dropped_events: u64,
    pub late_events: u64,
    pub xruns: u64,
    pub far_late_periods: u64,
    pub restarts: u64,
}

impl TimingStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            timing_violations: self.timing_violations.get(),
            dropped_events: self.dropped_events.get(),
            late_events: self.late_events.get(),
            xruns: self.xruns.get(),
            far_late_periods: self.far_late_periods.get(),
            restarts: self.restarts.get(),
        }
    }
}

impl StatsSnapshot {
    /// Counts accumulated since `earlier`.
    pub fn since(&self, earlier: &StatsSnapshot) -> StatsSnapshot {
        StatsSnapshot {
            timing_violations: self.timing_violations.saturating_sub(earlier.timing_violations),
            dropped_events: self.dropped_events.saturating_sub(earlier.dropped_events),
            late_events: self.late_events.saturating_sub(earlier.late_events),
            xruns: self.xruns.saturating_sub(earlier.xruns),
            far_late_periods: self.far_late_periods.saturating_sub(earlier.far_late_periods),
            restarts: self.restarts.saturating_sub(earlier.restarts),
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == StatsSnapshot::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_delta() {
        let stats = TimingStats::new();
        stats.dropped_events.increment();
        let first = stats.snapshot();
        stats.dropped_events.increment();
        stats.xruns.increment();

        let delta = stats.snapshot().since(&first);
        assert_eq!(delta.dropped_events, 1);
        assert_eq!(delta.xruns, 1);
        assert_eq!(delta.timing_violations, 0);
        assert!(!delta.is_zero());
        assert!(stats.snapshot().since(&stats.snapshot()).is_zero());
    }
}
