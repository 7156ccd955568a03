//! Shared scalar state for the real-time threads.
//!
//! Every wrapper sits alone on a 64-byte line. Loads are `Acquire` and
//! stores `Release`, except the statistics counter, which is only ever read
//! for reporting and uses `Relaxed` throughout.

use atomic_float::{AtomicF32, AtomicF64};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

macro_rules! padded_float {
    ($(#[$doc:meta])* $name:ident, $atomic:ty, $scalar:ty) => {
        $(#[$doc])*
        #[derive(Debug, Default)]
        #[repr(align(64))]
        pub struct $name($atomic);

        impl $name {
            pub fn new(value: $scalar) -> Self {
                Self(<$atomic>::new(value))
            }

            #[inline]
            pub fn get(&self) -> $scalar {
                self.0.load(Ordering::Acquire)
            }

            #[inline]
            pub fn set(&self, value: $scalar) {
                self.0.store(value, Ordering::Release);
            }

            /// Store `value` and return what was there.
            #[inline]
            pub fn replace(&self, value: $scalar) -> $scalar {
                self.0.swap(value, Ordering::AcqRel)
            }

            /// Raise the stored value to at least `value`.
            #[inline]
            pub fn raise_to(&self, value: $scalar) {
                self.0.fetch_max(value, Ordering::AcqRel);
            }
        }
    };
}

padded_float!(
    /// Output peaks and other single-precision meters.
    AtomicFloat,
    AtomicF32,
    f32
);

padded_float!(
    /// Clock quantities in nanoseconds: period estimates, frame length,
    /// phase targets.
    AtomicDouble,
    AtomicF64,
    f64
);

/// Request flag polled at a safe point: stop, resync, format change, hot-plug.
#[derive(Debug, Default)]
#[repr(align(64))]
pub struct AtomicFlag(AtomicBool);

impl AtomicFlag {
    pub fn new(raised: bool) -> Self {
        Self(AtomicBool::new(raised))
    }

    #[inline]
    pub fn get(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set(&self, raised: bool) {
        self.0.store(raised, Ordering::Release);
    }

    #[inline]
    pub fn swap(&self, raised: bool) -> bool {
        self.0.swap(raised, Ordering::AcqRel)
    }

    /// Lower the flag, reporting whether it had been raised.
    #[inline]
    pub fn take(&self) -> bool {
        self.swap(false)
    }
}

/// Event counter for timing statistics.
#[derive(Debug, Default)]
#[repr(align(64))]
pub struct AtomicCounter(AtomicU64);

impl AtomicCounter {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_raise_to_keeps_the_maximum() {
        let peak = AtomicFloat::default();
        peak.raise_to(0.25);
        peak.raise_to(0.125);
        assert_eq!(peak.get(), 0.25);
        assert_eq!(peak.replace(0.0), 0.25);
        assert_eq!(peak.get(), 0.0);
    }

    #[test]
    fn test_flag_take_lowers_once() {
        let flag = AtomicFlag::new(true);
        assert!(flag.take());
        assert!(!flag.take());
        assert!(!flag.swap(true));
        assert!(flag.get());
    }

    #[test]
    fn test_counter_across_threads() {
        let counter = Arc::new(AtomicCounter::new());
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let counter = counter.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        counter.increment();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(counter.get(), 4000);
    }

    #[test]
    fn test_wrappers_own_a_cache_line() {
        assert_eq!(std::mem::align_of::<AtomicFlag>(), 64);
        assert_eq!(std::mem::align_of::<AtomicDouble>(), 64);
        assert_eq!(AtomicDouble::new(1.5).get(), 1.5);
    }
}
