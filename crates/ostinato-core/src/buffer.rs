//! Shared circular-buffer geometry, cursors and per-part output rings.
//!
//! Three kinds of cursor walk the same power-of-two ring:
//!
//! - the audio cursor, advanced by the audio thread as hardware frames move
//! - the event cursor, advanced once per hardware period by whichever thread
//!   consumes the period trigger first
//! - one engine cursor per part, advanced sample by sample by its synthesis
//!   thread
//!
//! Index arithmetic is always `(index + n) & (total_size - 1)`. Nothing in
//! here blocks or allocates after construction.

use crate::lockfree::AtomicFlag;
use crate::{Error, Result};
use atomic_float::AtomicF32;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Ring geometry. Copied into thread-local state at resync points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferGeometry {
    pub period_size: usize,
    pub period_count: usize,
    pub total_size: usize,
    pub mask: usize,
    pub period_mask: usize,
    /// Audio reader lag in frames.
    pub latency: usize,
}

impl BufferGeometry {
    pub fn new(period_size: usize, period_count: usize, latency_periods: usize) -> Result<Self> {
        let valid = period_size.is_power_of_two()
            && period_count.is_power_of_two()
            && period_count >= 2
            && latency_periods >= 1
            && latency_periods < period_count;
        if !valid {
            return Err(Error::InvalidGeometry {
                period_size,
                period_count,
            });
        }

        let total_size = period_size * period_count;
        let mask = total_size - 1;
        Ok(Self {
            period_size,
            period_count,
            total_size,
            mask,
            period_mask: mask & !(period_size - 1),
            latency: period_size * latency_periods,
        })
    }

    #[inline]
    pub fn wrap(&self, index: usize) -> usize {
        index & self.mask
    }

    #[inline]
    pub fn add(&self, index: usize, n: usize) -> usize {
        (index + n) & self.mask
    }

    #[inline]
    pub fn sub(&self, index: usize, n: usize) -> usize {
        index.wrapping_sub(n) & self.mask
    }

    /// First frame of the period containing `index`.
    #[inline]
    pub fn period_start(&self, index: usize) -> usize {
        index & self.period_mask
    }

    /// Forward distance from `from` to `to` around the ring.
    #[inline]
    pub fn distance(&self, from: usize, to: usize) -> usize {
        to.wrapping_sub(from) & self.mask
    }
}

/// Which shared cursor an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cursor {
    Audio,
    Event,
    Part(usize),
}

#[derive(Debug, Default)]
#[repr(align(64))]
struct CursorCell {
    index: AtomicUsize,
}

/// Shared ring geometry plus the audio, event and per-part cursors.
#[derive(Debug)]
pub struct ClockedBuffer {
    period_size: AtomicUsize,
    period_count: AtomicUsize,
    latency: AtomicUsize,
    mask: AtomicUsize,
    capacity: usize,
    generation: AtomicU64,
    audio: CursorCell,
    event: CursorCell,
    parts: Box<[CursorCell]>,
    resync: Box<[AtomicFlag]>,
}

impl ClockedBuffer {
    /// Create a buffer able to hold up to `capacity` frames per ring.
    pub fn new(geometry: BufferGeometry, capacity: usize, part_count: usize) -> Result<Self> {
        if geometry.total_size > capacity {
            return Err(Error::CapacityExceeded {
                requested: geometry.total_size,
                capacity,
            });
        }

        let buffer = Self {
            period_size: AtomicUsize::new(geometry.period_size),
            period_count: AtomicUsize::new(geometry.period_count),
            latency: AtomicUsize::new(geometry.latency),
            mask: AtomicUsize::new(geometry.mask),
            capacity,
            generation: AtomicU64::new(0),
            audio: CursorCell::default(),
            event: CursorCell::default(),
            parts: (0..part_count).map(|_| CursorCell::default()).collect(),
            resync: (0..part_count).map(|_| AtomicFlag::new(true)).collect(),
        };
        buffer.reset_cursors(&geometry);
        Ok(buffer)
    }

    pub fn part_count(&self) -> usize {
        self.parts.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current geometry. Only meaningful to cache between resync points.
    pub fn geometry(&self) -> BufferGeometry {
        let period_size = self.period_size.load(Ordering::Acquire);
        let period_count = self.period_count.load(Ordering::Acquire);
        let total_size = period_size * period_count;
        let mask = total_size - 1;
        BufferGeometry {
            period_size,
            period_count,
            total_size,
            mask,
            period_mask: mask & !(period_size - 1),
            latency: self.latency.load(Ordering::Acquire),
        }
    }

    /// Bumped on every resize so cached geometry can be detected as stale.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    #[inline]
    fn cell(&self, cursor: Cursor) -> &AtomicUsize {
        match cursor {
            Cursor::Audio => &self.audio.index,
            Cursor::Event => &self.event.index,
            Cursor::Part(part) => &self.parts[part].index,
        }
    }

    #[inline]
    pub fn read(&self, cursor: Cursor) -> usize {
        self.cell(cursor).load(Ordering::Acquire)
    }

    /// Advance a cursor by `n` frames and return the new index.
    #[inline]
    pub fn advance(&self, cursor: Cursor, n: usize) -> usize {
        let mask = self.mask.load(Ordering::Acquire);
        let previous = self
            .cell(cursor)
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |index| {
                Some((index + n) & mask)
            })
            .unwrap_or_else(|index| index);
        (previous + n) & mask
    }

    /// Move a cursor to an absolute position (used when a part realigns).
    #[inline]
    pub fn store(&self, cursor: Cursor, index: usize) {
        let mask = self.mask.load(Ordering::Acquire);
        self.cell(cursor).store(index & mask, Ordering::Release);
    }

    /// Install new geometry and reset every cursor.
    ///
    /// Only valid while the audio, event and synthesis threads are quiesced.
    /// Every part gets its resync flag raised so it re-derives its state.
    pub fn resize(
        &self,
        period_size: usize,
        period_count: usize,
        latency_periods: usize,
    ) -> Result<BufferGeometry> {
        let geometry = BufferGeometry::new(period_size, period_count, latency_periods)?;
        if geometry.total_size > self.capacity {
            return Err(Error::CapacityExceeded {
                requested: geometry.total_size,
                capacity: self.capacity,
            });
        }

        self.period_size.store(period_size, Ordering::Release);
        self.period_count.store(period_count, Ordering::Release);
        self.latency.store(geometry.latency, Ordering::Release);
        self.mask.store(geometry.mask, Ordering::Release);
        self.reset_cursors(&geometry);
        self.generation.fetch_add(1, Ordering::AcqRel);
        Ok(geometry)
    }

    fn reset_cursors(&self, geometry: &BufferGeometry) {
        self.audio.index.store(
            geometry.sub(geometry.total_size, geometry.latency),
            Ordering::Release,
        );
        self.event.index.store(0, Ordering::Release);
        for part in self.parts.iter() {
            part.index.store(0, Ordering::Release);
        }
        self.request_resync_all();
    }

    /// Per-part resync request flag.
    pub fn resync_flag(&self, part: usize) -> &AtomicFlag {
        &self.resync[part]
    }

    pub fn request_resync_all(&self) {
        for flag in self.resync.iter() {
            flag.set(true);
        }
    }
}

/// Stereo output ring for one part.
///
/// The owning synthesis thread writes at its engine cursor; the audio thread
/// reads at the audio cursor, which trails by the configured latency.
#[derive(Debug)]
pub struct OutputRing {
    left: Box<[AtomicF32]>,
    right: Box<[AtomicF32]>,
}

impl OutputRing {
    pub fn new(capacity: usize) -> Result<Self> {
        Ok(Self {
            left: allocate_samples(capacity)?,
            right: allocate_samples(capacity)?,
        })
    }

    pub fn capacity(&self) -> usize {
        self.left.len()
    }

    #[inline]
    pub fn write(&self, index: usize, left: f32, right: f32) {
        self.left[index].store(left, Ordering::Relaxed);
        self.right[index].store(right, Ordering::Relaxed);
    }

    #[inline]
    pub fn read(&self, index: usize) -> (f32, f32) {
        (
            self.left[index].load(Ordering::Relaxed),
            self.right[index].load(Ordering::Relaxed),
        )
    }

    pub fn clear(&self) {
        for (left, right) in self.left.iter().zip(self.right.iter()) {
            left.store(0.0, Ordering::Relaxed);
            right.store(0.0, Ordering::Relaxed);
        }
    }
}

fn allocate_samples(capacity: usize) -> Result<Box<[AtomicF32]>> {
    let mut samples = Vec::new();
    samples
        .try_reserve_exact(capacity)
        .map_err(|_| Error::PoolAllocation {
            pool: "output ring",
            entries: capacity,
        })?;
    samples.extend((0..capacity).map(|_| AtomicF32::new(0.0)));
    Ok(samples.into_boxed_slice())
}
