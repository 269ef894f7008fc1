//! All counters use `Relaxed` ordering. Individual counter values are
//! eventually consistent. A [`MemoryStats`] snapshot may be transiently
//! inconsistent across counters (e.g. live objects may briefly disagree with
//! allocated bytes). This is acceptable for diagnostic display.
//! Do NOT use these values for allocation decisions.

use crate::sync::atomic::{AtomicIsize, Ordering};

/// Diagnostic-only gauge counter.
///
/// Under contention, subtract-before-add races are tolerated and the raw value
/// may transiently dip below zero. Readers should always use `load()`/`get()`,
/// which clamp negative values to zero.
#[derive(Debug)]
pub struct Counter(AtomicIsize);

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

impl Counter {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[inline]
    fn delta(val: u64) -> isize {
        // Diagnostic counters only: clamp absurd deltas instead of panicking.
        isize::try_from(val).unwrap_or(isize::MAX)
    }

    #[inline]
    pub fn add(&self, val: u64) {
        self.0.fetch_add(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, val: u64) {
        self.0.fetch_sub(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn incr(&self) {
        self.add(1);
    }

    #[inline]
    pub fn decr(&self) {
        self.sub(1);
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn load(&self, ordering: Ordering) -> u64 {
        self.0.load(ordering).max(0).cast_unsigned() as u64
    }
}

/// Live counters of one [`DeviceMemoryPool`](super::device_pool::DeviceMemoryPool).
#[derive(Debug, Default)]
pub(crate) struct PoolStats {
    /// Bytes currently held from the driver, live or cached.
    pub(crate) device_bytes: Counter,
    /// Native objects currently held from the driver.
    pub(crate) live_objects: Counter,
    /// Bytes sitting in recycle caches.
    pub(crate) recycled_bytes: Counter,
    pub(crate) driver_allocations: Counter,
    pub(crate) driver_frees: Counter,
    pub(crate) recycle_hits: Counter,
    /// Global and dedicated allocations handed out and not yet freed.
    pub(crate) direct_allocations: Counter,
}

impl PoolStats {
    pub(crate) fn snapshot(&self) -> MemoryStats {
        MemoryStats {
            device_bytes: self.device_bytes.get(),
            live_objects: self.live_objects.get(),
            recycled_bytes: self.recycled_bytes.get(),
            driver_allocations: self.driver_allocations.get(),
            driver_frees: self.driver_frees.get(),
            recycle_hits: self.recycle_hits.get(),
            direct_allocations: self.direct_allocations.get(),
        }
    }
}

/// Point-in-time copy of a pool's counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub device_bytes: u64,
    pub live_objects: u64,
    pub recycled_bytes: u64,
    pub driver_allocations: u64,
    pub driver_frees: u64,
    pub recycle_hits: u64,
    pub direct_allocations: u64,
}
