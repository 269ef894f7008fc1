//! Backing store stand-in for allocator unit and loom tests.

use super::allocation::{Allocation, AllocationKind};
use super::class_allocator::BackingStore;
use super::device::{DeviceError, DeviceMemoryHandle, ImageHandle};
use super::error::AllocError;
use crate::sync::{Mutex, lock};
use std::collections::HashMap;
use std::num::NonZeroU64;

#[derive(Default)]
struct FakeState {
    next: u64,
    live: HashMap<u64, u64>,
    allocations: usize,
    releases: usize,
    recycled: usize,
}

/// Hands out fake native objects with no host mapping. Counts calls and
/// refuses to go past `limit` live objects.
pub(crate) struct FakeStore {
    state: Mutex<FakeState>,
    limit: usize,
}

impl FakeStore {
    pub(crate) fn new() -> Self {
        Self::with_limit(usize::MAX)
    }

    pub(crate) fn with_limit(limit: usize) -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            limit,
        }
    }

    pub(crate) fn live_objects(&self) -> usize {
        lock(&self.state).live.len()
    }

    pub(crate) fn allocations(&self) -> usize {
        lock(&self.state).allocations
    }

    pub(crate) fn releases(&self) -> usize {
        lock(&self.state).releases
    }

    /// Releases that asked for recycling.
    pub(crate) fn recycled(&self) -> usize {
        lock(&self.state).recycled
    }

    fn create(
        &self,
        size: u64,
        memory_type: u32,
        kind: AllocationKind,
    ) -> Result<Allocation, AllocError> {
        let mut state = lock(&self.state);
        if state.live.len() >= self.limit {
            return Err(AllocError::OutOfDeviceMemory {
                size,
                memory_type,
                source: DeviceError::OutOfDeviceMemory,
            });
        }
        state.next += 1;
        let raw = state.next;
        state.live.insert(raw, size);
        state.allocations += 1;
        let Some(raw) = NonZeroU64::new(raw) else {
            unreachable!("handle counter starts at 1");
        };
        Ok(Allocation::whole(
            DeviceMemoryHandle::new(raw),
            None,
            size,
            memory_type,
            kind,
        ))
    }
}

impl BackingStore for FakeStore {
    fn allocate_backing(&self, size: u64, memory_type: u32) -> Result<Allocation, AllocError> {
        self.create(size, memory_type, AllocationKind::Global)
    }

    fn allocate_dedicated(
        &self,
        size: u64,
        memory_type: u32,
        _image: ImageHandle,
    ) -> Result<Allocation, AllocError> {
        self.create(size, memory_type, AllocationKind::Dedicated)
    }

    fn release_backing(&self, allocation: Allocation, recycle: bool) -> Result<(), AllocError> {
        let mut state = lock(&self.state);
        let raw = allocation.memory().raw();
        if state.live.remove(&raw).is_none() {
            return Err(AllocError::InvalidHandle(format!(
                "fake object {raw} is not live"
            )));
        }
        state.releases += 1;
        if recycle {
            state.recycled += 1;
        }
        Ok(())
    }
}
