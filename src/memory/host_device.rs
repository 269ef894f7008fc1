//! Software [`DeviceMemory`] implementation backed by plain host memory.
//!
//! Every native object is its own VM reservation, committed up front and
//! faulted in lazily by the OS. Heap budgets are enforced, so running a heap
//! dry behaves like a real driver returning out-of-device-memory.

use super::device::{
    DeviceError, DeviceMemory, DeviceMemoryHandle, ImageHandle, MemoryHeap, MemoryProperties,
    MemoryPropertyFlags, MemoryRequirements, MemoryType,
};
use super::stats::Counter;
use super::vm::{PlatformVmOps, VmOps};
use crate::sync::{Mutex, lock};
use std::collections::HashMap;
use std::num::NonZeroU64;
use std::ptr::NonNull;

const MIB: u64 = 1024 * 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostDeviceConfig {
    pub memory_heaps: Vec<MemoryHeap>,
    pub memory_types: Vec<MemoryType>,
    pub non_coherent_atom_size: u64,
}

impl Default for HostDeviceConfig {
    /// A discrete-GPU-like layout: a device-local heap and a host heap, with
    /// coherent and cached (non-coherent) upload types.
    fn default() -> Self {
        Self {
            memory_heaps: vec![MemoryHeap { size: 1024 * MIB }, MemoryHeap { size: 512 * MIB }],
            memory_types: vec![
                MemoryType {
                    heap_index: 0,
                    property_flags: MemoryPropertyFlags::DEVICE_LOCAL,
                },
                MemoryType {
                    heap_index: 1,
                    property_flags: MemoryPropertyFlags::HOST_VISIBLE
                        | MemoryPropertyFlags::HOST_COHERENT,
                },
                MemoryType {
                    heap_index: 1,
                    property_flags: MemoryPropertyFlags::HOST_VISIBLE
                        | MemoryPropertyFlags::HOST_CACHED,
                },
                MemoryType {
                    heap_index: 0,
                    property_flags: MemoryPropertyFlags::DEVICE_LOCAL
                        | MemoryPropertyFlags::HOST_VISIBLE
                        | MemoryPropertyFlags::HOST_COHERENT,
                },
            ],
            non_coherent_atom_size: 64,
        }
    }
}

#[derive(Debug)]
struct HostObject {
    base: NonNull<u8>,
    reserved: usize,
    size: u64,
    memory_type: u32,
    heap: usize,
    mapped: bool,
}

#[derive(Debug)]
struct HostState {
    objects: HashMap<u64, HostObject>,
    heap_usage: Vec<u64>,
    images: HashMap<u64, MemoryRequirements>,
    next_image: u64,
}

// Safety: HostState exclusively owns every reservation it points to and is
// only reached through the device mutex.
unsafe impl Send for HostState {}

#[derive(Debug, Default)]
struct HostCounters {
    allocate_calls: Counter,
    free_calls: Counter,
    map_calls: Counter,
    unmap_calls: Counter,
    invalidate_calls: Counter,
    flush_calls: Counter,
}

/// Call counts and live objects of a [`HostDevice`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HostDeviceStats {
    pub allocate_calls: u64,
    pub free_calls: u64,
    pub map_calls: u64,
    pub unmap_calls: u64,
    pub invalidate_calls: u64,
    pub flush_calls: u64,
    pub live_objects: usize,
}

#[derive(Debug)]
pub struct HostDevice {
    properties: MemoryProperties,
    state: Mutex<HostState>,
    counters: HostCounters,
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new(HostDeviceConfig::default())
    }
}

impl HostDevice {
    #[must_use]
    pub fn new(config: HostDeviceConfig) -> Self {
        let heap_count = config.memory_heaps.len();
        Self {
            properties: MemoryProperties {
                memory_types: config.memory_types,
                memory_heaps: config.memory_heaps,
                non_coherent_atom_size: config.non_coherent_atom_size,
            },
            state: Mutex::new(HostState {
                objects: HashMap::new(),
                heap_usage: vec![0; heap_count],
                images: HashMap::new(),
                next_image: 0,
            }),
            counters: HostCounters::default(),
        }
    }

    /// Register an image whose memory requirements queries will return
    /// `requirements`.
    pub fn create_image(&self, requirements: MemoryRequirements) -> ImageHandle {
        let mut state = lock(&self.state);
        state.next_image += 1;
        let raw = state.next_image;
        state.images.insert(raw, requirements);
        match NonZeroU64::new(raw) {
            Some(raw) => ImageHandle::new(raw),
            None => unreachable!("image counter starts at 1"),
        }
    }

    pub fn destroy_image(&self, image: ImageHandle) {
        if lock(&self.state).images.remove(&image.raw()).is_none() {
            log::warn!("destroy of unknown image {:#x}", image.raw());
        }
    }

    /// Bytes currently allocated from `heap`.
    #[must_use]
    pub fn heap_usage(&self, heap: usize) -> u64 {
        lock(&self.state).heap_usage.get(heap).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn object_size(&self, memory: DeviceMemoryHandle) -> Option<u64> {
        lock(&self.state).objects.get(&memory.raw()).map(|o| o.size)
    }

    #[must_use]
    pub fn stats(&self) -> HostDeviceStats {
        HostDeviceStats {
            allocate_calls: self.counters.allocate_calls.get(),
            free_calls: self.counters.free_calls.get(),
            map_calls: self.counters.map_calls.get(),
            unmap_calls: self.counters.unmap_calls.get(),
            invalidate_calls: self.counters.invalidate_calls.get(),
            flush_calls: self.counters.flush_calls.get(),
            live_objects: lock(&self.state).objects.len(),
        }
    }

    fn release(object: &HostObject) {
        // Safety: the mapping is owned by `object`, which has been removed
        // from the object table.
        if let Err(e) = unsafe { PlatformVmOps::unmap(object.base, object.reserved) } {
            log::warn!("releasing host memory object at {:p}: {e}", object.base);
        }
    }

    /// Check `offset..offset + size` lies within `memory` and respects the
    /// atom size.
    fn check_range(
        &self,
        memory: DeviceMemoryHandle,
        offset: u64,
        size: u64,
    ) -> Result<(), DeviceError> {
        let state = lock(&self.state);
        let object = state
            .objects
            .get(&memory.raw())
            .ok_or(DeviceError::UnknownHandle(memory.raw()))?;
        let atom = self.properties.non_coherent_atom_size.max(1);
        let end = offset.checked_add(size);
        let valid = object.mapped
            && offset % atom == 0
            && end.is_some_and(|end| end <= object.size && (size % atom == 0 || end == object.size));
        if valid {
            Ok(())
        } else {
            Err(DeviceError::InvalidRange {
                memory: memory.raw(),
                offset,
                size,
            })
        }
    }
}

impl DeviceMemory for HostDevice {
    fn memory_properties(&self) -> MemoryProperties {
        self.properties.clone()
    }

    fn allocate_memory(
        &self,
        size: u64,
        memory_type: u32,
        dedicated_image: Option<ImageHandle>,
    ) -> Result<DeviceMemoryHandle, DeviceError> {
        self.counters.allocate_calls.incr();
        let ty = self
            .properties
            .memory_type(memory_type)
            .ok_or(DeviceError::InvalidMemoryType(memory_type))?;
        let heap = ty.heap_index as usize;
        let budget = self.properties.memory_heaps.get(heap).map_or(0, |h| h.size);
        let reserved = usize::try_from(size)
            .ok()
            .and_then(|s| s.checked_next_multiple_of(PlatformVmOps::page_size()))
            .ok_or(DeviceError::OutOfHostMemory)?;

        {
            let mut state = lock(&self.state);
            if let Some(image) = dedicated_image {
                if !state.images.contains_key(&image.raw()) {
                    return Err(DeviceError::UnknownHandle(image.raw()));
                }
            }
            let Some(usage) = state.heap_usage.get_mut(heap) else {
                return Err(DeviceError::InvalidMemoryType(memory_type));
            };
            if size.checked_add(*usage).is_none_or(|next| next > budget) {
                return Err(DeviceError::OutOfDeviceMemory);
            }
            *usage += size;
        }

        // Safety: released with the same size in `release`.
        let base = match unsafe { PlatformVmOps::map(reserved) } {
            Ok(base) => base,
            Err(e) => {
                lock(&self.state).heap_usage[heap] -= size;
                return Err(e.into());
            }
        };

        let raw = base.as_ptr() as u64;
        lock(&self.state).objects.insert(
            raw,
            HostObject {
                base,
                reserved,
                size,
                memory_type,
                heap,
                mapped: false,
            },
        );
        match NonZeroU64::new(raw) {
            Some(raw) => Ok(DeviceMemoryHandle::new(raw)),
            None => unreachable!("reservation returned a null base"),
        }
    }

    unsafe fn free_memory(&self, memory: DeviceMemoryHandle) {
        self.counters.free_calls.incr();
        let object = {
            let mut state = lock(&self.state);
            let Some(object) = state.objects.remove(&memory.raw()) else {
                log::error!("free of unknown memory object {:#x}", memory.raw());
                return;
            };
            state.heap_usage[object.heap] -= object.size;
            object
        };
        if object.mapped {
            log::warn!("memory object {:#x} freed while mapped", memory.raw());
        }
        Self::release(&object);
    }

    fn map_memory(
        &self,
        memory: DeviceMemoryHandle,
        size: u64,
    ) -> Result<NonNull<u8>, DeviceError> {
        self.counters.map_calls.incr();
        let mut state = lock(&self.state);
        let object = state
            .objects
            .get_mut(&memory.raw())
            .ok_or(DeviceError::UnknownHandle(memory.raw()))?;
        if !self.properties.is_host_visible(object.memory_type) || size > object.size {
            return Err(DeviceError::MemoryMapFailed(memory.raw()));
        }
        object.mapped = true;
        Ok(object.base)
    }

    unsafe fn unmap_memory(&self, memory: DeviceMemoryHandle) {
        self.counters.unmap_calls.incr();
        if let Some(object) = lock(&self.state).objects.get_mut(&memory.raw()) {
            object.mapped = false;
        }
    }

    fn invalidate_range(
        &self,
        memory: DeviceMemoryHandle,
        offset: u64,
        size: u64,
    ) -> Result<(), DeviceError> {
        self.counters.invalidate_calls.incr();
        self.check_range(memory, offset, size)
    }

    fn flush_range(
        &self,
        memory: DeviceMemoryHandle,
        offset: u64,
        size: u64,
    ) -> Result<(), DeviceError> {
        self.counters.flush_calls.incr();
        self.check_range(memory, offset, size)
    }

    fn image_memory_requirements(
        &self,
        image: ImageHandle,
    ) -> Result<MemoryRequirements, DeviceError> {
        lock(&self.state)
            .images
            .get(&image.raw())
            .copied()
            .ok_or(DeviceError::UnknownHandle(image.raw()))
    }
}

impl Drop for HostDevice {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        if !state.objects.is_empty() {
            log::warn!(
                "host device dropped with {} live memory objects",
                state.objects.len()
            );
        }
        for (_, object) in state.objects.drain() {
            Self::release(&object);
        }
    }
}
