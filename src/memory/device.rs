//! Driver-facing interface consumed by the pool.
//!
//! [`DeviceMemory`] is the only way the allocator talks to a graphics
//! driver. A Vulkan backend implements it over `vkAllocateMemory` and
//! friends; [`HostDevice`](super::host_device::HostDevice) implements it in
//! software.

use super::vm::VmError;
use bitflags::bitflags;
use std::num::NonZeroU64;
use std::ptr::NonNull;

/// Opaque native memory object handle (`VkDeviceMemory`-like).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceMemoryHandle(NonZeroU64);

impl DeviceMemoryHandle {
    #[must_use]
    pub const fn new(raw: NonZeroU64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0.get()
    }
}

/// Opaque native image handle, used for dedicated allocations and
/// requirement queries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageHandle(NonZeroU64);

impl ImageHandle {
    #[must_use]
    pub const fn new(raw: NonZeroU64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0.get()
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct MemoryPropertyFlags: u32 {
        const DEVICE_LOCAL = 1 << 0;
        const HOST_VISIBLE = 1 << 1;
        const HOST_COHERENT = 1 << 2;
        const HOST_CACHED = 1 << 3;
        const LAZILY_ALLOCATED = 1 << 4;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryType {
    pub heap_index: u32,
    pub property_flags: MemoryPropertyFlags,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryHeap {
    /// Budget in bytes.
    pub size: u64,
}

/// Snapshot of the physical device's memory layout, queried once by the pool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryProperties {
    pub memory_types: Vec<MemoryType>,
    pub memory_heaps: Vec<MemoryHeap>,
    /// Granularity of flush/invalidate ranges on non-coherent memory.
    pub non_coherent_atom_size: u64,
}

impl MemoryProperties {
    #[must_use]
    pub fn memory_type(&self, index: u32) -> Option<&MemoryType> {
        self.memory_types.get(index as usize)
    }

    #[must_use]
    pub fn is_host_visible(&self, index: u32) -> bool {
        self.memory_type(index)
            .is_some_and(|t| t.property_flags.contains(MemoryPropertyFlags::HOST_VISIBLE))
    }

    #[must_use]
    pub fn is_host_coherent(&self, index: u32) -> bool {
        self.memory_type(index)
            .is_some_and(|t| t.property_flags.contains(MemoryPropertyFlags::HOST_COHERENT))
    }

    /// First memory type allowed by `type_bits` whose flags contain `required`.
    #[must_use]
    pub fn find_memory_type(&self, type_bits: u32, required: MemoryPropertyFlags) -> Option<u32> {
        self.memory_types
            .iter()
            .enumerate()
            .filter(|&(i, _)| i < 32 && type_bits & (1 << i) != 0)
            .find(|(_, t)| t.property_flags.contains(required))
            .and_then(|(i, _)| u32::try_from(i).ok())
    }
}

/// Result of a resource requirements query.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryRequirements {
    pub size: u64,
    pub alignment: u64,
    pub memory_type_bits: u32,
    pub prefers_dedicated: bool,
    pub requires_dedicated: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("out of device memory")]
    OutOfDeviceMemory,
    #[error("out of host memory")]
    OutOfHostMemory,
    #[error("memory type {0} does not exist")]
    InvalidMemoryType(u32),
    #[error("memory object {0:#x} cannot be mapped")]
    MemoryMapFailed(u64),
    #[error("unknown handle {0:#x}")]
    UnknownHandle(u64),
    #[error("range {offset:#x}+{size:#x} is not a valid mapped range of {memory:#x}")]
    InvalidRange { memory: u64, offset: u64, size: u64 },
    #[error(transparent)]
    Vm(#[from] VmError),
}

/// Native memory-management calls the pool is built on.
///
/// Implementations must be callable from any thread. The pool never holds
/// one of its own locks while calling into the driver.
pub trait DeviceMemory: Send + Sync {
    fn memory_properties(&self) -> MemoryProperties;

    /// Create a native memory object of `size` bytes. `dedicated_image` binds
    /// the object to a single image.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::OutOfDeviceMemory`] when the heap backing
    /// `memory_type` cannot satisfy the request.
    fn allocate_memory(
        &self,
        size: u64,
        memory_type: u32,
        dedicated_image: Option<ImageHandle>,
    ) -> Result<DeviceMemoryHandle, DeviceError>;

    /// # Safety
    ///
    /// `memory` must come from `allocate_memory` on this device, must not be
    /// mapped, and must not be referenced by any live resource.
    unsafe fn free_memory(&self, memory: DeviceMemoryHandle);

    /// Map the whole object and return its host base pointer.
    ///
    /// # Errors
    ///
    /// Fails if the object's memory type is not host visible.
    fn map_memory(
        &self,
        memory: DeviceMemoryHandle,
        size: u64,
    ) -> Result<NonNull<u8>, DeviceError>;

    /// # Safety
    ///
    /// No pointer derived from the mapping may be used afterwards.
    unsafe fn unmap_memory(&self, memory: DeviceMemoryHandle);

    /// Make device writes in `offset..offset + size` visible to the host.
    ///
    /// # Errors
    ///
    /// Driver failure, typically host memory exhaustion.
    fn invalidate_range(
        &self,
        memory: DeviceMemoryHandle,
        offset: u64,
        size: u64,
    ) -> Result<(), DeviceError>;

    /// Make host writes in `offset..offset + size` visible to the device.
    ///
    /// # Errors
    ///
    /// Driver failure, typically host memory exhaustion.
    fn flush_range(
        &self,
        memory: DeviceMemoryHandle,
        offset: u64,
        size: u64,
    ) -> Result<(), DeviceError>;

    /// # Errors
    ///
    /// [`DeviceError::UnknownHandle`] if `image` was never created.
    fn image_memory_requirements(
        &self,
        image: ImageHandle,
    ) -> Result<MemoryRequirements, DeviceError>;
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    fn props() -> MemoryProperties {
        MemoryProperties {
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
            ],
            memory_heaps: vec![MemoryHeap { size: 1 << 30 }, MemoryHeap { size: 1 << 29 }],
            non_coherent_atom_size: 64,
        }
    }

    #[test]
    fn test_host_visibility_queries() {
        let p = props();
        assert!(!p.is_host_visible(0));
        assert!(p.is_host_visible(1));
        assert!(p.is_host_coherent(1));
        assert!(p.is_host_visible(2));
        assert!(!p.is_host_coherent(2));
        assert!(!p.is_host_visible(7));
    }

    #[test]
    fn test_find_memory_type_respects_type_bits() {
        let p = props();
        assert_eq!(
            p.find_memory_type(!0, MemoryPropertyFlags::HOST_VISIBLE),
            Some(1)
        );
        assert_eq!(
            p.find_memory_type(0b100, MemoryPropertyFlags::HOST_VISIBLE),
            Some(2)
        );
        assert_eq!(
            p.find_memory_type(0b001, MemoryPropertyFlags::HOST_VISIBLE),
            None
        );
        assert_eq!(p.find_memory_type(!0, MemoryPropertyFlags::empty()), Some(0));
    }

    #[test]
    fn test_handles_round_trip_raw() {
        let h = DeviceMemoryHandle::new(NonZeroU64::new(0x1000).unwrap());
        assert_eq!(h.raw(), 0x1000);
        let i = ImageHandle::new(NonZeroU64::new(7).unwrap());
        assert_eq!(i.raw(), 7);
    }
}
