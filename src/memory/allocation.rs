use super::block::NUM_SUB_BLOCKS;
use super::device::DeviceMemoryHandle;
use super::heap::HeapId;
use bitflags::bitflags;
use std::ptr::NonNull;

/// Round `value` up to a multiple of `alignment` (a power of two).
#[inline]
#[must_use]
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// [`align_up`], or `None` if the result doesn't fit in a `u64`.
#[inline]
#[must_use]
pub const fn checked_align_up(value: u64, alignment: u64) -> Option<u64> {
    debug_assert!(alignment.is_power_of_two());
    match value.checked_add(alignment - 1) {
        Some(v) => Some(v & !(alignment - 1)),
        None => None,
    }
}

/// Round `value` down to a multiple of `alignment` (a power of two).
#[inline]
#[must_use]
pub const fn align_down(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    value & !(alignment - 1)
}

/// Memory layout category. Heaps of one tiling never serve the other, so
/// linear and optimal resources can't share a granularity page.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum AllocationTiling {
    Linear,
    #[default]
    Optimal,
}

impl AllocationTiling {
    pub const ALL: [Self; 2] = [Self::Linear, Self::Optimal];

    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Linear => 0,
            Self::Optimal => 1,
        }
    }

    /// Bit of this tiling in a tiling compatibility mask.
    #[inline]
    #[must_use]
    pub const fn bit(self) -> u32 {
        1 << self.index()
    }
}

/// Size tier. Each tier's heaps are carved from the next larger tier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MemoryClass {
    Small,
    Medium,
    Large,
    Huge,
}

impl MemoryClass {
    pub const ALL: [Self; 4] = [Self::Small, Self::Medium, Self::Large, Self::Huge];

    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Default sub-block granularity in bytes.
    #[must_use]
    pub const fn sub_block_size(self) -> u64 {
        match self {
            Self::Small => 128,
            Self::Medium => 4 * 1024,
            Self::Large => 128 * 1024,
            Self::Huge => 2 * 1024 * 1024,
        }
    }

    /// Bytes in one heap of this class.
    #[must_use]
    pub const fn heap_size(self) -> u64 {
        self.sub_block_size() * NUM_SUB_BLOCKS as u64
    }
}

bitflags! {
    /// Host access intent for [`map`](super::device_pool::DeviceMemoryPool::map)
    /// and [`unmap`](super::device_pool::DeviceMemoryPool::unmap).
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct MemoryAccessFlags: u32 {
        const WRITE = 1 << 0;
        const READ = 1 << 1;
    }
}

/// Where an allocation came from; drives free dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum AllocationKind {
    /// Sub-block run of a heap owned by `class`.
    Suballocated { class: MemoryClass, heap: HeapId },
    /// Whole native object, recyclable.
    Global,
    /// Whole native object bound to one image, never recycled.
    Dedicated,
    /// Externally owned memory.
    Imported,
}

/// A live device memory range.
///
/// Not `Clone`: a handle is consumed by exactly one `free` call.
#[derive(Debug)]
#[must_use = "dropping an Allocation leaks its memory until the pool is destroyed"]
pub struct Allocation {
    pub(crate) memory: DeviceMemoryHandle,
    pub(crate) host_ptr: Option<NonNull<u8>>,
    pub(crate) offset: u64,
    pub(crate) size: u64,
    pub(crate) mask: u32,
    pub(crate) memory_type: u32,
    pub(crate) tiling: AllocationTiling,
    pub(crate) hierarchical: bool,
    pub(crate) kind: AllocationKind,
    /// Id of the pool that created the native object, 0 if none.
    pub(crate) owner: u64,
}

// Safety: the host pointer refers to a mapping owned by the pool. Ranges of
// distinct live allocations never overlap, so moving or sharing the handle
// across threads cannot alias another owner's bytes.
unsafe impl Send for Allocation {}
// Safety: see above; the handle exposes no interior mutability.
unsafe impl Sync for Allocation {}

impl Allocation {
    /// Whole native object, as returned by the pool's raw allocation path.
    pub(crate) fn whole(
        memory: DeviceMemoryHandle,
        host_ptr: Option<NonNull<u8>>,
        size: u64,
        memory_type: u32,
        kind: AllocationKind,
    ) -> Self {
        Self {
            memory,
            host_ptr,
            offset: 0,
            size,
            mask: 0,
            memory_type,
            tiling: AllocationTiling::Optimal,
            hierarchical: false,
            kind,
            owner: 0,
        }
    }

    /// Wrap memory the caller owns. Freeing it through a pool does nothing.
    pub fn imported(memory: DeviceMemoryHandle, size: u64, memory_type: u32) -> Self {
        Self::whole(memory, None, size, memory_type, AllocationKind::Imported)
    }

    #[must_use]
    pub fn memory(&self) -> DeviceMemoryHandle {
        self.memory
    }

    /// Byte offset within [`memory`](Self::memory).
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn memory_type(&self) -> u32 {
        self.memory_type
    }

    #[must_use]
    pub fn tiling(&self) -> AllocationTiling {
        self.tiling
    }

    /// Host pointer to the first byte of this range, if the memory is
    /// host visible.
    #[must_use]
    pub fn host_ptr(&self) -> Option<NonNull<u8>> {
        self.host_ptr
    }

    #[must_use]
    pub fn is_host_visible(&self) -> bool {
        self.host_ptr.is_some()
    }

    /// Size class serving this range, if suballocated.
    #[must_use]
    pub fn class(&self) -> Option<MemoryClass> {
        match self.kind {
            AllocationKind::Suballocated { class, .. } => Some(class),
            _ => None,
        }
    }

    /// True if this range backs a heap of the next smaller class.
    #[must_use]
    pub fn is_hierarchical(&self) -> bool {
        self.hierarchical
    }

    #[must_use]
    pub fn is_dedicated(&self) -> bool {
        self.kind == AllocationKind::Dedicated
    }

    #[must_use]
    pub fn is_global(&self) -> bool {
        self.kind == AllocationKind::Global
    }

    #[must_use]
    pub fn is_imported(&self) -> bool {
        self.kind == AllocationKind::Imported
    }

    /// Bitwise copy, for feeding forged or repeated handles to `free`.
    #[cfg(test)]
    pub(crate) fn clone_for_test(&self) -> Self {
        Self { ..*self }
    }

    /// Move the start of the range forward by `shift` bytes.
    pub(crate) fn advance(&mut self, shift: u64) {
        debug_assert!(shift < self.size);
        self.offset += shift;
        self.size -= shift;
        self.host_ptr = self.host_ptr.map(|p| {
            // Safety: shift < size, so the result stays inside the mapping.
            unsafe { p.add(shift as usize) }
        });
    }
}
