#[cfg(not(target_pointer_width = "64"))]
compile_error!("qen-devmem supports only 64-bit targets.");

pub(crate) mod sync;

// public module: implementation details stay pub(crate), the API is
// re-exported below
pub mod memory;

// pool
pub use memory::device_pool::{DeviceMemoryPool, DeviceMemoryPoolConfig};

// allocations
pub use memory::allocation::{
    Allocation, AllocationTiling, MemoryAccessFlags, MemoryClass, align_down, align_up,
};

// suballocation building blocks
pub use memory::block::{FreeBlockTracker, NUM_SUB_BLOCKS};
pub use memory::class_allocator::{
    ALL_TILINGS, BackingStore, ClassAllocator, ClassConfig, HeapInfo,
};
pub use memory::heap::HeapId;
pub use memory::size_class_set::SizeClassSet;

// driver interface
pub use memory::device::{
    DeviceError, DeviceMemory, DeviceMemoryHandle, ImageHandle, MemoryHeap, MemoryProperties,
    MemoryPropertyFlags, MemoryRequirements, MemoryType,
};
pub use memory::host_device::{HostDevice, HostDeviceConfig, HostDeviceStats};

// mgmt/stats
pub use memory::stats::{Counter, MemoryStats};

// errors
pub use memory::error::{AllocError, LeakReport};
pub use memory::vm::VmError;
