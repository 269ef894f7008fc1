use super::allocation::{
    Allocation, AllocationKind, AllocationTiling, MemoryAccessFlags, MemoryClass, align_down,
    align_up, checked_align_up,
};
use super::class_allocator::{ALL_TILINGS, BackingStore};
use super::device::{DeviceMemory, DeviceMemoryHandle, ImageHandle, MemoryProperties};
use super::error::{AllocError, LeakReport};
use super::recycle::{RecycleCache, RecycledMemory};
use super::size_class_set::SizeClassSet;
use super::stats::{MemoryStats, PoolStats};
use crate::sync::{Mutex, lock, next_id};
use std::ptr::NonNull;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceMemoryPoolConfig {
    /// Give images that prefer or require it their own native object.
    pub use_dedicated_allocations: bool,
    /// Bytes of released objects each native heap may keep for reuse.
    pub recycle_limit: u64,
}

impl Default for DeviceMemoryPoolConfig {
    fn default() -> Self {
        Self {
            use_dedicated_allocations: true,
            recycle_limit: 256 * 1024 * 1024,
        }
    }
}

/// Device memory allocator for one device.
///
/// Requests up to 64 MiB are suballocated from per-memory-type size classes;
/// larger ones get their own native object. Native objects released by the
/// largest class, and global allocations, are kept per native heap for exact
/// size reuse until [`garbage_collect`](Self::garbage_collect).
///
/// Host-visible objects are mapped once, when created.
#[derive(Debug)]
pub struct DeviceMemoryPool<D: DeviceMemory> {
    /// Stamped into every native object this pool creates.
    id: u64,
    device: D,
    config: DeviceMemoryPoolConfig,
    properties: MemoryProperties,
    atom_size: u64,
    sets: Vec<SizeClassSet>,
    recycle: Vec<Mutex<RecycleCache>>,
    stats: PoolStats,
}

impl<D: DeviceMemory> DeviceMemoryPool<D> {
    pub fn new(device: D, config: DeviceMemoryPoolConfig) -> Self {
        let properties = device.memory_properties();
        let atom_size = properties.non_coherent_atom_size.max(1).next_power_of_two();
        let sets = (0..properties.memory_types.len())
            .map(|i| {
                #[allow(clippy::cast_possible_truncation)]
                SizeClassSet::new(i as u32, ALL_TILINGS)
            })
            .collect();
        let recycle = properties
            .memory_heaps
            .iter()
            .map(|_| Mutex::new(RecycleCache::new(config.recycle_limit)))
            .collect();
        log::debug!(
            "device memory pool: {} memory types, {} heaps, atom size {atom_size}",
            properties.memory_types.len(),
            properties.memory_heaps.len()
        );
        Self {
            id: next_id(),
            device,
            config,
            properties,
            atom_size,
            sets,
            recycle,
            stats: PoolStats::default(),
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn config(&self) -> &DeviceMemoryPoolConfig {
        &self.config
    }

    pub fn memory_properties(&self) -> &MemoryProperties {
        &self.properties
    }

    pub fn size_class_set(&self, memory_type: u32) -> Option<&SizeClassSet> {
        self.sets.get(memory_type as usize)
    }

    /// Suballocate `size` bytes at `alignment` (rounded up to the atom size).
    ///
    /// # Errors
    ///
    /// * [`AllocError::CapabilityMismatch`] for an unknown memory type, a
    ///   zero size or a non power of two alignment.
    /// * [`AllocError::OutOfDeviceMemory`] if the driver refuses; the caller
    ///   may [`garbage_collect`](Self::garbage_collect) and retry.
    pub fn allocate(
        &self,
        size: u64,
        alignment: u64,
        memory_type: u32,
        tiling: AllocationTiling,
    ) -> Result<Allocation, AllocError> {
        let set = self.set(memory_type)?;
        if !alignment.is_power_of_two() {
            return Err(AllocError::CapabilityMismatch(format!(
                "alignment {alignment} is not a power of two"
            )));
        }
        let alignment = align_up(alignment, self.atom_size);
        let padding = alignment.saturating_sub(MemoryClass::Huge.sub_block_size());
        if size.saturating_add(padding) > set.max_suballocation_size() {
            return self.allocate_global(size, memory_type);
        }
        set.allocate(size, alignment, tiling, self)
    }

    /// Allocate memory for `image`, dedicated if the driver prefers it and
    /// dedicated allocations are enabled.
    ///
    /// # Errors
    ///
    /// As [`allocate`](Self::allocate); [`AllocError::InvalidHandle`] if
    /// the driver doesn't know `image`.
    pub fn allocate_image_memory(
        &self,
        size: u64,
        alignment: u64,
        memory_type: u32,
        tiling: AllocationTiling,
        image: ImageHandle,
    ) -> Result<Allocation, AllocError> {
        if self.config.use_dedicated_allocations {
            let requirements = self.device.image_memory_requirements(image).map_err(|e| {
                AllocError::InvalidHandle(format!("image {:#x}: {e}", image.raw()))
            })?;
            if requirements.prefers_dedicated || requirements.requires_dedicated {
                let set = self.set(memory_type)?;
                let size = self.whole_object_size(size)?;
                let allocation = set.allocate_dedicated(size, image, self)?;
                self.stats.direct_allocations.incr();
                return Ok(allocation);
            }
        }
        self.allocate(size, alignment, memory_type, tiling)
    }

    /// A whole native object, reused from the recycle cache on an exact
    /// size match.
    ///
    /// # Errors
    ///
    /// As [`allocate`](Self::allocate).
    pub fn allocate_global(&self, size: u64, memory_type: u32) -> Result<Allocation, AllocError> {
        let set = self.set(memory_type)?;
        let size = self.whole_object_size(size)?;
        let allocation = set.allocate_global(size, self)?;
        self.stats.direct_allocations.incr();
        Ok(allocation)
    }

    /// Host pointer to the allocation. `READ` access invalidates the range
    /// on non-coherent memory.
    ///
    /// # Errors
    ///
    /// * [`AllocError::CapabilityMismatch`] if the memory is not host visible.
    /// * [`AllocError::OutOfDeviceMemory`] if the driver fails to invalidate.
    pub fn map(
        &self,
        allocation: &Allocation,
        access: MemoryAccessFlags,
    ) -> Result<NonNull<u8>, AllocError> {
        self.check_owner(allocation)?;
        let ptr = Self::host_ptr(allocation)?;
        if access.contains(MemoryAccessFlags::READ)
            && !self.properties.is_host_coherent(allocation.memory_type)
        {
            let (offset, size) = self.atom_range(allocation);
            self.device
                .invalidate_range(allocation.memory, offset, size)
                .map_err(|source| AllocError::OutOfDeviceMemory {
                    size,
                    memory_type: allocation.memory_type,
                    source,
                })?;
        }
        Ok(ptr)
    }

    /// End host access. `WRITE` access flushes the range on non-coherent
    /// memory. The object stays mapped.
    ///
    /// # Errors
    ///
    /// As [`map`](Self::map).
    pub fn unmap(
        &self,
        allocation: &Allocation,
        access: MemoryAccessFlags,
    ) -> Result<(), AllocError> {
        self.check_owner(allocation)?;
        Self::host_ptr(allocation)?;
        if access.contains(MemoryAccessFlags::WRITE)
            && !self.properties.is_host_coherent(allocation.memory_type)
        {
            let (offset, size) = self.atom_range(allocation);
            self.device
                .flush_range(allocation.memory, offset, size)
                .map_err(|source| AllocError::OutOfDeviceMemory {
                    size,
                    memory_type: allocation.memory_type,
                    source,
                })?;
        }
        Ok(())
    }

    /// Release an allocation. Global objects go to the recycle cache.
    ///
    /// # Errors
    ///
    /// [`AllocError::InvalidHandle`] if the allocation was not made by this
    /// pool or was already freed.
    pub fn free(&self, allocation: Allocation) -> Result<(), AllocError> {
        self.free_impl(allocation, true)
    }

    /// Like [`free`](Self::free), but a global object goes straight back to
    /// the driver.
    ///
    /// # Errors
    ///
    /// As [`free`](Self::free).
    pub fn free_no_recycle(&self, allocation: Allocation) -> Result<(), AllocError> {
        self.free_impl(allocation, false)
    }

    /// Release every recycled object to the driver. Returns the bytes
    /// released.
    ///
    /// Only call once the GPU no longer uses any memory freed since the last
    /// collection.
    pub fn garbage_collect(&self) -> u64 {
        let mut released = 0;
        for (heap, cache) in self.recycle.iter().enumerate() {
            let drained = lock(cache).drain();
            for (size, _, entry) in drained {
                self.stats.recycled_bytes.sub(size);
                self.release_raw(heap, entry.memory, entry.host_base, size);
                released += size;
            }
        }
        if released != 0 {
            log::debug!("garbage collection released {released} bytes");
        }
        released
    }

    pub fn stats(&self) -> MemoryStats {
        self.stats.snapshot()
    }

    /// Bytes held from the driver for native heap `heap`, live or cached.
    pub fn heap_usage(&self, heap: usize) -> u64 {
        self.recycle
            .get(heap)
            .map_or(0, |cache| lock(cache).device_bytes())
    }

    /// Objects waiting in native heap `heap`'s recycle cache.
    pub fn recycle_list_len(&self, heap: usize) -> usize {
        self.recycle.get(heap).map_or(0, |cache| lock(cache).len())
    }

    /// Allocations that have not been freed yet.
    pub fn leak_report(&self) -> LeakReport {
        let (live_heaps, occupied_units) = self
            .sets
            .iter()
            .map(SizeClassSet::usage)
            .fold((0, 0), |(h, u), (sh, su)| (h + sh, u + su));
        LeakReport {
            live_heaps,
            occupied_units,
            direct_allocations: usize::try_from(self.stats.direct_allocations.get())
                .unwrap_or(usize::MAX),
        }
    }

    fn set(&self, memory_type: u32) -> Result<&SizeClassSet, AllocError> {
        self.sets.get(memory_type as usize).ok_or_else(|| {
            AllocError::CapabilityMismatch(format!("memory type {memory_type} does not exist"))
        })
    }

    fn heap_index(&self, memory_type: u32) -> Result<usize, AllocError> {
        self.properties
            .memory_type(memory_type)
            .map(|t| t.heap_index as usize)
            .filter(|&heap| heap < self.recycle.len())
            .ok_or_else(|| {
                AllocError::CapabilityMismatch(format!(
                    "memory type {memory_type} has no native heap"
                ))
            })
    }

    fn whole_object_size(&self, size: u64) -> Result<u64, AllocError> {
        if size == 0 {
            return Err(AllocError::CapabilityMismatch("zero-sized allocation".into()));
        }
        checked_align_up(size, self.atom_size).ok_or_else(|| {
            AllocError::CapabilityMismatch(format!("{size} bytes is not a representable size"))
        })
    }

    fn check_owner(&self, allocation: &Allocation) -> Result<(), AllocError> {
        if allocation.owner == self.id {
            Ok(())
        } else {
            Err(AllocError::InvalidHandle(format!(
                "memory object {:#x} was not allocated by this pool",
                allocation.memory.raw()
            )))
        }
    }

    fn whole(
        &self,
        memory: DeviceMemoryHandle,
        host_base: Option<NonNull<u8>>,
        size: u64,
        memory_type: u32,
        kind: AllocationKind,
    ) -> Allocation {
        let mut allocation = Allocation::whole(memory, host_base, size, memory_type, kind);
        allocation.owner = self.id;
        allocation
    }

    fn host_ptr(allocation: &Allocation) -> Result<NonNull<u8>, AllocError> {
        allocation.host_ptr.ok_or_else(|| {
            AllocError::CapabilityMismatch(format!(
                "allocation of memory type {} is not host visible",
                allocation.memory_type
            ))
        })
    }

    /// The allocation's range widened to atom boundaries.
    fn atom_range(&self, allocation: &Allocation) -> (u64, u64) {
        let start = align_down(allocation.offset, self.atom_size);
        let end = align_up(allocation.offset + allocation.size, self.atom_size);
        (start, end - start)
    }

    fn free_impl(&self, allocation: Allocation, recycle: bool) -> Result<(), AllocError> {
        if allocation.is_imported() {
            return Ok(());
        }
        self.check_owner(&allocation)?;
        let direct = allocation.is_global() || allocation.is_dedicated();
        let set = self.sets.get(allocation.memory_type as usize).ok_or_else(|| {
            AllocError::InvalidHandle(format!(
                "memory type {} does not exist",
                allocation.memory_type
            ))
        })?;
        set.free(allocation, recycle, self)?;
        if direct {
            self.stats.direct_allocations.decr();
        }
        Ok(())
    }

    fn allocate_raw(
        &self,
        size: u64,
        memory_type: u32,
        image: Option<ImageHandle>,
        kind: AllocationKind,
    ) -> Result<Allocation, AllocError> {
        let heap = self.heap_index(memory_type)?;
        let memory = self
            .device
            .allocate_memory(size, memory_type, image)
            .map_err(|source| {
                log::warn!(
                    "driver allocation of {size} bytes from memory type {memory_type} failed: {source}"
                );
                AllocError::OutOfDeviceMemory {
                    size,
                    memory_type,
                    source,
                }
            })?;

        let host_base = if self.properties.is_host_visible(memory_type) {
            match self.device.map_memory(memory, size) {
                Ok(ptr) => Some(ptr),
                Err(source) => {
                    log::warn!("mapping {size} bytes of memory type {memory_type} failed: {source}");
                    // Safety: the object was just created and nothing refers to it.
                    unsafe { self.device.free_memory(memory) };
                    return Err(AllocError::OutOfDeviceMemory {
                        size,
                        memory_type,
                        source,
                    });
                }
            }
        } else {
            None
        };

        self.stats.driver_allocations.incr();
        self.stats.live_objects.incr();
        self.stats.device_bytes.add(size);
        lock(&self.recycle[heap]).add_device_bytes(size);
        log::trace!("allocated {size} bytes of memory type {memory_type} from the driver");
        Ok(self.whole(memory, host_base, size, memory_type, kind))
    }

    fn release_raw(
        &self,
        heap: usize,
        memory: DeviceMemoryHandle,
        host_base: Option<NonNull<u8>>,
        size: u64,
    ) {
        // Safety: the allocation was consumed by free, so no live range
        // refers to the object any more.
        unsafe {
            if host_base.is_some() {
                self.device.unmap_memory(memory);
            }
            self.device.free_memory(memory);
        }
        self.stats.driver_frees.incr();
        self.stats.live_objects.decr();
        self.stats.device_bytes.sub(size);
        lock(&self.recycle[heap]).sub_device_bytes(size);
    }
}

impl<D: DeviceMemory> BackingStore for DeviceMemoryPool<D> {
    fn allocate_backing(&self, size: u64, memory_type: u32) -> Result<Allocation, AllocError> {
        let heap = self.heap_index(memory_type)?;
        let recycled = lock(&self.recycle[heap]).take(size, memory_type);
        if let Some(entry) = recycled {
            self.stats.recycle_hits.incr();
            self.stats.recycled_bytes.sub(size);
            log::debug!("reusing recycled {size} bytes of memory type {memory_type}");
            return Ok(self.whole(
                entry.memory,
                entry.host_base,
                size,
                memory_type,
                AllocationKind::Global,
            ));
        }
        self.allocate_raw(size, memory_type, None, AllocationKind::Global)
    }

    fn allocate_dedicated(
        &self,
        size: u64,
        memory_type: u32,
        image: ImageHandle,
    ) -> Result<Allocation, AllocError> {
        self.allocate_raw(size, memory_type, Some(image), AllocationKind::Dedicated)
    }

    fn release_backing(&self, allocation: Allocation, recycle: bool) -> Result<(), AllocError> {
        if !allocation.is_global() && !allocation.is_dedicated() {
            return Err(AllocError::InvalidHandle(format!(
                "{:?} allocation is not a whole native object",
                allocation.kind
            )));
        }
        self.check_owner(&allocation)?;
        let heap = self.heap_index(allocation.memory_type)?;
        let (size, memory_type) = (allocation.size, allocation.memory_type);
        let entry = RecycledMemory {
            memory: allocation.memory,
            host_base: allocation.host_ptr,
        };

        let entry = if recycle && allocation.is_global() {
            match lock(&self.recycle[heap]).insert(size, memory_type, entry) {
                Ok(()) => {
                    self.stats.recycled_bytes.add(size);
                    return Ok(());
                }
                Err(refused) => refused,
            }
        } else {
            entry
        };
        self.release_raw(heap, entry.memory, entry.host_base, size);
        Ok(())
    }
}

impl<D: DeviceMemory> Drop for DeviceMemoryPool<D> {
    fn drop(&mut self) {
        let report = self.leak_report();
        if !report.is_clean() {
            log::error!("device memory pool dropped with live allocations: {report:?}");
        }
        self.garbage_collect();
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::memory::device::{DeviceError, MemoryHeap, MemoryRequirements};
    use crate::memory::host_device::{HostDevice, HostDeviceConfig};

    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * KIB;

    const DEVICE_LOCAL: u32 = 0;
    const HOST_COHERENT: u32 = 1;
    const HOST_CACHED: u32 = 2;

    fn pool() -> DeviceMemoryPool<HostDevice> {
        DeviceMemoryPool::new(HostDevice::default(), DeviceMemoryPoolConfig::default())
    }

    fn requirements(prefers: bool, requires: bool) -> MemoryRequirements {
        MemoryRequirements {
            size: MIB,
            alignment: 4 * KIB,
            memory_type_bits: !0,
            prefers_dedicated: prefers,
            requires_dedicated: requires,
        }
    }

    #[test]
    fn test_small_allocation_creates_one_huge_heap() {
        let pool = pool();
        let a = pool
            .allocate(256, 16, DEVICE_LOCAL, AllocationTiling::Optimal)
            .unwrap();
        assert_eq!(a.class(), Some(MemoryClass::Small));
        assert_eq!(a.offset() % 64, 0, "offset honours the atom size");
        assert!(!a.is_host_visible());

        let stats = pool.stats();
        assert_eq!(stats.driver_allocations, 1);
        assert_eq!(stats.device_bytes, MemoryClass::Huge.heap_size());
        assert_eq!(pool.heap_usage(0), MemoryClass::Huge.heap_size());

        pool.free(a).unwrap();
        // the emptied huge heap waits for reuse
        assert_eq!(pool.recycle_list_len(0), 1);
        assert_eq!(pool.stats().recycled_bytes, MemoryClass::Huge.heap_size());
        assert!(pool.leak_report().is_clean());

        assert_eq!(pool.garbage_collect(), MemoryClass::Huge.heap_size());
        assert_eq!(pool.recycle_list_len(0), 0);
        assert_eq!(pool.heap_usage(0), 0);
        assert_eq!(pool.device().stats().live_objects, 0);
    }

    #[test]
    fn test_recycled_heap_is_reused() {
        let pool = pool();
        let a = pool
            .allocate(4 * KIB, 1, HOST_COHERENT, AllocationTiling::Linear)
            .unwrap();
        pool.free(a).unwrap();
        let b = pool
            .allocate(4 * KIB, 1, HOST_COHERENT, AllocationTiling::Linear)
            .unwrap();
        let stats = pool.stats();
        assert_eq!(stats.driver_allocations, 1);
        assert_eq!(stats.recycle_hits, 1);
        assert!(b.is_host_visible(), "recycled object keeps its mapping");
        pool.free(b).unwrap();
    }

    #[test]
    fn test_global_round_trip_through_recycle_cache() {
        let pool = pool();
        let a = pool.allocate_global(100 * MIB, DEVICE_LOCAL).unwrap();
        assert!(a.is_global());
        let memory = a.memory();
        pool.free(a).unwrap();
        assert_eq!(pool.recycle_list_len(0), 1);

        // exact size match only
        let other = pool.allocate_global(99 * MIB, DEVICE_LOCAL).unwrap();
        assert_ne!(other.memory(), memory);
        pool.free_no_recycle(other).unwrap();

        let again = pool.allocate_global(100 * MIB, DEVICE_LOCAL).unwrap();
        assert_eq!(again.memory(), memory);
        pool.free(again).unwrap();

        pool.garbage_collect();
        let fresh = pool.allocate_global(100 * MIB, DEVICE_LOCAL).unwrap();
        assert_ne!(pool.stats().recycle_hits, 0);
        assert_eq!(pool.stats().driver_allocations, 3);
        pool.free_no_recycle(fresh).unwrap();
        assert_eq!(pool.recycle_list_len(0), 0);
        assert_eq!(pool.device().stats().live_objects, 0);
    }

    #[test]
    fn test_global_size_rounded_to_atom() {
        let pool = pool();
        let a = pool.allocate_global(1000, HOST_CACHED).unwrap();
        assert_eq!(a.size(), 1024);
        assert_eq!(pool.device().object_size(a.memory()), Some(1024));
        pool.free_no_recycle(a).unwrap();
    }

    #[test]
    fn test_oversized_request_is_global() {
        let pool = pool();
        let a = pool
            .allocate(65 * MIB, 4096, DEVICE_LOCAL, AllocationTiling::Optimal)
            .unwrap();
        assert!(a.is_global());
        assert_eq!(a.class(), None);
        assert_eq!(pool.leak_report().direct_allocations, 1);
        pool.free(a).unwrap();
        assert_eq!(pool.leak_report().direct_allocations, 0);
    }

    #[test]
    fn test_dedicated_image_memory() {
        let pool = pool();
        let image = pool.device().create_image(requirements(false, true));
        let a = pool
            .allocate_image_memory(MIB, 4 * KIB, DEVICE_LOCAL, AllocationTiling::Optimal, image)
            .unwrap();
        assert!(a.is_dedicated());
        assert_eq!(a.offset(), 0);
        pool.free(a).unwrap();
        assert_eq!(pool.recycle_list_len(0), 0, "dedicated memory is never recycled");
        assert_eq!(pool.device().stats().live_objects, 0);

        let plain = pool.device().create_image(requirements(false, false));
        let b = pool
            .allocate_image_memory(MIB, 4 * KIB, DEVICE_LOCAL, AllocationTiling::Optimal, plain)
            .unwrap();
        assert_eq!(b.class(), Some(MemoryClass::Large));
        pool.free(b).unwrap();
    }

    #[test]
    fn test_dedicated_disabled_suballocates() {
        let pool = DeviceMemoryPool::new(
            HostDevice::default(),
            DeviceMemoryPoolConfig {
                use_dedicated_allocations: false,
                ..DeviceMemoryPoolConfig::default()
            },
        );
        let image = pool.device().create_image(requirements(true, false));
        let a = pool
            .allocate_image_memory(MIB, 4 * KIB, DEVICE_LOCAL, AllocationTiling::Optimal, image)
            .unwrap();
        assert!(!a.is_dedicated());
        pool.free(a).unwrap();
    }

    #[test]
    fn test_unknown_image_is_invalid_handle() {
        let pool = pool();
        let image = pool.device().create_image(requirements(true, false));
        pool.device().destroy_image(image);
        let err = pool
            .allocate_image_memory(MIB, 1, DEVICE_LOCAL, AllocationTiling::Optimal, image)
            .unwrap_err();
        assert!(matches!(err, AllocError::InvalidHandle(_)));
    }

    #[test]
    fn test_map_non_coherent_invalidates_and_flushes() {
        let pool = pool();
        let a = pool
            .allocate(300, 1, HOST_CACHED, AllocationTiling::Linear)
            .unwrap();
        let before = pool.device().stats();

        let ptr = pool.map(&a, MemoryAccessFlags::WRITE).unwrap();
        // Safety: Test code.
        unsafe { ptr.as_ptr().write_bytes(0x5C, 300) };
        pool.unmap(&a, MemoryAccessFlags::WRITE).unwrap();

        let ptr = pool.map(&a, MemoryAccessFlags::READ).unwrap();
        // Safety: Test code.
        assert_eq!(unsafe { ptr.as_ptr().add(299).read() }, 0x5C);
        pool.unmap(&a, MemoryAccessFlags::READ).unwrap();

        let after = pool.device().stats();
        assert_eq!(after.flush_calls - before.flush_calls, 1);
        assert_eq!(after.invalidate_calls - before.invalidate_calls, 1);
        assert_eq!(after.map_calls, before.map_calls, "objects are mapped once");
        pool.free(a).unwrap();
    }

    #[test]
    fn test_map_coherent_skips_driver() {
        let pool = pool();
        let a = pool
            .allocate(300, 1, HOST_COHERENT, AllocationTiling::Linear)
            .unwrap();
        let ptr = pool
            .map(&a, MemoryAccessFlags::READ | MemoryAccessFlags::WRITE)
            .unwrap();
        assert_eq!(Some(ptr), a.host_ptr());
        pool.unmap(&a, MemoryAccessFlags::READ | MemoryAccessFlags::WRITE)
            .unwrap();
        let stats = pool.device().stats();
        assert_eq!(stats.flush_calls + stats.invalidate_calls, 0);
        pool.free(a).unwrap();
    }

    #[test]
    fn test_map_device_local_fails() {
        let pool = pool();
        let a = pool
            .allocate(300, 1, DEVICE_LOCAL, AllocationTiling::Optimal)
            .unwrap();
        assert!(matches!(
            pool.map(&a, MemoryAccessFlags::WRITE),
            Err(AllocError::CapabilityMismatch(_))
        ));
        assert!(pool.unmap(&a, MemoryAccessFlags::WRITE).is_err());
        pool.free(a).unwrap();
    }

    #[test]
    fn test_invalid_requests() {
        let pool = pool();
        assert!(matches!(
            pool.allocate(64, 1, 42, AllocationTiling::Optimal),
            Err(AllocError::CapabilityMismatch(_))
        ));
        assert!(matches!(
            pool.allocate(64, 48, DEVICE_LOCAL, AllocationTiling::Optimal),
            Err(AllocError::CapabilityMismatch(_))
        ));
        assert!(matches!(
            pool.allocate(0, 1, DEVICE_LOCAL, AllocationTiling::Optimal),
            Err(AllocError::CapabilityMismatch(_))
        ));
        assert!(matches!(
            pool.allocate_global(0, DEVICE_LOCAL),
            Err(AllocError::CapabilityMismatch(_))
        ));
        assert_eq!(pool.device().stats().allocate_calls, 0);
    }

    #[test]
    fn test_imported_free_is_noop() {
        let pool = pool();
        let a = pool.allocate_global(MIB, DEVICE_LOCAL).unwrap();
        let imported = Allocation::imported(a.memory(), MIB, DEVICE_LOCAL);
        pool.free(imported).unwrap();
        assert_eq!(pool.device().stats().free_calls, 0);
        pool.free_no_recycle(a).unwrap();
        assert_eq!(pool.device().stats().free_calls, 1);
    }

    #[test]
    fn test_out_of_memory_is_recoverable() {
        let device = HostDevice::new(HostDeviceConfig {
            memory_heaps: vec![MemoryHeap { size: 64 * MIB }, MemoryHeap { size: 64 * MIB }],
            ..HostDeviceConfig::default()
        });
        let pool = DeviceMemoryPool::new(device, DeviceMemoryPoolConfig::default());
        let a = pool.allocate_global(40 * MIB, DEVICE_LOCAL).unwrap();
        pool.free(a).unwrap();

        let err = pool.allocate_global(30 * MIB, DEVICE_LOCAL).unwrap_err();
        assert!(err.is_recoverable());
        assert!(matches!(
            err,
            AllocError::OutOfDeviceMemory {
                source: DeviceError::OutOfDeviceMemory,
                ..
            }
        ));
        // no automatic retry happened
        assert_eq!(pool.recycle_list_len(0), 1);

        pool.garbage_collect();
        let b = pool.allocate_global(30 * MIB, DEVICE_LOCAL).unwrap();
        pool.free_no_recycle(b).unwrap();
    }

    #[test]
    fn test_recycle_limit_releases_overflow() {
        let pool = DeviceMemoryPool::new(
            HostDevice::default(),
            DeviceMemoryPoolConfig {
                recycle_limit: MIB,
                ..DeviceMemoryPoolConfig::default()
            },
        );
        let a = pool.allocate_global(MIB, DEVICE_LOCAL).unwrap();
        let b = pool.allocate_global(MIB, DEVICE_LOCAL).unwrap();
        pool.free(a).unwrap();
        pool.free(b).unwrap();
        assert_eq!(pool.recycle_list_len(0), 1);
        assert_eq!(pool.stats().driver_frees, 1);
    }

    #[test]
    fn test_leak_report_counts_live_allocations() {
        let pool = pool();
        let a = pool
            .allocate(128, 1, DEVICE_LOCAL, AllocationTiling::Optimal)
            .unwrap();
        let g = pool.allocate_global(MIB, DEVICE_LOCAL).unwrap();
        let report = pool.leak_report();
        // one heap per class, the large heap taking two huge units
        assert_eq!(report.live_heaps, 4);
        assert_eq!(report.occupied_units, 5);
        assert_eq!(report.direct_allocations, 1);
        pool.free(a).unwrap();
        pool.free(g).unwrap();
        assert!(pool.leak_report().is_clean());
    }

    #[test]
    fn test_foreign_global_free_is_rejected() {
        let first = pool();
        let second = pool();
        let a = first.allocate_global(MIB, DEVICE_LOCAL).unwrap();
        let b = second.allocate_global(MIB, DEVICE_LOCAL).unwrap();

        let err = second.free(a.clone_for_test()).unwrap_err();
        assert!(matches!(err, AllocError::InvalidHandle(_)));
        let err = second.free_no_recycle(a.clone_for_test()).unwrap_err();
        assert!(matches!(err, AllocError::InvalidHandle(_)));
        assert_eq!(second.device().stats().live_objects, 1);
        assert_eq!(second.device().stats().free_calls, 0);
        assert_eq!(second.leak_report().direct_allocations, 1);
        assert_eq!(second.recycle_list_len(0), 0);

        first.free_no_recycle(a).unwrap();
        second.free_no_recycle(b).unwrap();
        assert!(first.leak_report().is_clean());
        assert!(second.leak_report().is_clean());
    }

    #[test]
    fn test_foreign_suballocation_is_rejected() {
        let first = pool();
        let second = pool();
        let a = first
            .allocate(256, 1, HOST_COHERENT, AllocationTiling::Linear)
            .unwrap();
        let b = second
            .allocate(256, 1, HOST_COHERENT, AllocationTiling::Linear)
            .unwrap();

        assert!(matches!(
            second.map(&a, MemoryAccessFlags::WRITE),
            Err(AllocError::InvalidHandle(_))
        ));
        assert!(matches!(
            second.unmap(&a, MemoryAccessFlags::WRITE),
            Err(AllocError::InvalidHandle(_))
        ));
        assert!(matches!(
            second.free(a.clone_for_test()),
            Err(AllocError::InvalidHandle(_))
        ));
        // b's units are still held, so the next allocation lands elsewhere
        let c = second
            .allocate(256, 1, HOST_COHERENT, AllocationTiling::Linear)
            .unwrap();
        let disjoint = c.offset() >= b.offset() + b.size() || b.offset() >= c.offset() + c.size();
        assert!(c.memory() != b.memory() || disjoint);

        first.free(a).unwrap();
        second.free(b).unwrap();
        second.free(c).unwrap();
        assert!(first.leak_report().is_clean());
        assert!(second.leak_report().is_clean());
    }

    #[test]
    fn test_unrepresentable_sizes_are_rejected() {
        let pool = pool();
        assert!(matches!(
            pool.allocate_global(u64::MAX - 10, DEVICE_LOCAL),
            Err(AllocError::CapabilityMismatch(_))
        ));
        assert!(
            pool.allocate(u64::MAX, 4096, DEVICE_LOCAL, AllocationTiling::Optimal)
                .is_err()
        );
        assert_eq!(pool.device().stats().allocate_calls, 0);
        assert!(pool.leak_report().is_clean());
    }

    #[test]
    fn test_pool_is_send_sync() {
        fn check<T: Send + Sync>() {}
        check::<DeviceMemoryPool<HostDevice>>();
        check::<Allocation>();
    }
}
