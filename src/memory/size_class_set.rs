use super::allocation::{Allocation, AllocationKind, AllocationTiling, MemoryClass, align_up};
use super::class_allocator::{BackingStore, ClassAllocator, ClassConfig};
use super::device::ImageHandle;
use super::error::AllocError;

/// The four size classes of one memory type, chained so each class's heaps
/// are runs of the next larger class.
#[derive(Debug)]
pub struct SizeClassSet {
    memory_type: u32,
    classes: [ClassAllocator; 4],
}

impl SizeClassSet {
    #[must_use]
    pub fn new(memory_type: u32, tiling_mask: u32) -> Self {
        let class = |c: MemoryClass| {
            ClassAllocator::new(ClassConfig {
                tiling_mask,
                ..ClassConfig::new(c, memory_type)
            })
        };
        Self {
            memory_type,
            classes: MemoryClass::ALL.map(class),
        }
    }

    #[must_use]
    pub fn memory_type(&self) -> u32 {
        self.memory_type
    }

    #[must_use]
    pub fn class_allocator(&self, class: MemoryClass) -> &ClassAllocator {
        &self.classes[class.index()]
    }

    /// Largest request served by suballocation.
    #[must_use]
    pub fn max_suballocation_size(&self) -> u64 {
        self.classes[MemoryClass::Huge.index()].heap_size()
    }

    /// Suballocate from the smallest class that fits `size` plus alignment
    /// padding. Anything larger is a global allocation.
    ///
    /// # Errors
    ///
    /// * [`AllocError::CapabilityMismatch`] for a zero size, an alignment
    ///   that is not a power of two, or a disallowed tiling.
    /// * [`AllocError::OutOfDeviceMemory`] if new backing memory can't be
    ///   obtained.
    pub fn allocate<S: BackingStore + ?Sized>(
        &self,
        size: u64,
        alignment: u64,
        tiling: AllocationTiling,
        store: &S,
    ) -> Result<Allocation, AllocError> {
        if size == 0 {
            return Err(AllocError::CapabilityMismatch("zero-sized allocation".into()));
        }
        if !alignment.is_power_of_two() {
            return Err(AllocError::CapabilityMismatch(format!(
                "alignment {alignment} is not a power of two"
            )));
        }

        for (i, class) in self.classes.iter().enumerate() {
            let sub_block = class.sub_block_size();
            let padded = size.checked_add(alignment.saturating_sub(sub_block));
            let Some(padded) = padded.filter(|&p| p <= class.heap_size()) else {
                continue;
            };

            let upstream = &self.classes[i + 1..];
            let mut allocation = class.allocate(padded, tiling, false, upstream, store)?;
            let shift = align_up(allocation.offset, alignment) - allocation.offset;
            if shift != 0 {
                allocation.advance(shift);
            }
            debug_assert!(allocation.size >= size);
            return Ok(allocation);
        }

        self.allocate_global(size, store)
    }

    /// One whole backing allocation, freed as a unit.
    ///
    /// # Errors
    ///
    /// [`AllocError::OutOfDeviceMemory`] if the driver refuses.
    pub fn allocate_global<S: BackingStore + ?Sized>(
        &self,
        size: u64,
        store: &S,
    ) -> Result<Allocation, AllocError> {
        store.allocate_backing(size, self.memory_type)
    }

    /// One whole backing allocation owned by `image`, never recycled.
    ///
    /// # Errors
    ///
    /// [`AllocError::OutOfDeviceMemory`] if the driver refuses.
    pub fn allocate_dedicated<S: BackingStore + ?Sized>(
        &self,
        size: u64,
        image: ImageHandle,
        store: &S,
    ) -> Result<Allocation, AllocError> {
        store.allocate_dedicated(size, self.memory_type, image)
    }

    /// Dispatch on where the allocation came from. `recycle` applies to
    /// global allocations only.
    ///
    /// # Errors
    ///
    /// [`AllocError::InvalidHandle`] if the allocation does not belong here.
    pub fn free<S: BackingStore + ?Sized>(
        &self,
        allocation: Allocation,
        recycle: bool,
        store: &S,
    ) -> Result<(), AllocError> {
        if allocation.memory_type != self.memory_type {
            return Err(AllocError::InvalidHandle(format!(
                "memory type {} allocation freed to memory type {}",
                allocation.memory_type, self.memory_type
            )));
        }
        match allocation.kind {
            AllocationKind::Suballocated { class, .. } => {
                let i = class.index();
                self.classes[i].free(allocation, &self.classes[i + 1..], store)
            }
            AllocationKind::Global => store.release_backing(allocation, recycle),
            AllocationKind::Dedicated => store.release_backing(allocation, false),
            AllocationKind::Imported => Ok(()),
        }
    }

    /// Heaps and occupied units over all classes.
    #[must_use]
    pub fn usage(&self) -> (usize, usize) {
        self.classes.iter().fold((0, 0), |(heaps, units), c| {
            (heaps + c.heap_count(), units + c.occupied_units())
        })
    }
}
