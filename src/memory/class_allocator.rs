//! One size class for one memory type.
//!
//! Heaps are filed per tiling into 32 run-length buckets plus a `full`
//! list. `availability` has bit `k` set while bucket `k` is non-empty, so
//! the smallest bucket that fits a request is one mask and one
//! `trailing_zeros` away.

use super::allocation::{Allocation, AllocationKind, AllocationTiling, MemoryClass};
use super::block::NUM_SUB_BLOCKS;
use super::device::{DeviceMemoryHandle, ImageHandle};
use super::error::AllocError;
use super::heap::{Bucket, HeapArena, HeapId, HeapList, MiniHeap};
use crate::sync::{Mutex, lock};

/// Tiling mask accepting every tiling.
pub const ALL_TILINGS: u32 = AllocationTiling::Linear.bit() | AllocationTiling::Optimal.bit();

/// Source of whole native allocations for the largest class, and of
/// dedicated allocations.
pub trait BackingStore {
    /// # Errors
    ///
    /// [`AllocError::OutOfDeviceMemory`] if the driver refuses.
    fn allocate_backing(&self, size: u64, memory_type: u32) -> Result<Allocation, AllocError>;

    /// # Errors
    ///
    /// [`AllocError::OutOfDeviceMemory`] if the driver refuses.
    fn allocate_dedicated(
        &self,
        size: u64,
        memory_type: u32,
        image: ImageHandle,
    ) -> Result<Allocation, AllocError>;

    /// Take back a whole allocation. `recycle` allows it to be cached for
    /// reuse instead of released to the driver.
    ///
    /// # Errors
    ///
    /// [`AllocError::InvalidHandle`] if the store does not own it.
    fn release_backing(&self, allocation: Allocation, recycle: bool) -> Result<(), AllocError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClassConfig {
    pub class: MemoryClass,
    /// Power of two.
    pub sub_block_size: u64,
    pub memory_type: u32,
    /// Bits from [`AllocationTiling::bit`].
    pub tiling_mask: u32,
}

impl ClassConfig {
    /// The class's default granularity, all tilings allowed.
    #[must_use]
    pub fn new(class: MemoryClass, memory_type: u32) -> Self {
        Self {
            class,
            sub_block_size: class.sub_block_size(),
            memory_type,
            tiling_mask: ALL_TILINGS,
        }
    }
}

/// Diagnostic view of one heap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeapInfo {
    pub id: HeapId,
    pub memory: DeviceMemoryHandle,
    pub offset: u64,
    pub tiling: AllocationTiling,
    pub longest_run: u32,
    pub free_mask: u32,
    pub occupied: u32,
}

#[derive(Debug)]
struct TilingBuckets {
    heaps: [HeapList; NUM_SUB_BLOCKS as usize],
    full: HeapList,
    availability: u32,
}

impl TilingBuckets {
    const fn new() -> Self {
        Self {
            heaps: [HeapList::new(); NUM_SUB_BLOCKS as usize],
            full: HeapList::new(),
            availability: 0,
        }
    }
}

#[derive(Debug)]
struct ClassState {
    arena: HeapArena,
    buckets: [TilingBuckets; 2],
}

impl ClassState {
    fn new() -> Self {
        Self {
            arena: HeapArena::default(),
            buckets: [TilingBuckets::new(), TilingBuckets::new()],
        }
    }

    fn heap_mut(&mut self, id: HeapId) -> &mut MiniHeap {
        match self.arena.get_mut(id) {
            Some(h) => h,
            None => unreachable!("class state references released heap {id:?}"),
        }
    }

    /// Heap in the smallest bucket whose run length is at least `num_blocks`.
    fn find_heap(&self, num_blocks: u32, tiling: AllocationTiling) -> Option<HeapId> {
        let t = &self.buckets[tiling.index()];
        let size_mask = (1u32 << (num_blocks - 1)) - 1;
        let candidates = t.availability & !size_mask;
        if candidates == 0 {
            return None;
        }
        let k = candidates.trailing_zeros();
        match t.heaps[k as usize].first() {
            Some(index) => Some(self.arena.id_of(index)),
            None => panic!("availability bit {k} set for an empty bucket"),
        }
    }

    fn unfile(&mut self, id: HeapId) {
        let Self { arena, buckets } = self;
        let Some(heap) = arena.get_mut(id) else {
            unreachable!("unfile of released heap {id:?}");
        };
        let Some(bucket) = heap.bucket.take() else {
            return;
        };
        let t = &mut buckets[heap.tiling.index()];
        match bucket {
            Bucket::Run(k) => {
                let list = &mut t.heaps[k as usize];
                list.remove(arena, id.index());
                if list.is_empty() {
                    t.availability &= !(1 << k);
                }
            }
            Bucket::Full => t.full.remove(arena, id.index()),
        }
    }

    fn file(&mut self, id: HeapId) {
        let heap = self.heap_mut(id);
        debug_assert!(heap.bucket.is_none());
        let bucket = Bucket::for_tracker(&heap.tracker);
        heap.bucket = Some(bucket);
        let tiling = heap.tiling;

        let Self { arena, buckets } = self;
        let t = &mut buckets[tiling.index()];
        match bucket {
            Bucket::Run(k) => {
                t.heaps[k as usize].push_front(arena, id.index());
                t.availability |= 1 << k;
            }
            Bucket::Full => t.full.push_front(arena, id.index()),
        }
    }

    fn refile(&mut self, id: HeapId) {
        let heap = self.heap_mut(id);
        if heap.bucket == Some(Bucket::for_tracker(&heap.tracker)) {
            return;
        }
        self.unfile(id);
        self.file(id);
    }

    fn suballocate(
        &mut self,
        id: HeapId,
        num_blocks: u32,
        hierarchical: bool,
        config: &ClassConfig,
    ) -> Allocation {
        let heap = self.heap_mut(id);
        let (mask, first) = heap.tracker.allocate(num_blocks);
        let start = u64::from(first) * config.sub_block_size;
        let allocation = Allocation {
            memory: heap.backing.memory,
            host_ptr: heap.backing.host_ptr.map(|p| {
                // Safety: the run lies inside the heap's backing range.
                unsafe { p.add(start as usize) }
            }),
            offset: heap.backing.offset + start,
            size: u64::from(num_blocks) * config.sub_block_size,
            mask,
            memory_type: config.memory_type,
            tiling: heap.tiling,
            hierarchical,
            kind: AllocationKind::Suballocated {
                class: config.class,
                heap: id,
            },
            owner: heap.backing.owner,
        };
        self.refile(id);
        allocation
    }
}

/// Serves runs of 1 to 32 sub-blocks from heaps of `32 * sub_block_size`
/// bytes. Heaps come from the next larger class when one is given, otherwise
/// from the [`BackingStore`].
#[derive(Debug)]
pub struct ClassAllocator {
    config: ClassConfig,
    state: Mutex<ClassState>,
}

impl ClassAllocator {
    /// # Panics
    ///
    /// Panics if `sub_block_size` is not a power of two.
    #[must_use]
    pub fn new(config: ClassConfig) -> Self {
        assert!(
            config.sub_block_size.is_power_of_two(),
            "sub-block size {} is not a power of two",
            config.sub_block_size
        );
        Self {
            config,
            state: Mutex::new(ClassState::new()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &ClassConfig {
        &self.config
    }

    #[must_use]
    pub fn sub_block_size(&self) -> u64 {
        self.config.sub_block_size
    }

    /// Largest request this class serves, and the size of each heap.
    #[must_use]
    pub fn heap_size(&self) -> u64 {
        self.config.sub_block_size * u64::from(NUM_SUB_BLOCKS)
    }

    #[must_use]
    pub fn supports(&self, tiling: AllocationTiling) -> bool {
        self.config.tiling_mask & tiling.bit() != 0
    }

    /// Allocate `size` bytes rounded up to whole sub-blocks.
    ///
    /// `upstream` lists the larger classes in ascending order; its first
    /// element, if any, provides new heaps. The class lock is not held while
    /// a new heap is obtained.
    ///
    /// # Errors
    ///
    /// * [`AllocError::CapabilityMismatch`] if `tiling` is not allowed or
    ///   `size` is zero or larger than a heap. Nothing is mutated.
    /// * [`AllocError::OutOfDeviceMemory`] if no new heap can be obtained.
    pub fn allocate<S: BackingStore + ?Sized>(
        &self,
        size: u64,
        tiling: AllocationTiling,
        hierarchical: bool,
        upstream: &[ClassAllocator],
        store: &S,
    ) -> Result<Allocation, AllocError> {
        if !self.supports(tiling) {
            return Err(AllocError::CapabilityMismatch(format!(
                "{:?} class does not accept {tiling:?} tiling",
                self.config.class
            )));
        }
        let units = size.div_ceil(self.config.sub_block_size);
        if units == 0 || units > u64::from(NUM_SUB_BLOCKS) {
            return Err(AllocError::CapabilityMismatch(format!(
                "{size} bytes does not fit the {:?} class",
                self.config.class
            )));
        }
        #[allow(clippy::cast_possible_truncation)]
        let num_blocks = units as u32;

        {
            let mut state = lock(&self.state);
            if let Some(id) = state.find_heap(num_blocks, tiling) {
                return Ok(state.suballocate(id, num_blocks, hierarchical, &self.config));
            }
        }

        let heap_size = self.heap_size();
        let backing = match upstream.split_first() {
            Some((parent, rest)) => parent.allocate(heap_size, tiling, true, rest, store)?,
            None => store.allocate_backing(heap_size, self.config.memory_type)?,
        };
        debug_assert!(backing.size >= heap_size);

        let mut state = lock(&self.state);
        let id = state.arena.insert(MiniHeap::new(backing, tiling));
        state.file(id);
        log::trace!(
            "{:?} heap {:?} created for memory type {} ({tiling:?}, {} live)",
            self.config.class,
            id,
            self.config.memory_type,
            state.arena.len()
        );
        Ok(state.suballocate(id, num_blocks, hierarchical, &self.config))
    }

    /// Return a run to its heap. An emptied heap is handed back upstream.
    ///
    /// # Errors
    ///
    /// [`AllocError::InvalidHandle`] if the allocation was not served by
    /// this class or its heap no longer holds those units.
    pub fn free<S: BackingStore + ?Sized>(
        &self,
        allocation: Allocation,
        upstream: &[ClassAllocator],
        store: &S,
    ) -> Result<(), AllocError> {
        let AllocationKind::Suballocated { class, heap: id } = allocation.kind else {
            return Err(AllocError::InvalidHandle(format!(
                "{:?} allocation is not suballocated",
                allocation.kind
            )));
        };
        if class != self.config.class || allocation.memory_type != self.config.memory_type {
            return Err(AllocError::InvalidHandle(format!(
                "{class:?} allocation of memory type {} freed to {:?} class of memory type {}",
                allocation.memory_type, self.config.class, self.config.memory_type
            )));
        }

        let released = {
            let mut state = lock(&self.state);
            let Some(heap) = state.arena.get_mut(id) else {
                return Err(AllocError::InvalidHandle(format!(
                    "heap {id:?} was already released"
                )));
            };
            let occupied = !heap.tracker.free_mask();
            if allocation.mask == 0 || occupied & allocation.mask != allocation.mask {
                return Err(AllocError::InvalidHandle(format!(
                    "units {:#034b} are not occupied in heap {id:?}",
                    allocation.mask
                )));
            }
            heap.tracker.free(allocation.mask);

            if heap.tracker.empty() {
                state.unfile(id);
                let heap = state.arena.remove(id);
                log::trace!(
                    "{:?} heap {:?} released for memory type {} ({} live)",
                    self.config.class,
                    id,
                    self.config.memory_type,
                    state.arena.len()
                );
                heap.map(|h| h.backing)
            } else {
                state.refile(id);
                None
            }
        };

        match (released, upstream.split_first()) {
            (None, _) => Ok(()),
            (Some(backing), Some((parent, rest))) => parent.free(backing, rest, store),
            (Some(backing), None) => store.release_backing(backing, true),
        }
    }

    #[must_use]
    pub fn heap_count(&self) -> usize {
        lock(&self.state).arena.len()
    }

    #[must_use]
    pub fn occupied_units(&self) -> usize {
        lock(&self.state)
            .arena
            .iter()
            .map(|(_, h)| h.tracker.occupied() as usize)
            .sum()
    }

    #[must_use]
    pub fn heaps(&self) -> Vec<HeapInfo> {
        lock(&self.state)
            .arena
            .iter()
            .map(|(id, h)| HeapInfo {
                id,
                memory: h.backing.memory,
                offset: h.backing.offset,
                tiling: h.tiling,
                longest_run: h.tracker.longest_run(),
                free_mask: h.tracker.free_mask(),
                occupied: h.tracker.occupied(),
            })
            .collect()
    }
}

impl Drop for ClassAllocator {
    fn drop(&mut self) {
        let state = lock(&self.state);
        if state.arena.len() != 0 {
            log::error!(
                "{:?} class of memory type {} dropped with {} live heaps",
                self.config.class,
                self.config.memory_type,
                state.arena.len()
            );
        }
    }
}
