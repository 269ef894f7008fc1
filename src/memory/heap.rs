//! Heap storage for a class allocator.
//!
//! Heaps live in stable arena slots and are threaded onto circular,
//! index-linked bucket lists, so moving a heap between buckets is O(1) and no
//! list holds an address.

use super::allocation::{Allocation, AllocationTiling};
use super::block::FreeBlockTracker;

/// Back-reference from an allocation to the heap that served it.
///
/// The generation changes every time a slot is vacated, so a handle to a
/// heap that has since been released is detected instead of aliasing the
/// slot's next occupant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HeapId {
    index: u32,
    generation: u32,
}

impl HeapId {
    #[must_use]
    pub fn index(self) -> u32 {
        self.index
    }
}

/// Bucket a heap is filed under: `Run(k)` holds heaps whose longest free
/// run is `k + 1` units.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Bucket {
    Run(u32),
    Full,
}

impl Bucket {
    pub(crate) fn for_tracker(tracker: &FreeBlockTracker) -> Self {
        if tracker.full() {
            Self::Full
        } else {
            Self::Run(tracker.longest_run() - 1)
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Link {
    prev: u32,
    next: u32,
}

/// One backing allocation carved into 32 sub-blocks.
#[derive(Debug)]
pub(crate) struct MiniHeap {
    pub(crate) backing: Allocation,
    pub(crate) tracker: FreeBlockTracker,
    pub(crate) tiling: AllocationTiling,
    pub(crate) bucket: Option<Bucket>,
    link: Link,
}

impl MiniHeap {
    pub(crate) fn new(backing: Allocation, tiling: AllocationTiling) -> Self {
        Self {
            backing,
            tracker: FreeBlockTracker::new(),
            tiling,
            bucket: None,
            link: Link { prev: 0, next: 0 },
        }
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    heap: Option<MiniHeap>,
}

#[derive(Debug, Default)]
pub(crate) struct HeapArena {
    slots: Vec<Slot>,
    vacant: Vec<u32>,
    live: usize,
}

impl HeapArena {
    pub(crate) fn insert(&mut self, heap: MiniHeap) -> HeapId {
        self.live += 1;
        if let Some(index) = self.vacant.pop() {
            let slot = &mut self.slots[index as usize];
            debug_assert!(slot.heap.is_none());
            slot.heap = Some(heap);
            return HeapId {
                index,
                generation: slot.generation,
            };
        }

        #[allow(clippy::cast_possible_truncation)]
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            heap: Some(heap),
        });
        HeapId {
            index,
            generation: 0,
        }
    }

    #[cfg(all(test, not(loom)))]
    pub(crate) fn get(&self, id: HeapId) -> Option<&MiniHeap> {
        self.slots
            .get(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.heap.as_ref())
    }

    pub(crate) fn get_mut(&mut self, id: HeapId) -> Option<&mut MiniHeap> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.heap.as_mut())
    }

    /// Vacate the slot. The caller must have unlinked the heap first.
    pub(crate) fn remove(&mut self, id: HeapId) -> Option<MiniHeap> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let heap = slot.heap.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.vacant.push(id.index);
        self.live -= 1;
        Some(heap)
    }

    /// Current id of the occupied slot `index`.
    pub(crate) fn id_of(&self, index: u32) -> HeapId {
        HeapId {
            index,
            generation: self.slots[index as usize].generation,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.live
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (HeapId, &MiniHeap)> {
        self.slots.iter().enumerate().filter_map(|(i, s)| {
            #[allow(clippy::cast_possible_truncation)]
            let index = i as u32;
            s.heap.as_ref().map(|h| {
                (
                    HeapId {
                        index,
                        generation: s.generation,
                    },
                    h,
                )
            })
        })
    }

    fn at(&self, index: u32) -> &MiniHeap {
        match self.slots[index as usize].heap.as_ref() {
            Some(h) => h,
            None => unreachable!("heap list references vacant slot {index}"),
        }
    }

    fn at_mut(&mut self, index: u32) -> &mut MiniHeap {
        match self.slots[index as usize].heap.as_mut() {
            Some(h) => h,
            None => unreachable!("heap list references vacant slot {index}"),
        }
    }
}

/// Circular list of heap slots. Links live inside the heaps.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct HeapList {
    first: Option<u32>,
    len: usize,
}

impl HeapList {
    pub(crate) const fn new() -> Self {
        Self {
            first: None,
            len: 0,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.first.is_none()
    }

    pub(crate) fn first(&self) -> Option<u32> {
        self.first
    }

    #[cfg(all(test, not(loom)))]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn push_front(&mut self, arena: &mut HeapArena, index: u32) {
        match self.first {
            None => arena.at_mut(index).link = Link { prev: index, next: index },
            Some(first) => {
                let last = arena.at(first).link.prev;
                arena.at_mut(index).link = Link { prev: last, next: first };
                arena.at_mut(last).link.next = index;
                arena.at_mut(first).link.prev = index;
            }
        }
        self.first = Some(index);
        self.len += 1;
    }

    pub(crate) fn remove(&mut self, arena: &mut HeapArena, index: u32) {
        debug_assert!(self.len > 0);
        let Link { prev, next } = arena.at(index).link;
        if next == index {
            debug_assert_eq!(self.first, Some(index));
            self.first = None;
        } else {
            arena.at_mut(prev).link.next = next;
            arena.at_mut(next).link.prev = prev;
            if self.first == Some(index) {
                self.first = Some(next);
            }
        }
        self.len -= 1;
    }

    /// Slot indices from the front.
    #[cfg(all(test, not(loom)))]
    pub(crate) fn indices(&self, arena: &HeapArena) -> Vec<u32> {
        let mut out = Vec::with_capacity(self.len);
        if let Some(first) = self.first {
            let mut cur = first;
            loop {
                out.push(cur);
                cur = arena.at(cur).link.next;
                if cur == first {
                    break;
                }
            }
        }
        out
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::memory::device::DeviceMemoryHandle;
    use std::num::NonZeroU64;

    fn heap(n: u64) -> MiniHeap {
        let mem = DeviceMemoryHandle::new(NonZeroU64::new(n).unwrap());
        MiniHeap::new(
            Allocation::imported(mem, 4096, 0),
            AllocationTiling::Optimal,
        )
    }

    #[test]
    fn test_arena_generation_detects_stale_ids() {
        let mut arena = HeapArena::default();
        let a = arena.insert(heap(1));
        assert!(arena.get(a).is_some());
        assert!(arena.remove(a).is_some());
        assert!(arena.get(a).is_none());
        assert!(arena.remove(a).is_none());

        let b = arena.insert(heap(2));
        assert_eq!(a.index(), b.index(), "vacant slot is reused");
        assert_ne!(a, b);
        assert!(arena.get(a).is_none());
        assert_eq!(arena.get(b).unwrap().backing.memory().raw(), 2);
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn test_list_push_remove_order() {
        let mut arena = HeapArena::default();
        let ids: Vec<u32> = (1..=4).map(|n| arena.insert(heap(n)).index()).collect();
        let mut list = HeapList::new();
        for &i in &ids {
            list.push_front(&mut arena, i);
        }
        assert_eq!(list.len(), 4);
        assert_eq!(list.indices(&arena), vec![ids[3], ids[2], ids[1], ids[0]]);

        // middle
        list.remove(&mut arena, ids[2]);
        assert_eq!(list.indices(&arena), vec![ids[3], ids[1], ids[0]]);
        // head
        list.remove(&mut arena, ids[3]);
        assert_eq!(list.first(), Some(ids[1]));
        assert_eq!(list.indices(&arena), vec![ids[1], ids[0]]);
        // tail
        list.remove(&mut arena, ids[0]);
        assert_eq!(list.indices(&arena), vec![ids[1]]);
        list.remove(&mut arena, ids[1]);
        assert!(list.is_empty());
        assert_eq!(list.len(), 0);
    }

    #[test]
    fn test_two_lists_share_arena() {
        let mut arena = HeapArena::default();
        let a = arena.insert(heap(1)).index();
        let b = arena.insert(heap(2)).index();
        let c = arena.insert(heap(3)).index();
        let mut even = HeapList::new();
        let mut odd = HeapList::new();
        odd.push_front(&mut arena, a);
        even.push_front(&mut arena, b);
        odd.push_front(&mut arena, c);

        odd.remove(&mut arena, a);
        even.push_front(&mut arena, a);
        assert_eq!(odd.indices(&arena), vec![c]);
        assert_eq!(even.indices(&arena), vec![a, b]);
    }

    #[test]
    fn test_bucket_for_tracker() {
        let mut t = FreeBlockTracker::new();
        assert_eq!(Bucket::for_tracker(&t), Bucket::Run(31));
        let (m, _) = t.allocate(32);
        assert_eq!(Bucket::for_tracker(&t), Bucket::Full);
        t.free(m);
    }
}
