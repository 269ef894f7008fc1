use super::device::DeviceMemoryHandle;
use std::collections::BTreeMap;
use std::ptr::NonNull;

/// A released native object kept for reuse, still mapped if it was.
#[derive(Debug)]
pub(crate) struct RecycledMemory {
    pub(crate) memory: DeviceMemoryHandle,
    pub(crate) host_base: Option<NonNull<u8>>,
}

/// Released native objects of one native heap, waiting for reuse or for
/// `garbage_collect`.
///
/// Lookups are exact on `(size, memory_type)`. Objects past `cache_limit`
/// are refused and go straight back to the driver. The cache also keeps the
/// heap's running total of driver memory held by the pool, live or cached.
#[derive(Debug)]
pub(crate) struct RecycleCache {
    cached: BTreeMap<(u64, u32), Vec<RecycledMemory>>,
    cached_bytes: u64,
    cached_count: usize,
    cache_limit: u64,
    device_bytes: u64,
}

// Safety: RecycleCache owns the mappings it holds; it is only reached through
// the pool's per-heap mutex.
unsafe impl Send for RecycleCache {}

impl RecycleCache {
    pub(crate) fn new(limit: u64) -> Self {
        Self {
            cached: BTreeMap::new(),
            cached_bytes: 0,
            cached_count: 0,
            cache_limit: limit,
            device_bytes: 0,
        }
    }

    /// Exact match, most recently released first.
    pub(crate) fn take(&mut self, size: u64, memory_type: u32) -> Option<RecycledMemory> {
        let key = (size, memory_type);
        let list = self.cached.get_mut(&key)?;
        let entry = list.pop()?;
        if list.is_empty() {
            self.cached.remove(&key);
        }
        self.cached_bytes -= size;
        self.cached_count -= 1;
        Some(entry)
    }

    /// Cache `entry`, or hand it back if that would pass the limit.
    pub(crate) fn insert(
        &mut self,
        size: u64,
        memory_type: u32,
        entry: RecycledMemory,
    ) -> Result<(), RecycledMemory> {
        if !self
            .cached_bytes
            .checked_add(size)
            .is_some_and(|next| next <= self.cache_limit)
        {
            return Err(entry);
        }
        self.cached.entry((size, memory_type)).or_default().push(entry);
        self.cached_bytes += size;
        self.cached_count += 1;
        Ok(())
    }

    /// Remove every cached object, largest first.
    pub(crate) fn drain(&mut self) -> Vec<(u64, u32, RecycledMemory)> {
        let mut out = Vec::with_capacity(self.cached_count);
        while let Some(((size, memory_type), list)) = self.cached.pop_last() {
            out.extend(list.into_iter().map(|e| (size, memory_type, e)));
        }
        self.cached_bytes = 0;
        self.cached_count = 0;
        out
    }

    pub(crate) fn len(&self) -> usize {
        self.cached_count
    }

    #[cfg(test)]
    pub(crate) fn cached_bytes(&self) -> u64 {
        self.cached_bytes
    }

    pub(crate) fn device_bytes(&self) -> u64 {
        self.device_bytes
    }

    pub(crate) fn add_device_bytes(&mut self, size: u64) {
        self.device_bytes += size;
    }

    pub(crate) fn sub_device_bytes(&mut self, size: u64) {
        debug_assert!(self.device_bytes >= size);
        self.device_bytes = self.device_bytes.saturating_sub(size);
    }
}

impl Drop for RecycleCache {
    fn drop(&mut self) {
        if self.cached_count != 0 {
            log::error!(
                "recycle cache dropped holding {} objects ({} bytes)",
                self.cached_count,
                self.cached_bytes
            );
        }
    }
}
