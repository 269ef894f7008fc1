use super::device::DeviceError;

#[derive(Debug, thiserror::Error)]
pub enum AllocError {
    /// The driver could not create or map a native memory object.
    #[error("out of device memory: {size} bytes from memory type {memory_type}")]
    OutOfDeviceMemory {
        size: u64,
        memory_type: u32,
        #[source]
        source: DeviceError,
    },
    /// The request can't be served with these parameters.
    #[error("capability mismatch: {0}")]
    CapabilityMismatch(String),
    /// The handle is not owned by this pool, or was already freed.
    #[error("invalid handle: {0}")]
    InvalidHandle(String),
}

impl AllocError {
    /// True if `garbage_collect()` followed by a retry may succeed.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::OutOfDeviceMemory { .. })
    }
}

/// Outstanding allocations found when inspecting or tearing down a pool.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LeakReport {
    /// Heaps still alive across every class and memory type.
    pub live_heaps: usize,
    /// Occupied sub-block units across those heaps.
    pub occupied_units: usize,
    /// Global and dedicated allocations not yet freed.
    pub direct_allocations: usize,
}

impl LeakReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        *self == Self::default()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_only_oom_is_recoverable() {
        let oom = AllocError::OutOfDeviceMemory {
            size: 1 << 20,
            memory_type: 0,
            source: DeviceError::OutOfDeviceMemory,
        };
        assert!(oom.is_recoverable());
        assert!(oom.source().is_some());
        assert!(!AllocError::CapabilityMismatch("tiling".into()).is_recoverable());
        assert!(!AllocError::InvalidHandle("stale".into()).is_recoverable());
    }

    #[test]
    fn test_display() {
        let oom = AllocError::OutOfDeviceMemory {
            size: 4096,
            memory_type: 2,
            source: DeviceError::OutOfDeviceMemory,
        };
        assert_eq!(
            oom.to_string(),
            "out of device memory: 4096 bytes from memory type 2"
        );
    }

    #[test]
    fn test_leak_report_clean() {
        assert!(LeakReport::default().is_clean());
        let r = LeakReport {
            live_heaps: 1,
            ..LeakReport::default()
        };
        assert!(!r.is_clean());
    }
}
