//! Host address space behind [`HostDevice`](super::host_device::HostDevice)
//! memory objects.
//!
//! Each object is one anonymous read-write mapping. Pages are faulted in on
//! first touch, so a 64 MiB heap holding a few small buffers costs a few
//! physical pages.

use std::io;
use std::ptr::NonNull;

#[derive(Debug, thiserror::Error)]
pub enum VmError {
    #[error("mapping {size} bytes of host memory failed: {source}")]
    MapFailed {
        size: usize,
        #[source]
        source: io::Error,
    },
    #[error("unmapping host memory failed: {0}")]
    UnmapFailed(#[source] io::Error),
}

pub(crate) trait VmOps {
    /// Map `size` zero-filled, read-write bytes.
    ///
    /// # Safety
    ///
    /// The mapping must be released with [`unmap`](Self::unmap) and the same
    /// `size`.
    unsafe fn map(size: usize) -> Result<NonNull<u8>, VmError>;

    /// # Safety
    ///
    /// `ptr` and `size` come from one `map` call. No pointer into the
    /// mapping is used afterwards.
    unsafe fn unmap(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    fn page_size() -> usize;
}

pub(crate) struct PlatformVmOps;

#[cfg(all(unix, not(any(loom, miri))))]
impl VmOps for PlatformVmOps {
    unsafe fn map(size: usize) -> Result<NonNull<u8>, VmError> {
        // Safety: anonymous private mapping, no existing memory is touched.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(VmError::MapFailed {
                size,
                source: io::Error::last_os_error(),
            });
        }
        NonNull::new(ptr.cast::<u8>()).ok_or_else(|| VmError::MapFailed {
            size,
            source: io::Error::other("mmap returned null"),
        })
    }

    unsafe fn unmap(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
        // Safety: the caller passes a live mapping.
        if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size) } != 0 {
            return Err(VmError::UnmapFailed(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn page_size() -> usize {
        use crate::sync::OnceLock;
        static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
        *PAGE_SIZE.get_or_init(|| {
            // Safety: sysconf has no preconditions.
            let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            usize::try_from(raw)
                .ok()
                .filter(|&p| p.is_power_of_two())
                .unwrap_or(FALLBACK_PAGE_SIZE)
        })
    }
}

const FALLBACK_PAGE_SIZE: usize = 4096;

// loom and miri can't model mmap; non-unix hosts have no libc. Mappings
// become zeroed heap blocks.
#[cfg(any(loom, miri, not(unix)))]
impl VmOps for PlatformVmOps {
    unsafe fn map(size: usize) -> Result<NonNull<u8>, VmError> {
        let failed = |source| VmError::MapFailed { size, source };
        if size == 0 {
            return Err(failed(io::Error::from(io::ErrorKind::InvalidInput)));
        }
        let layout = std::alloc::Layout::from_size_align(size, FALLBACK_PAGE_SIZE)
            .map_err(|e| failed(io::Error::other(e)))?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| failed(io::Error::from(io::ErrorKind::OutOfMemory)))
    }

    unsafe fn unmap(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
        let layout = std::alloc::Layout::from_size_align(size, FALLBACK_PAGE_SIZE)
            .map_err(|e| VmError::UnmapFailed(io::Error::other(e)))?;
        // Safety: `map` allocated `ptr` with this layout.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }

    fn page_size() -> usize {
        FALLBACK_PAGE_SIZE
    }
}
