use std::{
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::error::AllocError;

/// Virtual memory page size of the computer. This is usually 4096.
/// It would be a constant, but we don't know the value at compile time,
/// so it is queried the first time it is needed and cached here.
static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// Used when the platform reports a page size we cannot work with.
const FALLBACK_PAGE_SIZE: usize = 4096;

/// This trait provides an abstraction over the low level memory operations
/// and syscalls the allocator depends on. As the allocator, our top level
/// view of this has nothing to do with the concrete APIs offered by each
/// kernel: we only reserve groups of pages and give them back.
///
/// # Safety
///
/// Implementors must return regions that are page aligned, readable,
/// writable, zero-filled and exactly `pages * page_size()` bytes long, and
/// `page_size()` must be a power of two that never changes. The heap writes
/// its metadata into those regions without further checks.
pub unsafe trait PageSource {
    /// Returns the virtual memory page size in bytes.
    fn page_size(&mut self) -> usize;

    /// Request `pages` contiguous pages of memory.
    fn reserve_pages(&mut self, pages: usize) -> Result<NonNull<u8>, AllocError>;

    /// Returns `pages` pages starting from `addr` back to the OS.
    ///
    /// # Safety
    ///
    /// `addr` and `pages` must describe a region obtained from
    /// [`PageSource::reserve_pages`] on this source that is no longer in use.
    unsafe fn release_pages(&mut self, addr: NonNull<u8>, pages: usize) -> Result<(), AllocError>;
}

/// The operating system's page mapping facility.
#[derive(Debug, Default, Clone, Copy)]
pub struct Kernel;

/// Low level syscall wrappers implemented once per platform.
trait PlatformMemory {
    /// Request a memory region of size `len`. It returns a pointer to the
    /// given location or None if the underlying syscall fails.
    unsafe fn request_memory(len: usize) -> Option<NonNull<u8>>;

    /// Returns the memory of size `len` starting from `addr` back to the
    /// kernel. Returns false if the kernel rejected the region.
    unsafe fn return_memory(addr: *mut u8, len: usize) -> bool;

    /// Returns the virtual memory page size of the computer in bytes, or 0
    /// if the platform could not tell.
    unsafe fn page_size() -> usize;
}

/// Wrapper to calculate the computer's page size.
#[inline]
pub(crate) fn page_size() -> usize {
    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            let size = checked_page_size(unsafe { <Kernel as PlatformMemory>::page_size() });
            PAGE_SIZE.store(size, Ordering::Relaxed);
            size
        }
        size => size,
    }
}

/// Page sizes that are not a power of two break every alignment
/// computation, so they are replaced by [`FALLBACK_PAGE_SIZE`].
fn checked_page_size(size: usize) -> usize {
    if size.is_power_of_two() {
        size
    } else {
        log::warn!("unusable page size {size}, assuming {FALLBACK_PAGE_SIZE}");
        FALLBACK_PAGE_SIZE
    }
}

unsafe impl PageSource for Kernel {
    fn page_size(&mut self) -> usize {
        page_size()
    }

    fn reserve_pages(&mut self, pages: usize) -> Result<NonNull<u8>, AllocError> {
        let len = pages.checked_mul(page_size()).ok_or(AllocError::Overflow)?;

        match unsafe { <Kernel as PlatformMemory>::request_memory(len) } {
            Some(addr) => Ok(addr),
            None => {
                log::warn!("kernel declined to map {pages} pages ({len} bytes)");
                Err(AllocError::OutOfMemory)
            }
        }
    }

    unsafe fn release_pages(&mut self, addr: NonNull<u8>, pages: usize) -> Result<(), AllocError> {
        let len = pages.checked_mul(page_size()).ok_or(AllocError::InvalidRegion)?;

        if unsafe { <Kernel as PlatformMemory>::return_memory(addr.as_ptr(), len) } {
            Ok(())
        } else {
            log::warn!("kernel rejected unmapping {len} bytes at {addr:p}");
            Err(AllocError::InvalidRegion)
        }
    }
}

#[cfg(unix)]
mod unix {
    use super::{Kernel, PlatformMemory};

    use libc::{mmap, munmap, off_t, size_t};

    use std::{
        os::raw::{c_int, c_void},
        ptr::NonNull,
    };

    impl PlatformMemory for Kernel {
        unsafe fn request_memory(len: usize) -> Option<NonNull<u8>> {
            // mmap parameters.
            const ADDR: *mut c_void = std::ptr::null_mut::<c_void>();
            // Read-Write only memory.
            const PROT: c_int = libc::PROT_READ | libc::PROT_WRITE;
            const FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
            const FD: c_int = -1;
            const OFFSET: off_t = 0;

            unsafe {
                match mmap(ADDR, len as size_t, PROT, FLAGS, FD, OFFSET) {
                    libc::MAP_FAILED => None,
                    addr => NonNull::new(addr.cast::<u8>()),
                }
            }
        }

        unsafe fn return_memory(addr: *mut u8, len: usize) -> bool {
            unsafe { munmap(addr as *mut c_void, len as size_t) == 0 }
        }

        unsafe fn page_size() -> usize {
            // -1 when the value is unavailable.
            match unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) } {
                size if size > 0 => size as usize,
                _ => 0,
            }
        }
    }
}

#[cfg(windows)]
mod windows {
    use std::{mem::MaybeUninit, os::raw::c_void, ptr::NonNull};

    use super::{Kernel, PlatformMemory};

    use windows::Win32::System::{Memory, SystemInformation};

    impl PlatformMemory for Kernel {
        unsafe fn request_memory(len: usize) -> Option<NonNull<u8>> {
            // Read-Write only. Committed pages are zero-filled.
            let protection = Memory::PAGE_READWRITE;

            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

            unsafe {
                let addr = Memory::VirtualAlloc(None, len, flags, protection);

                NonNull::new(addr.cast())
            }
        }

        unsafe fn return_memory(addr: *mut u8, _len: usize) -> bool {
            unsafe { Memory::VirtualFree(addr as *mut c_void, 0, Memory::MEM_RELEASE).is_ok() }
        }

        unsafe fn page_size() -> usize {
            unsafe {
                let mut system_info = MaybeUninit::uninit();
                SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

                system_info.assume_init().dwPageSize as usize
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_power_of_two() {
        let size = Kernel.page_size();
        assert!(size.is_power_of_two());
        assert_eq!(size, page_size());
    }

    #[test]
    fn unusable_page_sizes_fall_back() {
        assert_eq!(checked_page_size(0), FALLBACK_PAGE_SIZE);
        assert_eq!(checked_page_size(3000), FALLBACK_PAGE_SIZE);
        assert_eq!(checked_page_size(usize::MAX), FALLBACK_PAGE_SIZE);
        assert_eq!(checked_page_size(16384), 16384);
    }

    #[test]
    fn reserved_pages_are_zeroed_and_writable() {
        let mut kernel = Kernel;
        let pages = 2;
        let len = pages * kernel.page_size();

        let addr = kernel.reserve_pages(pages).unwrap();
        assert_eq!(addr.as_ptr() as usize % kernel.page_size(), 0);

        unsafe {
            let bytes = std::slice::from_raw_parts_mut(addr.as_ptr(), len);
            assert!(bytes.iter().all(|&b| b == 0));

            bytes.fill(0xAB);
            assert_eq!(bytes[len - 1], 0xAB);

            kernel.release_pages(addr, pages).unwrap();
        }
    }

    #[cfg(unix)]
    #[test]
    fn releasing_a_misaligned_region_fails() {
        let mut kernel = Kernel;
        let addr = kernel.reserve_pages(1).unwrap();

        unsafe {
            let inside = NonNull::new_unchecked(addr.as_ptr().add(1));
            assert_eq!(kernel.release_pages(inside, 1), Err(AllocError::InvalidRegion));

            kernel.release_pages(addr, 1).unwrap();
        }
    }
}
