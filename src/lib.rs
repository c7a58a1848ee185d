//! # pgalloc - a general purpose allocator built on page groups
//!
//! This crate maps memory straight from the operating system (`mmap` on
//! unix, `VirtualAlloc` on windows) in groups of pages and carves those
//! groups into chunks, each one a small header followed by the memory handed
//! to the user.
//!
//! ```text
//!   Page group:
//!   +--------+--------------+--------------+--------------+-------------+
//!   | Header | Chunk (used) | Chunk (free) | Chunk (used) | unused tail |
//!   +--------+--------------+--------------+--------------+-------------+
//!
//!   Chunk:
//!   +---------------+------------------------------+
//!   | Chunk header  |         User memory          |
//!   +---------------+------------------------------+
//!                   ^
//!                   +-- pointer returned to the user
//! ```
//!
//! A request goes to the first group with a big enough free run; inside it
//! the smallest free chunk that fits is reused, otherwise the tail is bumped.
//! Freed chunks merge with free neighbours, and a group with nothing left in
//! use is unmapped right away.
//!
//! [`Heap`] is the allocator itself: an explicit context object with a single
//! owner. [`PgAlloc`] puts one behind a lock so it can be shared or installed
//! as the `#[global_allocator]`:
//!
//! ```rust,ignore
//! use pgalloc::PgAlloc;
//!
//! #[global_allocator]
//! static ALLOCATOR: PgAlloc = PgAlloc::new();
//! ```
//!
//! Debug output goes through the `log` facade. When `PgAlloc` is the global
//! allocator the installed logger must not allocate, since it runs while the
//! heap lock is held.

mod chunk;
mod config;
mod error;
mod group;
mod heap;
mod kernel;
mod utils;

pub use config::{Config, DEFAULT_MIN_GROUP_PAGES};
pub use error::AllocError;
pub use heap::{Heap, HeapStats};
pub use kernel::{Kernel, PageSource};
pub use utils::ALIGNMENT;

use std::{
    alloc::{GlobalAlloc, Layout},
    ptr::{self, NonNull},
};

use parking_lot::Mutex;

/// A [`Heap`] shared behind a single lock.
///
/// All four operations are serialized by the lock. The heap itself is
/// created on the first request, which is also when the page size is asked
/// to the operating system, so `PgAlloc` can live in a `static`.
pub struct PgAlloc {
    config: Config,
    heap: Mutex<Option<Heap<Kernel>>>,
}

impl PgAlloc {
    pub const fn new() -> Self {
        Self::with_config(Config::new())
    }

    pub const fn with_config(config: Config) -> Self {
        Self {
            config,
            heap: parking_lot::const_mutex(None),
        }
    }

    fn with_heap<R>(&self, f: impl FnOnce(&mut Heap<Kernel>) -> R) -> R {
        let mut heap = self.heap.lock();
        f(heap.get_or_insert_with(|| Heap::with_config(Kernel, self.config)))
    }

    /// See [`Heap::allocate`].
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        self.with_heap(|heap| heap.allocate(size))
    }

    /// See [`Heap::zero_allocate`].
    pub fn zero_allocate(&self, count: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
        self.with_heap(|heap| heap.zero_allocate(count, size))
    }

    /// See [`Heap::allocate_aligned`].
    pub fn allocate_aligned(&self, size: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
        self.with_heap(|heap| heap.allocate_aligned(size, align))
    }

    /// See [`Heap::resize`].
    pub fn resize(&self, ptr: Option<NonNull<u8>>, size: usize) -> Result<Option<NonNull<u8>>, AllocError> {
        self.with_heap(|heap| heap.resize(ptr, size))
    }

    /// See [`Heap::resize_aligned`].
    pub fn resize_aligned(&self, ptr: NonNull<u8>, size: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
        self.with_heap(|heap| heap.resize_aligned(ptr, size, align))
    }

    /// See [`Heap::free`].
    pub fn free(&self, ptr: Option<NonNull<u8>>) -> Result<(), AllocError> {
        self.with_heap(|heap| heap.free(ptr))
    }

    /// See [`Heap::usable_size`].
    pub fn usable_size(&self, ptr: NonNull<u8>) -> Result<usize, AllocError> {
        self.with_heap(|heap| heap.usable_size(ptr))
    }

    pub fn stats(&self) -> HeapStats {
        self.heap.lock().as_ref().map(Heap::stats).unwrap_or_default()
    }
}

impl Default for PgAlloc {
    fn default() -> Self {
        Self::new()
    }
}

/// Memory errors are reported with a null pointer. A pointer that this
/// allocator never handed out means the heap can no longer be trusted, so
/// `dealloc` and `realloc` abort on it.
unsafe impl GlobalAlloc for PgAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.with_heap(|heap| heap.allocate_aligned(layout.size(), layout.align()))
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        self.with_heap(|heap| heap.zero_allocate_aligned(layout.size(), layout.align()))
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Err(err) = self.free(NonNull::new(ptr)) {
            abort_on_invalid_pointer("dealloc", ptr, err);
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let Some(old) = NonNull::new(ptr) else {
            return ptr::null_mut();
        };

        match self.resize_aligned(old, new_size, layout.align()) {
            Ok(new_ptr) => new_ptr.as_ptr(),
            Err(err @ AllocError::InvalidPointer) => abort_on_invalid_pointer("realloc", ptr, err),
            Err(_) => ptr::null_mut(),
        }
    }
}

fn abort_on_invalid_pointer(op: &str, ptr: *mut u8, err: AllocError) -> ! {
    log::error!("{op}({ptr:p}): {err}");
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::thread;

    #[test]
    fn heap_is_created_lazily() {
        let allocator = PgAlloc::new();
        assert!(allocator.heap.lock().is_none());
        assert_eq!(allocator.stats(), HeapStats::default());

        let ptr = allocator.allocate(64).unwrap();
        assert!(allocator.heap.lock().is_some());
        assert_eq!(allocator.stats().used_chunks, 1);

        allocator.free(Some(ptr)).unwrap();
        assert_eq!(allocator.stats().groups, 0);
    }

    #[test]
    fn global_alloc_round_trip() {
        let allocator = PgAlloc::with_config(Config::new().with_min_group_pages(2));

        unsafe {
            let layout = Layout::array::<u32>(16).unwrap();
            let ptr = allocator.alloc(layout).cast::<u32>();
            assert!(!ptr.is_null());

            for i in 0..16 {
                ptr.add(i).write(i as u32);
            }

            let grown = allocator.realloc(ptr.cast(), layout, 4096).cast::<u32>();
            assert!(!grown.is_null());
            for i in 0..16 {
                assert_eq!(grown.add(i).read(), i as u32);
            }

            allocator.dealloc(grown.cast(), Layout::from_size_align(4096, 4).unwrap());
        }

        assert_eq!(allocator.stats().groups, 0);
    }

    #[test]
    fn global_alloc_zeroed() {
        let allocator = PgAlloc::new();

        unsafe {
            let layout = Layout::from_size_align(80, 8).unwrap();
            let keep = allocator.alloc(Layout::new::<u64>());

            let dirty = allocator.alloc(layout);
            ptr::write_bytes(dirty, 0xFF, 80);
            allocator.dealloc(dirty, layout);

            let zeroed = allocator.alloc_zeroed(layout);
            assert_eq!(zeroed, dirty);
            assert!(std::slice::from_raw_parts(zeroed, 80).iter().all(|&b| b == 0));

            allocator.dealloc(zeroed, layout);
            allocator.dealloc(keep, Layout::new::<u64>());
        }
    }

    #[test]
    fn over_aligned_layouts() {
        let allocator = PgAlloc::new();

        unsafe {
            for (size, align) in [(1024, 64), (64, 4096)] {
                let layout = Layout::from_size_align(size, align).unwrap();

                let ptr = allocator.alloc(layout);
                assert!(!ptr.is_null());
                assert_eq!(ptr as usize % align, 0);
                ptr::write_bytes(ptr, 0x5A, size);

                let zeroed = allocator.alloc_zeroed(layout);
                assert!(!zeroed.is_null());
                assert_eq!(zeroed as usize % align, 0);
                assert!(std::slice::from_raw_parts(zeroed, size).iter().all(|&b| b == 0));

                let grown = allocator.realloc(ptr, layout, size * 8);
                assert!(!grown.is_null());
                assert_eq!(grown as usize % align, 0);
                assert!(std::slice::from_raw_parts(grown, size).iter().all(|&b| b == 0x5A));

                allocator.dealloc(grown, Layout::from_size_align(size * 8, align).unwrap());
                allocator.dealloc(zeroed, layout);
            }
        }

        assert_eq!(allocator.stats().groups, 0);
    }

    /// Names the `GlobalAlloc` method that [`abort_child`] misuses.
    const ABORT_CHILD: &str = "PGALLOC_ABORT_CHILD";

    /// Passes an already freed pointer to `dealloc` or `realloc`. Only does
    /// something when spawned by [`invalid_pointers_abort`].
    #[test]
    #[ignore = "spawned by invalid_pointers_abort"]
    fn abort_child() {
        let Ok(op) = std::env::var(ABORT_CHILD) else {
            return;
        };

        let allocator = PgAlloc::new();
        let layout = Layout::from_size_align(64, 8).unwrap();

        unsafe {
            let ptr = allocator.alloc(layout);
            allocator.dealloc(ptr, layout);

            match op.as_str() {
                "dealloc" => allocator.dealloc(ptr, layout),
                "realloc" => {
                    allocator.realloc(ptr, layout, 128);
                }
                _ => {}
            }
        }
    }

    #[cfg(unix)]
    #[test]
    fn invalid_pointers_abort() {
        use std::{
            os::unix::process::ExitStatusExt,
            process::{Command, Stdio},
        };

        let exe = std::env::current_exe().unwrap();

        for op in ["dealloc", "realloc"] {
            let status = Command::new(&exe)
                .args(["--ignored", "--exact", "tests::abort_child"])
                .env(ABORT_CHILD, op)
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .unwrap();

            assert_eq!(status.signal(), Some(libc::SIGABRT), "{op} of a freed pointer did not abort");
        }
    }

    #[test]
    fn realloc_reports_exhaustion_with_null() {
        let allocator = PgAlloc::new();

        unsafe {
            let layout = Layout::from_size_align(64, 8).unwrap();
            let ptr = allocator.alloc(layout);
            ptr::write_bytes(ptr, 3, 64);

            assert!(allocator.realloc(ptr, layout, isize::MAX as usize / 2).is_null());
            assert!(std::slice::from_raw_parts(ptr, 64).iter().all(|&b| b == 3));

            allocator.dealloc(ptr, layout);
        }

        assert_eq!(allocator.stats().groups, 0);
    }

    #[test]
    fn shared_between_threads() {
        static ALLOCATOR: PgAlloc = PgAlloc::new();

        let workers: Vec<_> = (0..4)
            .map(|t| {
                thread::spawn(move || {
                    let mut ptrs = Vec::new();

                    for i in 1..=50 {
                        let size = 24 * i;
                        let ptr = ALLOCATOR.allocate(size).unwrap();
                        unsafe { ptr::write_bytes(ptr.as_ptr(), t as u8, size) };
                        ptrs.push((ptr, size));
                    }

                    for (ptr, size) in ptrs {
                        let content = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), size) };
                        assert!(content.iter().all(|&b| b == t as u8));
                        ALLOCATOR.free(Some(ptr)).unwrap();
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(ALLOCATOR.stats(), HeapStats::default());
    }
}
