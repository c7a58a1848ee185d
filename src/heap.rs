use std::ptr::{self, NonNull};

use crate::{
    chunk::{CHUNK_HEADER_SIZE, Chunk},
    config::Config,
    error::AllocError,
    group::{GROUP_HEADER_SIZE, PageGroup},
    kernel::{Kernel, PageSource},
    utils::{ALIGNMENT, align},
};

/// Snapshot of the heap's bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Page groups currently mapped.
    pub groups: usize,
    /// Bytes mapped from the page source, group headers included.
    pub mapped_bytes: usize,
    /// Bytes that can still be reserved: unused tails plus free chunks.
    pub free_bytes: usize,
    pub used_chunks: usize,
    pub free_chunks: usize,
}

/// The allocator state and the allocation engine on top of it.
///
/// A `Heap` owns a chain of [`PageGroup`]s obtained from its
/// [`PageSource`] and carves them into chunks. It has a single owner and
/// every operation takes `&mut self`; see [`crate::PgAlloc`] for the shared,
/// lock protected instance.
///
/// ```text
///   Heap
///    |
///    v
/// +-------+-----------------+      +-------+-----------------+
/// | Group | chunks ... tail | ---> | Group | chunks ... tail | ---> None
/// +-------+-----------------+      +-------+-----------------+
/// ```
///
/// Pointers handed out are 16-byte aligned and stay valid until they are
/// freed, resized or the heap is dropped. Dropping the heap returns every
/// group to the page source.
pub struct Heap<S: PageSource = Kernel> {
    source: S,
    config: Config,
    /// Queried once from the source when the heap is created.
    page_size: usize,
    groups: Option<NonNull<PageGroup>>,
}

// The groups are exclusively owned by the heap, nothing else points into
// them except the user pointers it handed out.
unsafe impl<S: PageSource + Send> Send for Heap<S> {}

impl Heap<Kernel> {
    /// A heap backed by the operating system with the default [`Config`].
    pub fn new() -> Self {
        Self::with_config(Kernel, Config::new())
    }
}

impl Default for Heap<Kernel> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: PageSource> Heap<S> {
    pub fn with_source(source: S) -> Self {
        Self::with_config(source, Config::new())
    }

    pub fn with_config(mut source: S, config: Config) -> Self {
        let page_size = source.page_size();
        debug_assert!(page_size.is_power_of_two(), "page size {page_size} is not a power of two");

        Self {
            source,
            config,
            page_size,
            groups: None,
        }
    }

    #[inline]
    pub fn config(&self) -> Config {
        self.config
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Allocates `size` bytes.
    ///
    /// Memory that was never handed out before is zero-filled, but memory
    /// recycled from a freed chunk is not: callers must treat the content as
    /// uninitialized and use [`Heap::zero_allocate`] if they need zeroes.
    ///
    /// `size == 0` is allowed and returns a unique pointer backed by a
    /// minimum sized chunk. It has to be freed like any other.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let size = Self::chunk_size(size)?;
        let chunk = self.reserve(size)?;

        Ok(Chunk::content(chunk))
    }

    /// Allocates room for `count` elements of `size` bytes and fills all of
    /// it with zeroes.
    pub fn zero_allocate(&mut self, count: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
        let total = count.checked_mul(size).ok_or(AllocError::Overflow)?;
        let ptr = self.allocate(total)?;
        Self::zero_fill(ptr);

        Ok(ptr)
    }

    /// Allocates `size` bytes whose address is a multiple of `align`.
    ///
    /// Alignments up to [`ALIGNMENT`] are what [`Heap::allocate`] gives
    /// anyway. Bigger ones reserve `align + CHUNK_HEADER_SIZE` extra bytes,
    /// turn the bytes in front of the aligned address into a free chunk and
    /// give the unneeded tail back, so the result is an ordinary chunk that
    /// [`Heap::free`] and [`Heap::resize`] accept.
    pub fn allocate_aligned(&mut self, size: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
        if !align.is_power_of_two() {
            return Err(AllocError::InvalidAlignment);
        }
        if align <= ALIGNMENT {
            return self.allocate(size);
        }

        let size = Self::chunk_size(size)?;
        let padded = align
            .checked_add(CHUNK_HEADER_SIZE)
            .and_then(|extra| size.checked_add(extra))
            .ok_or(AllocError::Overflow)?;

        let mut chunk = self.reserve(padded)?;

        unsafe {
            let group = chunk.as_ref().group;
            let content = Chunk::content(chunk).as_ptr() as usize;

            if content % align != 0 {
                // Leave room for the header of the free chunk in front.
                let aligned = (content + CHUNK_HEADER_SIZE).next_multiple_of(align);
                chunk = PageGroup::split_front(group, chunk, aligned - content);
            }

            PageGroup::shrink(group, chunk, size);
        }

        Ok(Chunk::content(chunk))
    }

    /// [`Heap::allocate_aligned`] with the usable bytes filled with zeroes.
    pub fn zero_allocate_aligned(&mut self, size: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
        let ptr = self.allocate_aligned(size, align)?;
        Self::zero_fill(ptr);

        Ok(ptr)
    }

    /// Changes the size of the allocation at `ptr` to `size` bytes.
    ///
    /// - `ptr == None` behaves as [`Heap::allocate`].
    /// - `size == 0` frees `ptr` and returns `Ok(None)`.
    /// - Shrinking happens in place and returns the same pointer.
    /// - Growing moves the content to a new chunk. If that fails the old
    ///   pointer and its content are left untouched.
    pub fn resize(&mut self, ptr: Option<NonNull<u8>>, size: usize) -> Result<Option<NonNull<u8>>, AllocError> {
        let Some(ptr) = ptr else {
            return self.allocate(size).map(Some);
        };

        if size == 0 {
            self.free(Some(ptr))?;
            return Ok(None);
        }

        let (group, chunk) = self.find_chunk(ptr)?;
        let new_size = Self::chunk_size(size)?;
        let old_size = unsafe { chunk.as_ref().size };

        if new_size <= old_size {
            unsafe { PageGroup::shrink(group, chunk, new_size) };
            return Ok(Some(ptr));
        }

        let new_ptr = Chunk::content(self.reserve(new_size)?);
        self.relocate(ptr, group, chunk, new_ptr);

        Ok(Some(new_ptr))
    }

    /// [`Heap::resize`] for an allocation made by
    /// [`Heap::allocate_aligned`] with the same `align`. The result keeps
    /// that alignment. `size == 0` shrinks to the minimum chunk instead of
    /// freeing.
    pub fn resize_aligned(&mut self, ptr: NonNull<u8>, size: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
        if !align.is_power_of_two() {
            return Err(AllocError::InvalidAlignment);
        }

        let (group, chunk) = self.find_chunk(ptr)?;
        let new_size = Self::chunk_size(size)?;
        let old_size = unsafe { chunk.as_ref().size };

        if new_size <= old_size {
            unsafe { PageGroup::shrink(group, chunk, new_size) };
            return Ok(ptr);
        }

        let new_ptr = self.allocate_aligned(new_size, align)?;
        self.relocate(ptr, group, chunk, new_ptr);

        Ok(new_ptr)
    }

    /// Frees the allocation at `ptr`. `None` is a no-op.
    ///
    /// Pointers that were not returned by this heap, or were already freed,
    /// are rejected with [`AllocError::InvalidPointer`] and nothing changes.
    pub fn free(&mut self, ptr: Option<NonNull<u8>>) -> Result<(), AllocError> {
        let Some(ptr) = ptr else {
            return Ok(());
        };

        let (group, chunk) = self.find_chunk(ptr)?;
        let chunk = unsafe { PageGroup::release(group, chunk) };

        log::trace!("freed {ptr:p}, free chunk at {chunk:p}");

        self.retire_if_empty(group);

        Ok(())
    }

    /// Bytes usable at `ptr`, which can be more than were requested.
    pub fn usable_size(&self, ptr: NonNull<u8>) -> Result<usize, AllocError> {
        let (_, chunk) = self.find_chunk(ptr)?;

        Ok(unsafe { chunk.as_ref().size })
    }

    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats::default();

        for group in self.groups() {
            let group = unsafe { group.as_ref() };
            stats.groups += 1;
            stats.mapped_bytes += group.total_pages * self.page_size;
            stats.free_bytes += group.free_bytes;
            stats.used_chunks += group.used_chunks;
            stats.free_chunks += group.free_chunks;
        }

        stats
    }

    /// Copies the content of the used `chunk` at `ptr` to the bigger
    /// allocation at `new_ptr`, then frees `chunk`.
    fn relocate(&mut self, ptr: NonNull<u8>, group: NonNull<PageGroup>, chunk: NonNull<Chunk>, new_ptr: NonNull<u8>) {
        unsafe {
            let old_size = chunk.as_ref().size;
            ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), old_size);
            PageGroup::release(group, chunk);

            log::trace!("moved {old_size} bytes from {ptr:p} to {new_ptr:p}");
        }

        self.retire_if_empty(group);
    }

    fn zero_fill(ptr: NonNull<u8>) {
        unsafe {
            let usable = Chunk::from_content(ptr).as_ref().size;
            ptr::write_bytes(ptr.as_ptr(), 0, usable);
        }
    }

    /// Content size of the chunk that serves a request of `size` bytes.
    fn chunk_size(size: usize) -> Result<usize, AllocError> {
        align(size.max(1), ALIGNMENT).ok_or(AllocError::Overflow)
    }

    fn groups(&self) -> impl Iterator<Item = NonNull<PageGroup>> + '_ {
        std::iter::successors(self.groups, |group| unsafe { group.as_ref().next })
    }

    /// Reserves a chunk of `size` content bytes in the first group that
    /// can hold it, mapping a new group if none can.
    fn reserve(&mut self, size: usize) -> Result<NonNull<Chunk>, AllocError> {
        let group = self.choose_or_create_group(size)?;

        // A group that passed `fits` always has either a free chunk or tail
        // big enough.
        unsafe { PageGroup::reserve(group, size) }.map_err(|_| AllocError::OutOfMemory)
    }

    /// First group of the chain whose largest free run can take a chunk of
    /// `size` bytes. When there is none, maps a new group big enough for it
    /// and appends it to the chain.
    fn choose_or_create_group(&mut self, size: usize) -> Result<NonNull<PageGroup>, AllocError> {
        if let Some(group) = self.groups().find(|group| unsafe { group.as_ref().fits(size) }) {
            return Ok(group);
        }

        let needed = size
            .checked_add(CHUNK_HEADER_SIZE + GROUP_HEADER_SIZE)
            .ok_or(AllocError::Overflow)?;
        let pages = needed.div_ceil(self.page_size).max(self.config.min_group_pages);

        let addr = self.source.reserve_pages(pages)?;
        let group = unsafe { PageGroup::init(addr, pages, self.page_size) };

        let last = self.groups().last();
        match last {
            Some(mut last) => unsafe { last.as_mut().next = Some(group) },
            None => self.groups = Some(group),
        }

        log::debug!("mapped page group of {pages} pages at {group:p} for a {size} byte chunk");

        Ok(group)
    }

    /// Returns `group` to the page source if none of its chunks is in use.
    fn retire_if_empty(&mut self, group: NonNull<PageGroup>) {
        unsafe {
            if !group.as_ref().is_empty() {
                return;
            }

            let next = group.as_ref().next;
            let prev = self.groups().find(|candidate| candidate.as_ref().next == Some(group));
            let pages = group.as_ref().total_pages;

            if let Err(err) = self.source.release_pages(group.cast(), pages) {
                // Still mapped, so it stays in the chain and remains usable.
                log::warn!("could not release page group at {group:p}: {err}");
                return;
            }

            match prev {
                Some(mut prev) => prev.as_mut().next = next,
                None => self.groups = next,
            }
        }

        log::debug!("released empty page group at {group:p}");
    }

    /// Locates the used chunk whose content starts at `ptr`.
    ///
    /// The owning group is found by address first, so nothing outside of
    /// memory this heap mapped is ever read.
    fn find_chunk(&self, ptr: NonNull<u8>) -> Result<(NonNull<PageGroup>, NonNull<Chunk>), AllocError> {
        let found = self
            .groups()
            .find(|&group| PageGroup::contains(group, ptr))
            .and_then(|group| unsafe { PageGroup::lookup(group, ptr) }.map(|chunk| (group, chunk)));

        found.ok_or_else(|| {
            log::warn!("rejected pointer {ptr:p}: not a live allocation");
            AllocError::InvalidPointer
        })
    }
}

impl<S: PageSource> Drop for Heap<S> {
    fn drop(&mut self) {
        let mut current = self.groups.take();

        while let Some(group) = current {
            unsafe {
                current = group.as_ref().next;
                let pages = group.as_ref().total_pages;

                if let Err(err) = self.source.release_pages(group.cast(), pages) {
                    log::warn!("could not release page group at {group:p}: {err}");
                }
            }
        }
    }
}
