use std::{mem, ptr::NonNull};

use crate::chunk::{CHUNK_HEADER_SIZE, CHUNK_MAGIC, Chunk, ChunkState};

/// This is the overhead size introduced by the [`PageGroup`] header in bytes.
pub(crate) const GROUP_HEADER_SIZE: usize = mem::size_of::<PageGroup>();

/// The group cannot fit the requested chunk. Never leaves the crate: the
/// heap reacts by trying another group or mapping a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct OutOfSpace;

/// Header of a group of pages obtained from the [`crate::PageSource`]. It
/// occupies the first bytes of the mapping and the rest is carved into
/// [`Chunk`]s.
///
/// The operating system gives us memory in multiples of the page size, but
/// we cannot use a full mapping each time the user allocates memory since we
/// would be wasting a lot of space. Also, we cannot assume mappings are
/// adjacent. So the heap keeps a list of groups, and each group hands out
/// chunks from its own memory:
///
/// ```text
/// +-----------------------------------------------------------------+
/// |        | +-------+-------+-------+-------+                      |
/// | Header | | Chunk | Chunk | Chunk | Chunk |  unused tail         | ---> next group
/// |        | +-------+-------+-------+-------+                      |
/// +-----------------------------------------------------------------+
///          ^                                 ^                      ^
///          0                            bump_cursor              capacity
/// ```
///
/// Chunks tile `0..bump_cursor` without gaps, in address order. The tail
/// is carved by bumping the cursor, freed chunks are reused best-fit and
/// merged with free neighbours so two free chunks are never adjacent.
///
/// All byte counters below count whole spans (header plus content), so a
/// group whose every chunk is free has `free_bytes == capacity`.
#[repr(C, align(16))]
pub(crate) struct PageGroup {
    /// Pages backing this group, header included.
    pub total_pages: usize,
    /// Bytes available for chunks, i.e. the mapping minus this header.
    pub capacity: usize,
    /// Unused tail plus the spans of every free chunk.
    pub free_bytes: usize,
    /// Biggest span a single reservation can take, either a free chunk or
    /// the unused tail.
    pub largest_free_run: usize,
    /// Offset of the first never used byte.
    pub bump_cursor: usize,
    /// Content size of the chunk that ends at `bump_cursor`.
    pub last_chunk_size: usize,
    pub used_chunks: usize,
    pub free_chunks: usize,
    /// Next group of the heap.
    pub next: Option<NonNull<PageGroup>>,
}

/// Address ordered walk over the chunks of a group.
pub(crate) struct Chunks {
    base: NonNull<u8>,
    offset: usize,
    end: usize,
}

impl Iterator for Chunks {
    type Item = NonNull<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.end {
            return None;
        }

        unsafe {
            let chunk = self.base.add(self.offset).cast::<Chunk>();
            self.offset += chunk.as_ref().span();

            Some(chunk)
        }
    }
}

impl PageGroup {
    /// Writes a fresh group header at the start of a mapping of `pages`
    /// pages and returns it. The whole capacity starts as unused tail.
    ///
    /// **SAFETY**: `addr` must be a writable, page aligned mapping of
    /// `pages * page_size` bytes, larger than [`GROUP_HEADER_SIZE`].
    pub unsafe fn init(addr: NonNull<u8>, pages: usize, page_size: usize) -> NonNull<PageGroup> {
        let group = addr.cast::<PageGroup>();
        let capacity = pages * page_size - GROUP_HEADER_SIZE;

        unsafe {
            group.write(PageGroup {
                total_pages: pages,
                capacity,
                free_bytes: capacity,
                largest_free_run: capacity,
                bump_cursor: 0,
                last_chunk_size: 0,
                used_chunks: 0,
                free_chunks: 0,
                next: None,
            });
        }

        group
    }

    /// Quick check on whether a chunk of `size` content bytes can be
    /// reserved here, without walking the chunks.
    #[inline]
    pub fn fits(&self, size: usize) -> bool {
        size.checked_add(CHUNK_HEADER_SIZE)
            .is_some_and(|span| self.largest_free_run >= span)
    }

    /// True when no chunk of this group is in use.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.free_bytes == self.capacity
    }

    #[inline]
    fn tail(&self) -> usize {
        self.capacity - self.bump_cursor
    }

    /// Start of the chunk area, right after the header.
    #[inline]
    pub fn base(this: NonNull<Self>) -> NonNull<u8> {
        unsafe { this.cast::<u8>().add(GROUP_HEADER_SIZE) }
    }

    /// Whether `ptr` points somewhere inside the chunk area of this group.
    pub fn contains(this: NonNull<Self>, ptr: NonNull<u8>) -> bool {
        let start = Self::base(this).as_ptr() as usize;
        let capacity = unsafe { this.as_ref().capacity };

        (start..start + capacity).contains(&(ptr.as_ptr() as usize))
    }

    pub unsafe fn chunks(this: NonNull<Self>) -> Chunks {
        Chunks {
            base: Self::base(this),
            offset: 0,
            end: unsafe { this.as_ref().bump_cursor },
        }
    }

    #[inline]
    fn offset_of(this: NonNull<Self>, chunk: NonNull<Chunk>) -> usize {
        chunk.as_ptr() as usize - Self::base(this).as_ptr() as usize
    }

    /// The chunk right after `chunk` in memory, if any.
    unsafe fn next_chunk(this: NonNull<Self>, chunk: NonNull<Chunk>) -> Option<NonNull<Chunk>> {
        unsafe {
            let offset = Self::offset_of(this, chunk) + chunk.as_ref().span();

            (offset < this.as_ref().bump_cursor).then(|| Self::base(this).add(offset).cast())
        }
    }

    /// The chunk right before `chunk` in memory, if any.
    unsafe fn prev_chunk(this: NonNull<Self>, chunk: NonNull<Chunk>) -> Option<NonNull<Chunk>> {
        unsafe {
            let offset = Self::offset_of(this, chunk);
            if offset == 0 {
                return None;
            }

            let prev_span = CHUNK_HEADER_SIZE + chunk.as_ref().prev_size;
            Some(Self::base(this).add(offset - prev_span).cast())
        }
    }

    /// Propagates the size of `chunk` to whoever records it as "previous":
    /// the next chunk header, or the group itself if `chunk` is the last.
    unsafe fn sync_prev_size(mut this: NonNull<Self>, chunk: NonNull<Chunk>) {
        unsafe {
            let size = chunk.as_ref().size;

            match Self::next_chunk(this, chunk) {
                Some(mut next) => next.as_mut().prev_size = size,
                None => this.as_mut().last_chunk_size = size,
            }
        }
    }

    /// Reserves a chunk of `size` content bytes, which must be a multiple of
    /// [`crate::utils::ALIGNMENT`].
    ///
    /// Free chunks are preferred over the unused tail. Memory coming from
    /// the tail is still zero-filled, memory coming from a free chunk is not.
    pub unsafe fn reserve(this: NonNull<Self>, size: usize) -> Result<NonNull<Chunk>, OutOfSpace> {
        unsafe {
            match Self::find_best_fit(this, size) {
                Some(chunk) => {
                    Self::take(this, chunk, size);
                    Ok(chunk)
                }
                None => Self::bump(this, size),
            }
        }
    }

    /// Smallest free chunk that can hold `size` bytes. Ties go to the lowest
    /// address.
    unsafe fn find_best_fit(this: NonNull<Self>, size: usize) -> Option<NonNull<Chunk>> {
        unsafe {
            if this.as_ref().free_chunks == 0 {
                return None;
            }

            let mut best: Option<NonNull<Chunk>> = None;

            for chunk in Self::chunks(this) {
                let candidate = chunk.as_ref();
                if !candidate.is_free() || candidate.size < size {
                    continue;
                }

                if best.is_none_or(|best| candidate.size < best.as_ref().size) {
                    best = Some(chunk);
                    if candidate.size == size {
                        break;
                    }
                }
            }

            best
        }
    }

    /// Turns the free `chunk` into a used chunk of `size` bytes, splitting
    /// off the remainder when it is bigger than a header.
    unsafe fn take(mut this: NonNull<Self>, mut chunk: NonNull<Chunk>, size: usize) {
        unsafe {
            let group = this.as_mut();
            let old_span = chunk.as_ref().span();

            chunk.as_mut().state = ChunkState::Used;
            group.free_chunks -= 1;
            group.used_chunks += 1;
            group.free_bytes -= old_span;

            let slack = chunk.as_ref().size - size;
            if slack > CHUNK_HEADER_SIZE {
                Self::split(this, chunk, size);
                log::trace!("reused free chunk at {chunk:p}, split off {slack} bytes");
            } else {
                log::trace!("reused free chunk at {chunk:p} whole ({slack} bytes of slack)");
            }

            // Only the span we just consumed can have been the largest one.
            if old_span == this.as_ref().largest_free_run {
                Self::recompute_largest(this);
            }
        }
    }

    /// Shrinks `chunk` to `size` content bytes and turns the rest into a new
    /// free chunk placed right after it.
    ///
    /// **SAFETY**: `chunk.size - size` must be at least [`CHUNK_HEADER_SIZE`].
    unsafe fn split(mut this: NonNull<Self>, mut chunk: NonNull<Chunk>, size: usize) -> NonNull<Chunk> {
        unsafe {
            let rest_size = chunk.as_ref().size - size - CHUNK_HEADER_SIZE;
            chunk.as_mut().size = size;

            let rest_addr = Chunk::content(chunk).add(size);
            let rest = Chunk::write(rest_addr, rest_size, size, ChunkState::Free, this);
            Self::sync_prev_size(this, rest);

            let group = this.as_mut();
            group.free_chunks += 1;
            group.free_bytes += rest.as_ref().span();

            rest
        }
    }

    /// Carves a new used chunk from the unused tail.
    unsafe fn bump(mut this: NonNull<Self>, size: usize) -> Result<NonNull<Chunk>, OutOfSpace> {
        unsafe {
            let span = size.checked_add(CHUNK_HEADER_SIZE).ok_or(OutOfSpace)?;
            let old_tail = this.as_ref().tail();
            if span > old_tail {
                return Err(OutOfSpace);
            }

            let offset = this.as_ref().bump_cursor;
            let prev_size = this.as_ref().last_chunk_size;
            let addr = Self::base(this).add(offset);
            let chunk = Chunk::write(addr, size, prev_size, ChunkState::Used, this);

            let group = this.as_mut();
            group.bump_cursor += span;
            group.last_chunk_size = size;
            group.used_chunks += 1;
            group.free_bytes -= span;

            if old_tail == group.largest_free_run {
                Self::recompute_largest(this);
            }

            log::trace!("bumped {span} bytes at offset {offset}");

            Ok(chunk)
        }
    }

    /// Marks the used `chunk` as free and merges it with its free
    /// neighbours. Returns the resulting free chunk, which may start before
    /// `chunk`.
    pub unsafe fn release(mut this: NonNull<Self>, mut chunk: NonNull<Chunk>) -> NonNull<Chunk> {
        unsafe {
            chunk.as_mut().state = ChunkState::Free;

            let group = this.as_mut();
            group.used_chunks -= 1;
            group.free_chunks += 1;
            group.free_bytes += chunk.as_ref().span();

            Self::merge_with_next(this, chunk);
            let chunk = Self::merge_with_prev(this, chunk);

            let group = this.as_mut();
            group.largest_free_run = group.largest_free_run.max(chunk.as_ref().span());

            chunk
        }
    }

    /// Shrinks the used `chunk` in place to `size` bytes. The freed tail
    /// becomes a free chunk when it can hold a header, otherwise the chunk
    /// stays oversized.
    pub unsafe fn shrink(mut this: NonNull<Self>, chunk: NonNull<Chunk>, size: usize) {
        unsafe {
            let slack = chunk.as_ref().size - size;
            if slack < CHUNK_HEADER_SIZE {
                return;
            }

            let rest = Self::split(this, chunk, size);
            Self::merge_with_next(this, rest);

            let group = this.as_mut();
            group.largest_free_run = group.largest_free_run.max(rest.as_ref().span());

            log::trace!("shrunk chunk at {chunk:p} to {size} bytes, released {slack}");
        }
    }

    /// Moves the start of the used `chunk` forward by `gap` bytes. The first
    /// `gap` bytes become a free chunk, merged with the previous one if that
    /// is free too. Returns the header of the moved used chunk.
    ///
    /// **SAFETY**: `gap` must be a multiple of [`crate::utils::ALIGNMENT`],
    /// at least [`CHUNK_HEADER_SIZE`] and at most `chunk.size`.
    pub unsafe fn split_front(mut this: NonNull<Self>, chunk: NonNull<Chunk>, gap: usize) -> NonNull<Chunk> {
        unsafe {
            let size = chunk.as_ref().size;
            let prev_size = chunk.as_ref().prev_size;
            let lead_size = gap - CHUNK_HEADER_SIZE;

            // The new header lies inside the old content, past the old header.
            let used_addr = chunk.cast::<u8>().add(gap);
            let used = Chunk::write(used_addr, size - gap, lead_size, ChunkState::Used, this);
            Self::sync_prev_size(this, used);

            let lead = Chunk::write(chunk.cast(), lead_size, prev_size, ChunkState::Free, this);

            let group = this.as_mut();
            group.free_chunks += 1;
            group.free_bytes += gap;

            let lead = Self::merge_with_prev(this, lead);

            let group = this.as_mut();
            group.largest_free_run = group.largest_free_run.max(lead.as_ref().span());

            log::trace!("moved chunk at {chunk:p} forward by {gap} bytes to {used:p}");

            used
        }
    }

    /// Absorbs the chunk after the free `chunk` if it is free too.
    unsafe fn merge_with_next(mut this: NonNull<Self>, mut chunk: NonNull<Chunk>) {
        unsafe {
            let Some(mut next) = Self::next_chunk(this, chunk) else {
                return;
            };
            if !next.as_ref().is_free() {
                return;
            }

            chunk.as_mut().size += next.as_ref().span();
            // A stale pointer to the merged header must no longer validate.
            next.as_mut().magic = 0;
            this.as_mut().free_chunks -= 1;

            Self::sync_prev_size(this, chunk);
        }
    }

    /// Lets the chunk before the free `chunk` absorb it if that one is free.
    /// Returns whichever chunk now covers `chunk`.
    unsafe fn merge_with_prev(mut this: NonNull<Self>, mut chunk: NonNull<Chunk>) -> NonNull<Chunk> {
        unsafe {
            let Some(mut prev) = Self::prev_chunk(this, chunk) else {
                return chunk;
            };
            if !prev.as_ref().is_free() {
                return chunk;
            }

            prev.as_mut().size += chunk.as_ref().span();
            chunk.as_mut().magic = 0;
            this.as_mut().free_chunks -= 1;

            Self::sync_prev_size(this, prev);

            prev
        }
    }

    /// Full rescan of the free spans. Only needed when the largest span was
    /// consumed.
    unsafe fn recompute_largest(mut this: NonNull<Self>) {
        unsafe {
            let mut largest = this.as_ref().tail();

            if this.as_ref().free_chunks > 0 {
                for chunk in Self::chunks(this) {
                    if chunk.as_ref().is_free() {
                        largest = largest.max(chunk.as_ref().span());
                    }
                }
            }

            this.as_mut().largest_free_run = largest;
        }
    }

    /// Finds the used chunk whose content starts at `ptr`, or `None` if
    /// `ptr` is not such a pointer.
    ///
    /// **SAFETY**: `ptr` must satisfy [`PageGroup::contains`]. Only bytes
    /// inside the group are read.
    pub unsafe fn lookup(this: NonNull<Self>, ptr: NonNull<u8>) -> Option<NonNull<Chunk>> {
        unsafe {
            let offset = (ptr.as_ptr() as usize).checked_sub(Self::base(this).as_ptr() as usize)?;
            let bump_cursor = this.as_ref().bump_cursor;

            if offset < CHUNK_HEADER_SIZE || offset > bump_cursor || offset % mem::align_of::<Chunk>() != 0 {
                return None;
            }

            let chunk = Chunk::from_content(ptr);
            // Check the canary before trusting the rest of the header.
            if (&raw const (*chunk.as_ptr()).magic).read() != CHUNK_MAGIC {
                return None;
            }

            let header = chunk.as_ref();
            let valid = header.group == this
                && header.state == ChunkState::Used
                && header.size <= bump_cursor - offset;

            valid.then_some(chunk)
        }
    }
}

/// Panics if the layout or the accounting of a group is inconsistent.
#[cfg(test)]
pub(crate) unsafe fn verify(this: NonNull<PageGroup>) {
    unsafe {
        let group = this.as_ref();
        let mut offset = 0;
        let mut prev: Option<NonNull<Chunk>> = None;
        let (mut used, mut free, mut free_bytes, mut largest) = (0, 0, group.tail(), group.tail());

        for chunk in PageGroup::chunks(this) {
            let header = chunk.as_ref();
            assert_eq!(header.magic, CHUNK_MAGIC);
            assert_eq!(header.group, this);
            assert_eq!(PageGroup::offset_of(this, chunk), offset);
            assert_eq!(header.prev_size, prev.map_or(0, |p| p.as_ref().size));

            if header.is_free() {
                assert!(
                    !prev.is_some_and(|p| p.as_ref().is_free()),
                    "two adjacent free chunks"
                );
                free += 1;
                free_bytes += header.span();
                largest = largest.max(header.span());
            } else {
                used += 1;
            }

            offset += header.span();
            prev = Some(chunk);
        }

        assert_eq!(offset, group.bump_cursor);
        assert_eq!(group.last_chunk_size, prev.map_or(0, |p| p.as_ref().size));
        assert_eq!(group.used_chunks, used);
        assert_eq!(group.free_chunks, free);
        assert_eq!(group.free_bytes, free_bytes);
        assert_eq!(group.largest_free_run, largest);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{Kernel, PageSource};

    /// A group of `pages` pages mapped straight from the kernel.
    fn new_group(pages: usize) -> NonNull<PageGroup> {
        let mut kernel = Kernel;
        let page_size = kernel.page_size();
        let addr = kernel.reserve_pages(pages).unwrap();

        unsafe { PageGroup::init(addr, pages, page_size) }
    }

    fn drop_group(group: NonNull<PageGroup>) {
        unsafe {
            let pages = group.as_ref().total_pages;
            Kernel.release_pages(group.cast(), pages).unwrap();
        }
    }

    #[test]
    fn new_group_is_empty() {
        let group = new_group(1);

        unsafe {
            let header = group.as_ref();
            assert!(header.is_empty());
            assert_eq!(header.capacity, Kernel.page_size() - GROUP_HEADER_SIZE);
            assert_eq!(header.largest_free_run, header.capacity);
            assert!(PageGroup::chunks(group).next().is_none());
            verify(group);
        }

        drop_group(group);
    }

    #[test]
    fn bump_until_out_of_space() {
        let group = new_group(1);

        unsafe {
            let capacity = group.as_ref().capacity;
            let size = 64;
            let fits = capacity / (size + CHUNK_HEADER_SIZE);

            for _ in 0..fits {
                assert!(group.as_ref().fits(size));
                PageGroup::reserve(group, size).unwrap();
            }

            verify(group);
            assert_eq!(group.as_ref().used_chunks, fits);
            assert!(!group.as_ref().fits(size));
            assert_eq!(PageGroup::reserve(group, size), Err(OutOfSpace));
        }

        drop_group(group);
    }

    #[test]
    fn release_merges_both_neighbours() {
        let group = new_group(1);

        unsafe {
            let a = PageGroup::reserve(group, 32).unwrap();
            let b = PageGroup::reserve(group, 48).unwrap();
            let c = PageGroup::reserve(group, 64).unwrap();
            let _keep = PageGroup::reserve(group, 16).unwrap();

            PageGroup::release(group, a);
            PageGroup::release(group, c);
            verify(group);
            assert_eq!(group.as_ref().free_chunks, 2);

            let merged = PageGroup::release(group, b);
            verify(group);

            assert_eq!(merged, a);
            assert_eq!(group.as_ref().free_chunks, 1);
            assert_eq!(merged.as_ref().size, 32 + 48 + 64 + 2 * CHUNK_HEADER_SIZE);
            assert_eq!(b.as_ref().magic, 0);
        }

        drop_group(group);
    }

    #[test]
    fn reserve_prefers_best_fit_and_splits() {
        let group = new_group(1);

        unsafe {
            let big = PageGroup::reserve(group, 512).unwrap();
            let _k1 = PageGroup::reserve(group, 16).unwrap();
            let small = PageGroup::reserve(group, 128).unwrap();
            let _k2 = PageGroup::reserve(group, 16).unwrap();

            PageGroup::release(group, big);
            PageGroup::release(group, small);

            let chunk = PageGroup::reserve(group, 96).unwrap();
            assert_eq!(chunk, small);
            // 32 bytes of slack is not enough for a header.
            assert_eq!(chunk.as_ref().size, 128);

            let chunk = PageGroup::reserve(group, 64).unwrap();
            assert_eq!(chunk, big);
            assert_eq!(chunk.as_ref().size, 64);
            assert_eq!(group.as_ref().free_chunks, 1);
            verify(group);
        }

        drop_group(group);
    }

    #[test]
    fn largest_free_run_tracks_consumed_span() {
        let group = new_group(1);

        unsafe {
            let half = group.as_ref().capacity / 2 & !(crate::utils::ALIGNMENT - 1);
            let big = PageGroup::reserve(group, half).unwrap();
            let _keep = PageGroup::reserve(group, 16).unwrap();
            PageGroup::release(group, big);

            assert_eq!(group.as_ref().largest_free_run, big.as_ref().span());

            PageGroup::reserve(group, half).unwrap();
            verify(group);
            assert_eq!(group.as_ref().largest_free_run, group.as_ref().tail());
        }

        drop_group(group);
    }

    #[test]
    fn shrink_frees_the_tail() {
        let group = new_group(1);

        unsafe {
            let chunk = PageGroup::reserve(group, 512).unwrap();
            let after = PageGroup::reserve(group, 64).unwrap();
            PageGroup::release(group, after);

            PageGroup::shrink(group, chunk, 64);
            verify(group);

            assert_eq!(chunk.as_ref().size, 64);
            assert_eq!(group.as_ref().free_chunks, 1);
            assert_eq!(after.as_ref().magic, 0);

            // Small shrinks leave the chunk as it is.
            PageGroup::shrink(group, chunk, 48);
            assert_eq!(chunk.as_ref().size, 64);
        }

        drop_group(group);
    }

    #[test]
    fn split_front_leaves_a_free_lead() {
        let group = new_group(1);

        unsafe {
            let a = PageGroup::reserve(group, 256).unwrap();
            let b = PageGroup::reserve(group, 512).unwrap();
            let _keep = PageGroup::reserve(group, 16).unwrap();

            let moved = PageGroup::split_front(group, b, 128);
            verify(group);

            assert_eq!(PageGroup::offset_of(group, moved), PageGroup::offset_of(group, b) + 128);
            assert_eq!(moved.as_ref().size, 512 - 128);
            assert!(b.as_ref().is_free());
            assert_eq!(b.as_ref().size, 128 - CHUNK_HEADER_SIZE);
            assert_eq!(PageGroup::lookup(group, Chunk::content(moved)), Some(moved));
            assert_eq!(PageGroup::lookup(group, Chunk::content(b)), None);

            // A free chunk before the lead absorbs it.
            PageGroup::release(group, a);
            let moved_again = PageGroup::split_front(group, moved, CHUNK_HEADER_SIZE);
            verify(group);

            assert_eq!(group.as_ref().free_chunks, 1);
            assert_eq!(a.as_ref().size, 256 + 128 + CHUNK_HEADER_SIZE);
            assert_eq!(moved_again.as_ref().size, 512 - 128 - CHUNK_HEADER_SIZE);
            assert_eq!(moved.as_ref().magic, 0);
        }

        drop_group(group);
    }

    #[test]
    fn lookup_only_accepts_used_chunks() {
        let group = new_group(1);

        unsafe {
            let a = PageGroup::reserve(group, 64).unwrap();
            let b = PageGroup::reserve(group, 64).unwrap();
            let ptr = Chunk::content(a);

            assert_eq!(PageGroup::lookup(group, ptr), Some(a));
            assert_eq!(PageGroup::lookup(group, ptr.add(16)), None);
            assert_eq!(PageGroup::lookup(group, PageGroup::base(group)), None);

            PageGroup::release(group, a);
            assert_eq!(PageGroup::lookup(group, ptr), None);
            assert_eq!(PageGroup::lookup(group, Chunk::content(b)), Some(b));
        }

        drop_group(group);
    }
}
