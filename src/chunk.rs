use std::{mem, ptr::NonNull};

use crate::group::PageGroup;

/// Header size of a chunk. It is a multiple of [`crate::utils::ALIGNMENT`]
/// so the content placed right after it is always aligned.
pub(crate) const CHUNK_HEADER_SIZE: usize = mem::size_of::<Chunk>();

/// Canary written into every chunk header. A pointer whose header does not
/// carry it was not handed out by this allocator.
pub(crate) const CHUNK_MAGIC: usize = 0x5AFE_C4A7_u32 as usize;

/// Whether the content of a chunk belongs to the user or can be reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum ChunkState {
    Used,
    Free,
}

/// This is the structure of a chunk. The fields of the chunk are its
/// metadata, content is placed after this header.
///
/// ```text
/// +---------------------+ <------+
/// |        magic        |        |
/// +---------------------+        |
/// |        size         |        |
/// +---------------------+        |
/// |      prev_size      |        | -> Header
/// +---------------------+        |
/// |        group        |        |
/// +---------------------+        |
/// |        state        |        |
/// +---------------------+ <------+ <-- pointer handed to the user
/// |       Content       |        |
/// |         ...         |        | -> `size` addressable bytes
/// |                     |        |
/// +---------------------+ <------+ <-- header of the next chunk
/// ```
///
/// Chunks are laid out back to back inside their [`PageGroup`], so the next
/// chunk in address order is found at `header + CHUNK_HEADER_SIZE + size`
/// and the previous one at `header - prev_size - CHUNK_HEADER_SIZE`.
#[repr(C, align(16))]
pub(crate) struct Chunk {
    /// Always [`CHUNK_MAGIC`] for a chunk that exists.
    pub magic: usize,
    /// Usable bytes after the header.
    pub size: usize,
    /// Usable bytes of the previous chunk in address order, zero for the
    /// first chunk of a group.
    pub prev_size: usize,
    /// Group which the chunk belongs to.
    pub group: NonNull<PageGroup>,
    /// Used or free.
    pub state: ChunkState,
}

impl Chunk {
    /// Number of bytes this chunk occupies in its group, header included.
    #[inline]
    pub fn span(&self) -> usize {
        CHUNK_HEADER_SIZE + self.size
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        self.state == ChunkState::Free
    }

    /// Pointer to the content of `chunk`.
    #[inline]
    pub fn content(chunk: NonNull<Chunk>) -> NonNull<u8> {
        unsafe { chunk.cast::<u8>().add(CHUNK_HEADER_SIZE) }
    }

    /// Header of the chunk whose content starts at `ptr`. This is plain
    /// pointer arithmetic, nothing is read.
    #[inline]
    pub fn from_content(ptr: NonNull<u8>) -> NonNull<Chunk> {
        unsafe { ptr.sub(CHUNK_HEADER_SIZE).cast() }
    }

    /// Writes a new header at `addr`.
    ///
    /// **SAFETY**: `addr` must be aligned and point to at least
    /// [`CHUNK_HEADER_SIZE`] writable bytes inside `group`.
    pub unsafe fn write(
        addr: NonNull<u8>,
        size: usize,
        prev_size: usize,
        state: ChunkState,
        group: NonNull<PageGroup>,
    ) -> NonNull<Chunk> {
        let chunk = addr.cast::<Chunk>();

        unsafe {
            chunk.write(Chunk {
                magic: CHUNK_MAGIC,
                size,
                prev_size,
                group,
                state,
            });
        }

        chunk
    }
}
