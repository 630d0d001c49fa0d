use std::{io, ptr::NonNull, sync::Arc};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    block::Block,
    error::{Error, Result},
    kernel::PageSource,
    list::{List, NodeId},
    utils::align,
};

/// Stable identifier of a block inside its chunk.
pub type BlockId = NodeId;

/// Shared, lockable reference to a chunk. The lock is the transaction
/// boundary for every split, merge and counter update on that chunk.
pub type ChunkRef = Arc<Mutex<Chunk>>;

/// One region obtained from the [`PageSource`], partitioned into [`Block`]s.
///
/// The page source gives us regions aligned with the computer page size.
/// We cannot hand a full region to each request since we would be wasting a
/// lot of space, and we cannot assume regions are adjacent. So the heap is a
/// list of chunks, each of which holds a list of blocks:
///
/// ```text
/// +-----------------------------------------------+      +-----------------------------------------------+
/// |       | +-------+    +-------+    +-------+   |      |       | +-------+    +-------+    +-------+   |
/// | Chunk | | Block | -> | Block | -> | Block |   | ---> | Chunk | | Block | -> | Block | -> | Block |   |
/// |       | +-------+    +-------+    +-------+   |      |       | +-------+    +-------+    +-------+   |
/// +-----------------------------------------------+      +-----------------------------------------------+
/// ```
///
/// Blocks are kept in address order and always cover the whole chunk: the
/// sizes add up to the chunk size and each block starts where the previous
/// one ends. No two free blocks are left adjacent once a free completes.
pub struct Chunk {
    /// Start of the region returned by the page source.
    addr: usize,
    /// Size of the region, a multiple of the page size.
    size: usize,
    /// Bytes not covered by used blocks.
    free_bytes: usize,
    /// Blocks of the chunk, in address order.
    blocks: List<Block>,
    source: Arc<dyn PageSource>,
    released: bool,
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("addr", &format_args!("{:#x}", self.addr))
            .field("size", &self.size)
            .field("free_bytes", &self.free_bytes)
            .field("blocks", &self.blocks.len())
            .field("released", &self.released)
            .finish()
    }
}

impl Chunk {
    /// Maps a new chunk able to hold `size` bytes, rounded up to the next
    /// multiple of the page size. The chunk starts as one free block.
    pub(crate) fn map(source: &Arc<dyn PageSource>, size: usize) -> Result<Self> {
        let Some(size) = align(size.max(1), source.page_size()) else {
            return Err(Error::AllocationFailed {
                size,
                source: io::ErrorKind::OutOfMemory.into(),
            });
        };

        let addr = source
            .request_memory(size)
            .map_err(|source| Error::AllocationFailed { size, source })?
            .as_ptr() as usize;

        let mut blocks = List::new();
        blocks.append(Block::free(addr, size));

        debug!(addr, size, "mapped chunk");

        Ok(Self {
            addr,
            size,
            free_bytes: size,
            blocks,
            source: Arc::clone(source),
            released: false,
        })
    }

    #[inline]
    pub fn addr(&self) -> usize {
        self.addr
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn free_bytes(&self) -> usize {
        self.free_bytes
    }

    /// Whether every byte of the chunk is free.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.free_bytes == self.size
    }

    /// Whether the mapping was already handed back to the page source.
    #[inline]
    pub fn is_released(&self) -> bool {
        self.released
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.addr && addr < self.addr + self.size
    }

    pub fn block(&self, id: BlockId) -> Option<&Block> {
        self.blocks.get(id)
    }

    pub fn blocks(&self) -> impl Iterator<Item = &Block> + '_ {
        self.blocks.iter()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Size of the biggest free block.
    pub fn largest_free_span(&self) -> usize {
        self.blocks
            .iter()
            .filter(|block| block.is_free)
            .map(|block| block.size)
            .max()
            .unwrap_or(0)
    }

    /// Whether [`Chunk::find_free_block_for_size`] would succeed for `size`.
    pub fn fits(&self, size: usize) -> bool {
        self.free_bytes >= size && self.blocks.iter().any(|block| block.is_free && block.size >= size)
    }

    /// First-fit scan over the blocks in address order.
    ///
    /// A free block larger than `size` is split and its prefix handed out; a
    /// free block of exactly `size` is handed out whole. Returns the address
    /// and the id of the used block.
    pub fn find_free_block_for_size(&mut self, size: usize) -> Option<(usize, BlockId)> {
        let mut current = self.blocks.first();

        while let Some(id) = current {
            let block = *self.blocks.get(id)?;

            if block.is_free && block.size > size {
                return self.split(id, size).map(|addr| (addr, id));
            }

            if block.is_free && block.size == size {
                if let Some(block) = self.blocks.get_mut(id) {
                    block.is_free = false;
                }
                self.free_bytes -= size;
                return Some((block.addr, id));
            }

            current = self.blocks.next(id);
        }

        None
    }

    /// Splits free block `id` into a used prefix of `size` bytes and a free
    /// suffix holding the rest, inserted right after it. Returns the address
    /// of the prefix, or `None` if the block is not free or not larger than `size`.
    pub fn split(&mut self, id: BlockId, size: usize) -> Option<usize> {
        let block = self.blocks.get_mut(id)?;
        if !block.is_free || block.size <= size {
            return None;
        }

        let suffix = Block::free(block.addr + size, block.size - size);
        block.size = size;
        block.is_free = false;
        let addr = block.addr;

        self.blocks.insert_after(id, suffix);
        self.free_bytes -= size;

        Some(addr)
    }

    /// Marks used block `id` as free and gives its bytes back to the free
    /// counter. Returns the size released, or `None` if the block was not in use.
    pub(crate) fn mark_free(&mut self, id: BlockId) -> Option<usize> {
        let block = self.blocks.get_mut(id)?;
        if block.is_free {
            return None;
        }

        block.is_free = true;
        let size = block.size;
        self.free_bytes += size;

        Some(size)
    }

    /// Coalesces free block `id` with every address-contiguous free
    /// neighbour, backwards then forwards. Returns the id of the surviving
    /// block, which is `id` unless a predecessor absorbed it.
    pub fn merge_adjacent(&mut self, id: BlockId) -> BlockId {
        let mut current = id;

        while let Some(prev) = self.blocks.prev(current) {
            let (Some(&before), Some(&block)) = (self.blocks.get(prev), self.blocks.get(current)) else {
                break;
            };
            if !before.is_free || !block.is_free || !before.precedes(&block) {
                break;
            }

            self.blocks.remove(current);
            if let Some(before) = self.blocks.get_mut(prev) {
                before.size += block.size;
            }
            current = prev;
        }

        while let Some(next) = self.blocks.next(current) {
            let (Some(&block), Some(&after)) = (self.blocks.get(current), self.blocks.get(next)) else {
                break;
            };
            if !block.is_free || !after.is_free || !block.precedes(&after) {
                break;
            }

            self.blocks.remove(next);
            if let Some(block) = self.blocks.get_mut(current) {
                block.size += after.size;
            }
        }

        current
    }

    /// Hands the mapping back to the page source. Blocks are dropped with it.
    pub(crate) fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }

        let (addr, size) = (self.addr, self.size);
        let Some(ptr) = NonNull::new(addr as *mut u8) else {
            return Err(Error::InvalidAddress { addr });
        };

        unsafe { self.source.return_memory(ptr, size) }
            .map_err(|source| Error::ReleaseFailed { addr, size, source })?;

        self.released = true;
        self.blocks = List::new();
        self.free_bytes = 0;

        debug!(addr, size, "released chunk");

        Ok(())
    }

    /// Checks that blocks partition the chunk and that no two free blocks touch.
    #[cfg(test)]
    pub(crate) fn is_consistent(&self) -> bool {
        let mut expected = self.addr;
        let mut free = 0;
        let mut prev_free = false;

        for block in self.blocks.iter() {
            if block.addr != expected || block.size == 0 || (prev_free && block.is_free) {
                return false;
            }
            if block.is_free {
                free += block.size;
            }
            prev_free = block.is_free;
            expected = block.end();
        }

        expected == self.addr + self.size && free == self.free_bytes
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            warn!(%err, "could not release chunk on drop");
        }
    }
}

/// Point-in-time view of one chunk, used for inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkStats {
    pub addr: usize,
    pub size: usize,
    pub free_bytes: usize,
    pub blocks: usize,
    pub free_blocks: usize,
    pub largest_free_span: usize,
}

impl From<&Chunk> for ChunkStats {
    fn from(chunk: &Chunk) -> Self {
        Self {
            addr: chunk.addr,
            size: chunk.size,
            free_bytes: chunk.free_bytes,
            blocks: chunk.block_count(),
            free_blocks: chunk.blocks().filter(|block| block.is_free).count(),
            largest_free_span: chunk.largest_free_span(),
        }
    }
}

/// The heap: every chunk mapped so far, in the order they were mapped.
///
/// The list owns its chunks; chunks know nothing about each other. It
/// always holds at least one chunk.
pub struct ChunkList {
    chunks: List<ChunkRef>,
    source: Arc<dyn PageSource>,
    page_size: usize,
}

impl ChunkList {
    /// Creates the list with a single chunk of one page.
    pub(crate) fn new(source: Arc<dyn PageSource>) -> Result<Self> {
        let page_size = source.page_size();
        let mut list = Self {
            chunks: List::new(),
            source,
            page_size,
        };
        list.grow(page_size)?;

        Ok(list)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChunkRef> + '_ {
        self.chunks.iter()
    }

    /// Maps a chunk of at least `size` bytes and links it at the tail.
    pub fn grow(&mut self, size: usize) -> Result<ChunkRef> {
        let chunk = Arc::new(Mutex::new(Chunk::map(&self.source, size)?));
        self.chunks.append(Arc::clone(&chunk));

        Ok(chunk)
    }

    /// Free bytes across every chunk. Locks each chunk in turn.
    pub fn free_bytes(&self) -> usize {
        self.chunks.iter().map(|chunk| chunk.lock().free_bytes()).sum()
    }

    /// Free bytes across every chunk but `excluded`, for callers already
    /// holding that chunk's lock.
    pub(crate) fn free_bytes_excluding(&self, excluded: &ChunkRef) -> usize {
        self.chunks
            .iter()
            .filter(|chunk| !Arc::ptr_eq(chunk, excluded))
            .map(|chunk| chunk.lock().free_bytes())
            .sum()
    }

    /// Removes `chunk` from the list. Returns `false` if it was not linked.
    pub(crate) fn unlink(&mut self, chunk: &ChunkRef) -> bool {
        match self.chunks.position(|linked| Arc::ptr_eq(linked, chunk)) {
            Some(id) => {
                self.chunks.remove(id);
                true
            }
            None => false,
        }
    }

    pub fn stats(&self) -> Vec<ChunkStats> {
        self.chunks
            .iter()
            .map(|chunk| ChunkStats::from(&*chunk.lock()))
            .collect()
    }
}
