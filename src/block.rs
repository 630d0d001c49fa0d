/// A contiguous span of a chunk's address range, either handed out or free.
///
/// Blocks carry no in-band header: the block list of the owning
/// [`Chunk`](crate::chunk::Chunk) is kept outside the mapped memory, so the
/// whole span is usable and a block of `size` bytes covers exactly
/// `[addr, addr + size)`.
///
/// ```text
///  chunk.addr                                             chunk.addr + chunk.size
///  +--------------+------------------+--------------------------+
///  | Block (used) |   Block (free)   |       Block (used)       |
///  +--------------+------------------+--------------------------+
///  ^ addr         ^ addr + size (next block starts here, no gap)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    /// First byte of the block.
    pub addr: usize,
    /// Size of the block.
    pub size: usize,
    /// Flag to tell whether the block is free or not.
    pub is_free: bool,
}

impl Block {
    pub(crate) fn free(addr: usize, size: usize) -> Self {
        Self {
            addr,
            size,
            is_free: true,
        }
    }

    /// One past the last byte of the block.
    #[inline]
    pub fn end(&self) -> usize {
        self.addr + self.size
    }

    /// Whether `other` starts exactly where this block ends.
    #[inline]
    pub fn precedes(&self, other: &Block) -> bool {
        self.end() == other.addr
    }
}
