//! Allocation and free transactions against the chunk list.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, trace};

use crate::{
    allocator::AllocatedBlock,
    chunk::{ChunkList, ChunkRef},
    error::{Error, Result},
    policy::{AllocationPolicy, FirstFit},
};

/// Runs one allocation or one free as a single transaction.
///
/// Locks are always taken list first, then chunk. The list lock guards chunk
/// insertion and removal; a chunk's lock guards its blocks and free counter.
pub trait AllocationStrategy: Send + Sync {
    /// Carves `size` bytes out of the heap.
    fn allocate(&self, chunks: &Mutex<ChunkList>, size: usize) -> Result<AllocatedBlock>;

    /// Gives `block` back to its chunk. Fails with [`Error::AlreadyFreed`]
    /// on a handle that was freed before.
    fn free(&self, chunks: &Mutex<ChunkList>, block: &mut AllocatedBlock) -> Result<()>;
}

/// Splits free blocks on allocation and merges neighbours on free. Chunks
/// that become entirely free are unmapped as long as the heap keeps more
/// than a page of free space and at least one chunk.
pub struct SplitMerge {
    policy: Box<dyn AllocationPolicy>,
}

impl Default for SplitMerge {
    fn default() -> Self {
        Self::new(Box::new(FirstFit::new()))
    }
}

impl SplitMerge {
    pub fn new(policy: Box<dyn AllocationPolicy>) -> Self {
        Self { policy }
    }

    /// Unlinks and unmaps `chunk` if it is still entirely free, is not the
    /// last chunk, and the heap has more than a page free including it.
    fn release_if_surplus(&self, chunks: &Mutex<ChunkList>, chunk: &ChunkRef) -> Result<()> {
        let mut list = chunks.lock();
        if list.len() <= 1 {
            return Ok(());
        }

        let mut guard = chunk.lock();
        // An allocation may have slipped in between the free and this point.
        if guard.is_released() || !guard.is_empty() {
            return Ok(());
        }

        let free_bytes = list.free_bytes_excluding(chunk) + guard.free_bytes();
        if free_bytes <= list.page_size() {
            return Ok(());
        }

        if list.unlink(chunk) {
            guard.release()?;
        }

        Ok(())
    }
}

impl AllocationStrategy for SplitMerge {
    fn allocate(&self, chunks: &Mutex<ChunkList>, size: usize) -> Result<AllocatedBlock> {
        let mut list = chunks.lock();

        let Some(chunk) = self.policy.select_chunk(&mut list, size)? else {
            error!(size, "allocation policy selected no chunk");
            return Err(Error::NoChunkFound { size });
        };

        let mut guard = chunk.lock();
        let Some((addr, id)) = guard.find_free_block_for_size(size) else {
            error!(?guard, size, "selected chunk has no block for the request");
            return Err(Error::NoFreeBlockFound {
                size,
                chunk: guard.addr(),
            });
        };
        drop(guard);
        drop(list);

        trace!(addr, size, "allocated block");

        // The block was just carved out of `chunk` and stays in use until freed.
        Ok(unsafe { AllocatedBlock::new(chunk, id, addr, size) })
    }

    fn free(&self, chunks: &Mutex<ChunkList>, block: &mut AllocatedBlock) -> Result<()> {
        if block.is_freed() {
            return Err(Error::AlreadyFreed);
        }

        let chunk = Arc::clone(block.chunk());
        let emptied = {
            let mut guard = chunk.lock();
            if guard.mark_free(block.block_id()).is_none() {
                return Err(Error::AlreadyFreed);
            }
            guard.merge_adjacent(block.block_id());
            block.mark_freed();

            guard.is_empty()
        };

        trace!(addr = block.addr(), size = block.size(), "freed block");

        if emptied {
            self.release_if_surplus(chunks, &chunk)?;
        }

        Ok(())
    }
}
