//! Chunk selection.

use tracing::debug;

use crate::{
    chunk::{ChunkList, ChunkRef},
    error::Result,
};

/// Decides which chunk serves a request, growing the heap when needed.
///
/// Implementations are called with the chunk list lock held. A returned
/// chunk must be linked in `chunks` and able to serve `size` bytes from a
/// single free block; the strategy treats anything else as a bug.
pub trait AllocationPolicy: Send + Sync {
    /// Returns the chunk that should serve `size` bytes, or `None` if the
    /// policy has nothing to offer.
    fn select_chunk(&self, chunks: &mut ChunkList, size: usize) -> Result<Option<ChunkRef>>;
}

/// First-fit by list order, oldest chunk first.
///
/// Small requests (up to the threshold, half a page unless configured) go to
/// the first chunk that can hold them. Bigger requests, and small ones no
/// chunk can hold, get a fresh chunk rounded up to whole pages and appended
/// at the tail. Filling older chunks first leaves the newer, often larger,
/// chunks for big requests.
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstFit {
    threshold: Option<usize>,
}

impl FirstFit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests above `threshold` bytes always get their own chunk.
    pub fn with_threshold(threshold: usize) -> Self {
        Self {
            threshold: Some(threshold),
        }
    }

    /// The effective threshold for a heap with the given page size.
    pub fn threshold(&self, page_size: usize) -> usize {
        self.threshold.unwrap_or(page_size / 2)
    }
}

impl AllocationPolicy for FirstFit {
    fn select_chunk(&self, chunks: &mut ChunkList, size: usize) -> Result<Option<ChunkRef>> {
        if size <= self.threshold(chunks.page_size()) {
            // The free counter is checked first since it's a cheap way out;
            // `fits` then makes sure a single block can take the request.
            let found = chunks.iter().find(|chunk| {
                let chunk = chunk.lock();
                chunk.free_bytes() >= size && chunk.fits(size)
            });

            if let Some(chunk) = found {
                return Ok(Some(ChunkRef::clone(chunk)));
            }
        }

        let chunk = chunks.grow(size)?;
        debug!(size, chunks = chunks.len(), "grew heap for request");

        Ok(Some(chunk))
    }
}
