use std::{fmt, mem, ptr, slice, sync::Arc, sync::OnceLock};

use bytemuck::Pod;
use parking_lot::Mutex;
use tracing::debug;

use crate::{
    chunk::{BlockId, ChunkList, ChunkRef, ChunkStats},
    error::{Error, Result},
    kernel::{Kernel, PageSource},
    policy::{AllocationPolicy, FirstFit},
    strategy::{AllocationStrategy, SplitMerge},
};

/// Handle to a span of heap memory returned by [`MemoryAllocator::alloc`].
///
/// The handle keeps its chunk alive, so the memory stays mapped for as long
/// as the handle exists and has not been freed. It is deliberately not
/// `Clone`: freeing, writing and copying into a block take `&mut`, so no one
/// else can be looking at the bytes when that happens.
///
/// Dropping a handle without freeing it leaks the block.
pub struct AllocatedBlock {
    addr: usize,
    size: usize,
    chunk: ChunkRef,
    block: BlockId,
    freed: bool,
}

impl AllocatedBlock {
    /// Wraps block `block` of `chunk`, spanning `size` bytes from `addr`.
    ///
    /// # Safety
    ///
    /// `[addr, addr + size)` must be a used block of `chunk` that no other
    /// live handle covers, and must stay mapped until the handle is freed.
    pub unsafe fn new(chunk: ChunkRef, block: BlockId, addr: usize, size: usize) -> Self {
        Self {
            addr,
            size,
            chunk,
            block,
            freed: false,
        }
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
    pub fn is_freed(&self) -> bool {
        self.freed
    }

    #[inline]
    pub fn chunk(&self) -> &ChunkRef {
        &self.chunk
    }

    #[inline]
    pub fn block_id(&self) -> BlockId {
        self.block
    }

    /// Flags the handle as freed; afterwards every accessor refuses the handle.
    ///
    /// Only for [`AllocationStrategy`] implementations, and only once the
    /// block went back to its chunk. Flagging a live block leaks it for good,
    /// since [`MemoryAllocator::free`] then fails with [`Error::AlreadyFreed`].
    #[doc(hidden)]
    pub fn mark_freed(&mut self) {
        self.freed = true;
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.addr as *mut u8
    }

    /// Whether `other` shares at least one byte with this block.
    pub fn overlaps(&self, other: &AllocatedBlock) -> bool {
        self.addr < other.addr + other.size && other.addr < self.addr + self.size
    }

    /// The block's bytes.
    ///
    /// # Panics
    ///
    /// If the block was freed.
    pub fn as_bytes(&self) -> &[u8] {
        assert!(!self.freed, "access to a freed block at {:#x}", self.addr);
        // Live handles cover disjoint, mapped, initialised ranges.
        unsafe { slice::from_raw_parts(self.as_ptr(), self.size) }
    }

    /// The block's bytes, mutably.
    ///
    /// # Panics
    ///
    /// If the block was freed.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        assert!(!self.freed, "access to a freed block at {:#x}", self.addr);
        unsafe { slice::from_raw_parts_mut(self.as_ptr(), self.size) }
    }

    /// Reads the first `size_of::<T>()` bytes of the block as a `T`.
    ///
    /// Blocks are packed back to back, so the read does not assume alignment.
    ///
    /// # Panics
    ///
    /// If `T` is larger than the block or the block was freed.
    pub fn get<T: Pod>(&self) -> T {
        assert!(
            mem::size_of::<T>() <= self.size,
            "type of {} bytes read from a block of {} bytes",
            mem::size_of::<T>(),
            self.size
        );
        bytemuck::pod_read_unaligned(&self.as_bytes()[..mem::size_of::<T>()])
    }

    /// Writes `value` over the first `size_of::<T>()` bytes of the block.
    ///
    /// # Panics
    ///
    /// If `T` is larger than the block or the block was freed.
    pub fn set<T: Pod>(&mut self, value: T) {
        assert!(
            mem::size_of::<T>() <= self.size,
            "type of {} bytes written to a block of {} bytes",
            mem::size_of::<T>(),
            self.size
        );
        self.as_bytes_mut()[..mem::size_of::<T>()].copy_from_slice(bytemuck::bytes_of(&value));
    }
}

impl fmt::Debug for AllocatedBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocatedBlock")
            .field("addr", &format_args!("{:#x}", self.addr))
            .field("size", &self.size)
            .field("freed", &self.freed)
            .finish()
    }
}

/// The heap: a list of page-backed chunks served through a pluggable
/// [`AllocationStrategy`].
///
/// ```text
///   alloc(size) --> strategy.allocate --> policy.select_chunk --> chunk split --> AllocatedBlock
///   free(block) --> strategy.free --> chunk merge --> chunk release (if surplus)
/// ```
///
/// Every method takes `&self`; the allocator can be shared between threads.
pub struct MemoryAllocator {
    chunks: Mutex<ChunkList>,
    strategy: Box<dyn AllocationStrategy>,
}

impl fmt::Debug for MemoryAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryAllocator")
            .field("chunks", &self.chunk_count())
            .finish()
    }
}

impl MemoryAllocator {
    /// Creates an allocator on top of the OS page source with the default
    /// first-fit policy. One page is mapped right away.
    pub fn new() -> Result<Self> {
        AllocatorBuilder::new().finish()
    }

    pub fn builder() -> AllocatorBuilder {
        AllocatorBuilder::new()
    }

    /// Allocates `size` bytes.
    pub fn alloc(&self, size: usize) -> Result<AllocatedBlock> {
        if size == 0 {
            return Err(Error::ZeroSizedRequest);
        }

        self.strategy.allocate(&self.chunks, size)
    }

    /// Frees `block`. A second call on the same handle fails with
    /// [`Error::AlreadyFreed`] and leaves the handle freed.
    pub fn free(&self, block: &mut AllocatedBlock) -> Result<()> {
        self.strategy.free(&self.chunks, block)
    }

    /// Copies every byte of `src` into `dst`. Both blocks must have the same size.
    pub fn copy(&self, dst: &mut AllocatedBlock, src: &AllocatedBlock) -> Result<()> {
        if dst.is_freed() || src.is_freed() {
            return Err(Error::AlreadyFreed);
        }
        if dst.size() != src.size() {
            return Err(Error::SizeMismatch {
                dst: dst.size(),
                src: src.size(),
            });
        }

        // Two live handles never overlap.
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), dst.as_ptr(), src.size()) };

        Ok(())
    }

    /// See [`AllocatedBlock::get`].
    pub fn get<T: Pod>(&self, block: &AllocatedBlock) -> T {
        block.get()
    }

    /// See [`AllocatedBlock::set`].
    pub fn set<T: Pod>(&self, block: &mut AllocatedBlock, value: T) {
        block.set(value)
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.lock().len()
    }

    /// Free bytes across the whole heap.
    pub fn free_bytes(&self) -> usize {
        self.chunks.lock().free_bytes()
    }

    pub fn page_size(&self) -> usize {
        self.chunks.lock().page_size()
    }

    /// One entry per chunk, in list order.
    pub fn chunk_stats(&self) -> Vec<ChunkStats> {
        self.chunks.lock().stats()
    }
}

/// Configures a [`MemoryAllocator`].
///
/// # Examples
///
/// ```
/// use pagealloc::{AllocatorBuilder, FirstFit};
///
/// let allocator = AllocatorBuilder::new()
///     .policy(Box::new(FirstFit::with_threshold(1024)))
///     .finish()
///     .unwrap();
/// assert_eq!(allocator.chunk_count(), 1);
/// ```
#[derive(Default)]
pub struct AllocatorBuilder {
    source: Option<Arc<dyn PageSource>>,
    policy: Option<Box<dyn AllocationPolicy>>,
    strategy: Option<Box<dyn AllocationStrategy>>,
    chunk_threshold: Option<usize>,
}

impl AllocatorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Where chunks are mapped from. Defaults to [`Kernel`].
    pub fn page_source(mut self, source: Arc<dyn PageSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Chunk selection used by the default strategy. Defaults to [`FirstFit`].
    pub fn policy(mut self, policy: Box<dyn AllocationPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Replaces the whole allocation strategy; `policy` and
    /// `chunk_threshold` are then ignored.
    pub fn strategy(mut self, strategy: Box<dyn AllocationStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Requests above `threshold` bytes always get a chunk of their own.
    /// Defaults to half a page. Only used with the default policy.
    pub fn chunk_threshold(mut self, threshold: usize) -> Self {
        self.chunk_threshold = Some(threshold);
        self
    }

    pub fn finish(self) -> Result<MemoryAllocator> {
        let source: Arc<dyn PageSource> = match self.source {
            Some(source) => source,
            None => Arc::new(Kernel),
        };
        let strategy: Box<dyn AllocationStrategy> = match self.strategy {
            Some(strategy) => strategy,
            None => {
                let policy: Box<dyn AllocationPolicy> = match (self.policy, self.chunk_threshold) {
                    (Some(policy), _) => policy,
                    (None, Some(threshold)) => Box::new(FirstFit::with_threshold(threshold)),
                    (None, None) => Box::new(FirstFit::new()),
                };
                Box::new(SplitMerge::new(policy))
            }
        };

        let chunks = ChunkList::new(source)?;
        debug!(page_size = chunks.page_size(), "created memory allocator");

        Ok(MemoryAllocator {
            chunks: Mutex::new(chunks),
            strategy,
        })
    }
}

static GLOBAL: OnceLock<MemoryAllocator> = OnceLock::new();

/// Process-wide allocator over the OS page source, created on first use.
///
/// This is only a convenience: everything it offers is available from an
/// explicitly constructed [`MemoryAllocator`].
pub fn global() -> Result<&'static MemoryAllocator> {
    if let Some(allocator) = GLOBAL.get() {
        return Ok(allocator);
    }

    // Racing initialisers each build one; the loser's is dropped and unmapped.
    let allocator = MemoryAllocator::new()?;
    Ok(GLOBAL.get_or_init(|| allocator))
}
