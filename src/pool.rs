//! Bump allocation over a single mapped region.
//!
//! ```text
//!   base                         cursor                     base + capacity
//!   +------+------+-----+--------+------------------------------+
//!   |  A1  |  A2  | pad |   A3   |          untouched           |
//!   +------+------+-----+--------+------------------------------+
//!                                ^ next allocation starts here (aligned)
//! ```
//!
//! The cursor only moves forward. Spans handed back with [`Pool::free`] go to
//! a side list and are only used again once the cursor reached the end of the
//! region, which suits churn of same-sized objects rather than general use.

use std::{io, mem, ptr::NonNull, sync::Arc};

use bytemuck::Pod;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::{
    error::{Error, Result},
    kernel::{Kernel, PageSource},
    utils::{align, align_to},
};

/// Options for [`Pool::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PoolOptions {
    /// Usable capacity of the pool in bytes. The mapping itself is rounded
    /// up to whole pages but allocations never go past this capacity.
    pub size: usize,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self { size: 64 * 1024 }
    }
}

/// A span given back to the pool and available for reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeSpan {
    pub addr: usize,
    pub size: usize,
}

impl FreeSpan {
    #[inline]
    fn end(&self) -> usize {
        self.addr + self.size
    }
}

/// Memory handed out by a [`Pool`].
///
/// The pool does not track outstanding pointers: reading or writing through
/// a `Ptr` after it was freed, or after its pool was closed, is undefined.
#[derive(Debug, PartialEq, Eq)]
pub struct Ptr {
    addr: usize,
    offset: usize,
    size: usize,
}

impl Ptr {
    #[inline]
    pub fn addr(&self) -> usize {
        self.addr
    }

    /// Distance from the start of the pool.
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.addr as *mut u8
    }

    /// Reads the first `size_of::<T>()` bytes as a `T`.
    ///
    /// # Safety
    ///
    /// The pointer must not have been freed and its pool must still be open.
    ///
    /// # Panics
    ///
    /// If `T` is larger than the allocation.
    pub unsafe fn read<T: Pod>(&self) -> T {
        assert!(mem::size_of::<T>() <= self.size, "type larger than the allocation");
        unsafe { self.as_ptr().cast::<T>().read_unaligned() }
    }

    /// Writes `value` over the first `size_of::<T>()` bytes.
    ///
    /// # Safety
    ///
    /// Same as [`Ptr::read`].
    ///
    /// # Panics
    ///
    /// If `T` is larger than the allocation.
    pub unsafe fn write<T: Pod>(&mut self, value: T) {
        assert!(mem::size_of::<T>() <= self.size, "type larger than the allocation");
        unsafe { self.as_ptr().cast::<T>().write_unaligned(value) }
    }
}

struct PoolState {
    cursor: usize,
    free: Vec<FreeSpan>,
    closed: bool,
}

impl PoolState {
    /// Takes the first freed span able to hold `size` bytes at `alignment`.
    /// Whatever is left of the span on either side goes back to the list.
    fn reuse(&mut self, size: usize, alignment: usize) -> Option<usize> {
        let (index, start) = self.free.iter().enumerate().find_map(|(index, span)| {
            let start = align_to(span.addr, alignment);
            (start + size <= span.end()).then_some((index, start))
        })?;

        let span = self.free.swap_remove(index);
        if start > span.addr {
            self.free.push(FreeSpan {
                addr: span.addr,
                size: start - span.addr,
            });
        }
        if start + size < span.end() {
            self.free.push(FreeSpan {
                addr: start + size,
                size: span.end() - (start + size),
            });
        }

        Some(start)
    }

    /// Records `span` as free, folding it into any address-adjacent entry.
    fn insert(&mut self, mut span: FreeSpan) {
        while let Some(index) = self
            .free
            .iter()
            .position(|entry| entry.end() == span.addr || span.end() == entry.addr)
        {
            let entry = self.free.swap_remove(index);
            span = FreeSpan {
                addr: entry.addr.min(span.addr),
                size: entry.size + span.size,
            };
        }

        self.free.push(span);
    }
}

/// Bump allocator over one region of `capacity` bytes.
pub struct Pool {
    base: usize,
    capacity: usize,
    /// Length of the mapping, `capacity` rounded up to whole pages.
    mapped: usize,
    state: Mutex<PoolState>,
    source: Arc<dyn PageSource>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("base", &format_args!("{:#x}", self.base))
            .field("capacity", &self.capacity)
            .field("used", &self.used())
            .finish()
    }
}

impl Pool {
    /// Maps a pool from the OS.
    pub fn new(options: PoolOptions) -> Result<Self> {
        Self::with_source(options, Arc::new(Kernel))
    }

    /// Maps a pool from `source`.
    pub fn with_source(options: PoolOptions, source: Arc<dyn PageSource>) -> Result<Self> {
        if options.size == 0 {
            return Err(Error::InvalidOptions("pool size must be greater than zero"));
        }

        let Some(mapped) = align(options.size, source.page_size()) else {
            return Err(Error::AllocationFailed {
                size: options.size,
                source: io::ErrorKind::OutOfMemory.into(),
            });
        };
        let base = source
            .request_memory(mapped)
            .map_err(|source| Error::AllocationFailed { size: mapped, source })?
            .as_ptr() as usize;

        debug!(base, capacity = options.size, "created pool");

        Ok(Self {
            base,
            capacity: options.size,
            mapped,
            state: Mutex::new(PoolState {
                cursor: base,
                free: Vec::new(),
                closed: false,
            }),
            source,
        })
    }

    /// Start of the pool's region.
    #[inline]
    pub fn addr(&self) -> usize {
        self.base
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes the cursor has moved past, padding included.
    pub fn used(&self) -> usize {
        self.state.lock().cursor - self.base
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Spans currently waiting for reuse.
    pub fn free_spans(&self) -> Vec<FreeSpan> {
        self.state.lock().free.clone()
    }

    /// Hands out `size` bytes aligned to at least a pointer.
    ///
    /// Memory comes from the cursor while it fits before the end of the
    /// region, and from freed spans after that.
    pub fn alloc(&self, size: usize) -> Result<Ptr> {
        if size == 0 {
            return Err(Error::ZeroSizedRequest);
        }

        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::PoolClosed);
        }

        let alignment = mem::align_of::<usize>();
        let start = align_to(state.cursor, alignment);
        let end = self.base + self.capacity;

        let addr = match start.checked_add(size) {
            Some(next) if next <= end => {
                state.cursor = next;
                start
            }
            _ => state
                .reuse(size, alignment)
                .ok_or(Error::PoolFull { requested: size })?,
        };

        trace!(addr, size, "pool alloc");

        Ok(Ptr {
            addr,
            offset: addr - self.base,
            size,
        })
    }

    /// Gives `ptr` back to the pool for later reuse.
    pub fn free(&self, ptr: Ptr) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::PoolClosed);
        }

        let end = self.base + self.capacity;
        if ptr.addr < self.base || ptr.addr >= end || ptr.size > end - ptr.addr {
            return Err(Error::InvalidAddress { addr: ptr.addr });
        }

        state.insert(FreeSpan {
            addr: ptr.addr,
            size: ptr.size,
        });

        trace!(addr = ptr.addr, size = ptr.size, "pool free");

        Ok(())
    }

    /// Releases the whole region. Every `Ptr` from this pool becomes dangling
    /// and further calls fail with [`Error::PoolClosed`]. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }

        let Some(addr) = NonNull::new(self.base as *mut u8) else {
            return Err(Error::InvalidAddress { addr: self.base });
        };
        unsafe { self.source.return_memory(addr, self.mapped) }.map_err(|source| {
            Error::ReleaseFailed {
                addr: self.base,
                size: self.mapped,
                source,
            }
        })?;

        state.closed = true;
        state.free.clear();

        debug!(base = self.base, "closed pool");

        Ok(())
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(%err, "could not release pool on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(size: usize) -> Pool {
        Pool::new(PoolOptions { size }).unwrap()
    }

    #[test]
    fn alloc_write_read_free() {
        let pool = pool(1024);

        let mut ptr = pool.alloc(8).unwrap();
        unsafe {
            ptr.write(456u64);
            assert_eq!(ptr.read::<u64>(), 456);
        }

        pool.free(ptr).unwrap();
        assert_eq!(pool.free_spans().len(), 1);
    }

    #[test]
    fn addresses_increase_and_are_aligned() {
        let pool = pool(256);
        let alignment = mem::align_of::<usize>();

        let mut last = None;
        for size in [1, 3, 8, 5, 16] {
            let ptr = pool.alloc(size).unwrap();
            assert_eq!(ptr.addr() % alignment, 0);
            if let Some(prev) = last {
                assert!(ptr.addr() > prev);
            }
            last = Some(ptr.addr());
        }
    }

    #[test]
    fn zero_size_pool_is_rejected() {
        assert!(matches!(
            Pool::new(PoolOptions { size: 0 }),
            Err(Error::InvalidOptions(_))
        ));
    }

    #[test]
    fn offset_is_relative_to_base() {
        let pool = pool(64);
        let first = pool.alloc(4).unwrap();
        let second = pool.alloc(4).unwrap();

        assert_eq!(first.offset(), 0);
        assert_eq!(second.offset(), second.addr() - pool.addr());
        assert_eq!(second.offset(), mem::align_of::<usize>());
    }

    #[test]
    fn adjacent_frees_coalesce() {
        let pool = pool(64);
        let a = pool.alloc(8).unwrap();
        let b = pool.alloc(8).unwrap();
        let c = pool.alloc(8).unwrap();
        let base = a.addr();

        pool.free(a).unwrap();
        pool.free(c).unwrap();
        assert_eq!(pool.free_spans().len(), 2);

        pool.free(b).unwrap();
        assert_eq!(pool.free_spans(), vec![FreeSpan { addr: base, size: 24 }]);
    }

    #[test]
    fn reuse_keeps_the_remainder() {
        let pool = pool(16);
        let a = pool.alloc(16).unwrap();
        let base = a.addr();
        pool.free(a).unwrap();

        let b = pool.alloc(8).unwrap();
        assert_eq!(b.addr(), base);
        assert_eq!(pool.free_spans(), vec![FreeSpan { addr: base + 8, size: 8 }]);
    }

    #[test]
    fn foreign_pointer_is_rejected() {
        let pool = pool(64);
        let other = self::pool(64);
        let ptr = other.alloc(8).unwrap();

        assert!(matches!(pool.free(ptr), Err(Error::InvalidAddress { .. })));
    }

    #[test]
    fn closed_pool_refuses_work() {
        let pool = pool(64);
        let ptr = pool.alloc(8).unwrap();

        pool.close().unwrap();
        pool.close().unwrap();

        assert!(pool.is_closed());
        assert!(matches!(pool.alloc(8), Err(Error::PoolClosed)));
        assert!(matches!(pool.free(ptr), Err(Error::PoolClosed)));
    }
}
