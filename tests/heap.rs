use std::{
    io,
    ptr::NonNull,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use bytemuck::{Pod, Zeroable};
use pagealloc::{AllocatorBuilder, Error, FirstFit, Kernel, MemoryAllocator, PageSource};

/// Kernel-backed page source that counts mappings and releases.
#[derive(Default)]
struct Counting {
    mapped: AtomicUsize,
    released: AtomicUsize,
}

impl PageSource for Counting {
    fn request_memory(&self, len: usize) -> io::Result<NonNull<u8>> {
        self.mapped.fetch_add(1, Ordering::SeqCst);
        Kernel.request_memory(len)
    }

    unsafe fn return_memory(&self, addr: NonNull<u8>, len: usize) -> io::Result<()> {
        self.released.fetch_add(1, Ordering::SeqCst);
        unsafe { Kernel.return_memory(addr, len) }
    }

    fn page_size(&self) -> usize {
        Kernel.page_size()
    }
}

/// Page source whose mappings always fail.
struct Exhausted;

impl PageSource for Exhausted {
    fn request_memory(&self, _len: usize) -> io::Result<NonNull<u8>> {
        Err(io::Error::from(io::ErrorKind::OutOfMemory))
    }

    unsafe fn return_memory(&self, _addr: NonNull<u8>, _len: usize) -> io::Result<()> {
        Ok(())
    }

    fn page_size(&self) -> usize {
        4096
    }
}

/// Kernel-backed page source that refuses mappings once `remaining` runs out.
struct Limited {
    remaining: AtomicUsize,
}

impl PageSource for Limited {
    fn request_memory(&self, len: usize) -> io::Result<NonNull<u8>> {
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .map_err(|_| io::Error::from(io::ErrorKind::OutOfMemory))?;
        Kernel.request_memory(len)
    }

    unsafe fn return_memory(&self, addr: NonNull<u8>, len: usize) -> io::Result<()> {
        unsafe { Kernel.return_memory(addr, len) }
    }

    fn page_size(&self) -> usize {
        Kernel.page_size()
    }
}

fn counting() -> (Arc<Counting>, MemoryAllocator) {
    let source = Arc::new(Counting::default());
    let allocator = AllocatorBuilder::new()
        .page_source(source.clone())
        .finish()
        .unwrap();
    (source, allocator)
}

#[test]
fn small_alloc_comes_from_the_first_chunk() {
    let allocator = MemoryAllocator::new().unwrap();
    let page_size = allocator.page_size();

    let mut block = allocator.alloc(100).unwrap();
    let stats = allocator.chunk_stats();
    assert_eq!(block.size(), 100);
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].free_bytes, page_size - 100);
    assert!(block.addr() >= stats[0].addr && block.addr() + 100 <= stats[0].addr + stats[0].size);

    allocator.free(&mut block).unwrap();
    assert_eq!(allocator.chunk_stats()[0].free_bytes, page_size);
}

#[test]
fn large_alloc_gets_a_chunk_rounded_to_pages() {
    let allocator = MemoryAllocator::new().unwrap();
    let page_size = allocator.page_size();
    let size = page_size + page_size / 4;

    let block = allocator.alloc(size).unwrap();
    let stats = allocator.chunk_stats();

    assert_eq!(stats.len(), 2);
    assert_eq!(stats[1].size, 2 * page_size);
    assert_eq!(stats[1].free_bytes, 2 * page_size - size);
    assert_eq!(block.addr(), stats[1].addr);
}

#[test]
fn double_free_is_an_error() {
    let allocator = MemoryAllocator::new().unwrap();

    let mut block = allocator.alloc(10).unwrap();
    assert!(!block.is_freed());
    allocator.free(&mut block).unwrap();
    assert!(block.is_freed());

    assert!(matches!(allocator.free(&mut block), Err(Error::AlreadyFreed)));
    assert!(block.is_freed());
}

#[test]
fn copy_string_between_blocks() {
    let allocator = MemoryAllocator::new().unwrap();
    let mut src = allocator.alloc(9).unwrap();
    let mut dst = allocator.alloc(9).unwrap();

    allocator.set(&mut src, *b"test data");
    allocator.copy(&mut dst, &src).unwrap();

    assert_eq!(&allocator.get::<[u8; 9]>(&dst), b"test data");
}

#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
#[repr(C)]
struct Sample {
    a: i64,
    b: f64,
    c: [u8; 16],
}

#[test]
fn struct_array_round_trips_through_a_block() {
    let allocator = MemoryAllocator::new().unwrap();
    let mut block = allocator.alloc(std::mem::size_of::<[Sample; 10]>()).unwrap();

    let mut samples = [Sample::zeroed(); 10];
    samples[0] = Sample {
        a: 8,
        b: 2.5,
        c: *b"test data\0\0\0\0\0\0\0",
    };
    block.set(samples);

    let read = block.get::<[Sample; 10]>();
    assert_eq!(read[0], samples[0]);
    assert_eq!(read[9], Sample::zeroed());

    allocator.free(&mut block).unwrap();
    assert!(matches!(allocator.free(&mut block), Err(Error::AlreadyFreed)));
    assert!(block.is_freed());
}

#[test]
fn live_blocks_never_overlap() {
    let allocator = MemoryAllocator::new().unwrap();
    let sizes = [1, 7, 64, 300, 2048, 13, 4097, 9000, 2, 512];

    let mut blocks: Vec<_> = sizes.iter().map(|&size| allocator.alloc(size).unwrap()).collect();
    // Free every other block, then refill the holes.
    for block in blocks.iter_mut().step_by(2) {
        allocator.free(block).unwrap();
    }
    blocks.retain(|block| !block.is_freed());
    blocks.extend(sizes.iter().map(|&size| allocator.alloc(size).unwrap()));

    for (i, a) in blocks.iter().enumerate() {
        for b in &blocks[i + 1..] {
            assert!(!a.overlaps(b), "{a:?} overlaps {b:?}");
        }
    }
}

#[test]
fn freed_space_is_reused_after_coalescing() {
    let allocator = MemoryAllocator::new().unwrap();

    let mut a = allocator.alloc(64).unwrap();
    let mut b = allocator.alloc(64).unwrap();
    let _c = allocator.alloc(64).unwrap();
    let start = a.addr();

    allocator.free(&mut a).unwrap();
    allocator.free(&mut b).unwrap();

    // Only fits in the merged span of `a` and `b`.
    let d = allocator.alloc(128).unwrap();
    assert_eq!(d.addr(), start);
    assert_eq!(allocator.chunk_count(), 1);
}

#[test]
fn emptied_chunk_is_released_when_surplus() {
    let (source, allocator) = counting();
    let page_size = allocator.page_size();
    assert_eq!(source.mapped.load(Ordering::SeqCst), 1);

    let mut first = allocator.alloc(page_size).unwrap();
    let mut second = allocator.alloc(page_size + 1).unwrap();
    assert_eq!(allocator.chunk_count(), 3);
    assert_eq!(source.mapped.load(Ordering::SeqCst), 3);

    // One page free in the initial chunk plus the two pages of `second`'s chunk.
    allocator.free(&mut second).unwrap();
    assert_eq!(allocator.chunk_count(), 2);
    assert_eq!(source.released.load(Ordering::SeqCst), 1);

    // The initial chunk's page plus `first`'s page.
    allocator.free(&mut first).unwrap();
    assert_eq!(allocator.chunk_count(), 1);
    assert_eq!(source.released.load(Ordering::SeqCst), 2);
}

#[test]
fn sole_chunk_is_kept() {
    let (source, allocator) = counting();

    let mut block = allocator.alloc(1).unwrap();
    allocator.free(&mut block).unwrap();

    assert_eq!(allocator.chunk_count(), 1);
    assert_eq!(source.released.load(Ordering::SeqCst), 0);
}

#[test]
fn empty_chunk_is_kept_without_surplus() {
    let (source, allocator) = counting();
    let page_size = allocator.page_size();

    // Fill the initial chunk completely so it holds no free bytes.
    let _whole = allocator.alloc(page_size / 2).unwrap();
    let _rest = allocator.alloc(page_size / 2).unwrap();
    let mut big = allocator.alloc(page_size).unwrap();
    assert_eq!(allocator.chunk_count(), 2);

    // The emptied chunk is the only free page, which is not more than a page.
    allocator.free(&mut big).unwrap();
    assert_eq!(allocator.chunk_count(), 2);
    assert_eq!(source.released.load(Ordering::SeqCst), 0);
}

#[test]
fn mappings_are_released_on_drop() {
    let (source, allocator) = counting();
    let big = allocator.alloc(allocator.page_size() * 3).unwrap();
    drop(big);

    drop(allocator);

    assert_eq!(
        source.mapped.load(Ordering::SeqCst),
        source.released.load(Ordering::SeqCst)
    );
}

#[test]
fn live_handle_keeps_its_chunk_mapped() {
    let (source, allocator) = counting();
    let mut block = allocator.alloc(16).unwrap();
    block.set(7u128);

    drop(allocator);

    assert_eq!(source.released.load(Ordering::SeqCst), 0);
    assert_eq!(block.get::<u128>(), 7);
    drop(block);
    assert_eq!(source.released.load(Ordering::SeqCst), 1);
}

#[test]
fn mapping_failure_is_propagated() {
    let result = AllocatorBuilder::new().page_source(Arc::new(Exhausted)).finish();

    match result {
        Err(Error::AllocationFailed { size, source }) => {
            assert_eq!(size, 4096);
            assert_eq!(source.kind(), io::ErrorKind::OutOfMemory);
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn custom_policy_threshold() {
    let allocator = AllocatorBuilder::new()
        .policy(Box::new(FirstFit::with_threshold(usize::MAX)))
        .finish()
        .unwrap();
    let page_size = allocator.page_size();

    // Above half a page but allowed to share the first chunk.
    let _block = allocator.alloc(page_size - 1).unwrap();

    assert_eq!(allocator.chunk_count(), 1);
}

#[test]
fn head_chunk_is_released_while_later_chunk_survives() {
    let (source, allocator) = counting();
    let page_size = allocator.page_size();
    let head = allocator.chunk_stats()[0].addr;

    let mut small = allocator.alloc(100).unwrap();
    let big = allocator.alloc(page_size + 1).unwrap();
    let stats = allocator.chunk_stats();
    assert_eq!(stats.len(), 2);
    assert_eq!(stats[0].addr, head);
    let tail = stats[1].addr;

    // The head empties while the tail still holds `big`.
    allocator.free(&mut small).unwrap();

    let stats = allocator.chunk_stats();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].addr, tail);
    assert_eq!(stats[0].size, 2 * page_size);
    assert_eq!(source.released.load(Ordering::SeqCst), 1);

    // The surviving chunk is now the head and keeps serving requests.
    let next = allocator.alloc(100).unwrap();
    assert_eq!(next.addr(), big.addr() + big.size());
    assert_eq!(allocator.chunk_count(), 1);
}

#[test]
fn growth_failure_after_construction_is_propagated() {
    let allocator = AllocatorBuilder::new()
        .page_source(Arc::new(Limited {
            remaining: AtomicUsize::new(1),
        }))
        .finish()
        .unwrap();
    let page_size = allocator.page_size();

    match allocator.alloc(2 * page_size) {
        Err(Error::AllocationFailed { size, source }) => {
            assert_eq!(size, 2 * page_size);
            assert_eq!(source.kind(), io::ErrorKind::OutOfMemory);
        }
        other => panic!("unexpected result: {other:?}"),
    }

    // The heap is left as it was and small requests still work.
    assert_eq!(allocator.chunk_count(), 1);
    assert_eq!(allocator.alloc(100).unwrap().size(), 100);
}

#[test]
fn oversized_alloc_fails_instead_of_overflowing() {
    let allocator = MemoryAllocator::new().unwrap();

    match allocator.alloc(usize::MAX - 100) {
        Err(Error::AllocationFailed { size, source }) => {
            assert_eq!(size, usize::MAX - 100);
            assert_eq!(source.kind(), io::ErrorKind::OutOfMemory);
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(allocator.chunk_count(), 1);
}
