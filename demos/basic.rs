use pagealloc::{AllocatedBlock, MemoryAllocator};

fn log_alloc(block: &AllocatedBlock) {
    println!("Requested {} bytes of memory", block.size());
    println!("Received this address: {:#x}", block.addr());
}

fn log_chunks(allocator: &MemoryAllocator) {
    for (index, chunk) in allocator.chunk_stats().iter().enumerate() {
        println!(
            "  chunk {index}: {} bytes at {:#x}, {} free in {} blocks",
            chunk.size, chunk.addr, chunk.free_bytes, chunk.blocks
        );
    }
}

fn main() -> pagealloc::Result<()> {
    let allocator = MemoryAllocator::new()?;

    let mut a = allocator.alloc(8)?;
    log_alloc(&a);
    a.set(42u64);

    let mut b = allocator.alloc(100)?;
    log_alloc(&b);

    // Bigger than a page, gets a chunk of its own.
    let mut c = allocator.alloc(5000)?;
    log_alloc(&c);
    log_chunks(&allocator);

    // Copy example
    let mut src = allocator.alloc(9)?;
    let mut dst = allocator.alloc(9)?;
    src.as_bytes_mut().copy_from_slice(b"test data");
    allocator.copy(&mut dst, &src)?;
    println!("Copied: {}", String::from_utf8_lossy(dst.as_bytes()));

    println!("Value in a: {}", a.get::<u64>());

    for block in [&mut a, &mut b, &mut c, &mut src, &mut dst] {
        allocator.free(block)?;
    }
    println!("After freeing everything:");
    log_chunks(&allocator);

    match allocator.free(&mut a) {
        Err(err) => println!("Second free refused: {err}"),
        Ok(()) => println!("Second free accepted?"),
    }

    Ok(())
}
