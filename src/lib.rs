//! Memory managed by hand on top of pages mapped straight from the OS.
//!
//! Two allocators are provided, both independent from Rust's global allocator:
//!
//! - [`MemoryAllocator`], a heap made of page-backed chunks split into
//!   blocks. Requests are served first-fit, blocks are split on allocation
//!   and coalesced with their free neighbours on free, and chunks that end up
//!   entirely free are handed back to the OS.
//! - [`Pool`], a bump allocator over a single region for many short-lived
//!   objects of the same lifetime, and [`ArenaPool`], which hands out a fixed
//!   set of pools round-robin.
//!
//! The heap is laid out like this:
//!
//! ```text
//!                                  ChunkList
//!   +-------------------------------+      +-------------------------------------------+
//!   | Chunk (1 page)                | ---> | Chunk (2 pages)                           |
//!   | +------+------+-------------+ |      | +------------------+--------------------+ |
//!   | | used | used |    free     | |      | |       used       |        free        | |
//!   | +------+------+-------------+ |      | +------------------+--------------------+ |
//!   +-------------------------------+      +-------------------------------------------+
//! ```
//!
//! Block bookkeeping lives outside the mapped pages, so every mapped byte is
//! usable and a block of `n` bytes covers exactly `n` bytes.
//!
//! # Examples
//!
//! ```
//! use pagealloc::MemoryAllocator;
//!
//! let allocator = MemoryAllocator::new().unwrap();
//!
//! let mut src = allocator.alloc(9).unwrap();
//! let mut dst = allocator.alloc(9).unwrap();
//! src.set(*b"test data");
//!
//! allocator.copy(&mut dst, &src).unwrap();
//! assert_eq!(dst.get::<[u8; 9]>(), *b"test data");
//!
//! allocator.free(&mut src).unwrap();
//! allocator.free(&mut dst).unwrap();
//! assert!(allocator.free(&mut dst).is_err());
//! ```

pub mod allocator;
pub mod arena;
pub mod block;
pub mod chunk;
pub mod error;
pub mod kernel;
mod list;
pub mod policy;
pub mod pool;
pub mod strategy;
pub mod utils;

pub use allocator::{AllocatedBlock, AllocatorBuilder, MemoryAllocator, global};
pub use arena::{ArenaHandle, ArenaPool, ArenaPoolOptions};
pub use block::Block;
pub use chunk::{BlockId, Chunk, ChunkList, ChunkRef, ChunkStats};
pub use error::{Error, Result};
pub use kernel::{Kernel, PageSource};
pub use policy::{AllocationPolicy, FirstFit};
pub use pool::{FreeSpan, Pool, PoolOptions, Ptr};
pub use strategy::{AllocationStrategy, SplitMerge};
