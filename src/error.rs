//! Errors returned by the heap, the pools and the page source.

use std::io;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while allocating or releasing memory.
#[derive(Error, Debug)]
pub enum Error {
    /// The page source could not map the requested region.
    #[error("could not map {size} bytes")]
    AllocationFailed {
        /// Requested mapping length.
        size: usize,
        /// Error reported by the operating system.
        #[source]
        source: io::Error,
    },

    /// The page source could not unmap a region.
    #[error("could not release {size} bytes at {addr:#x}")]
    ReleaseFailed {
        /// Start of the region.
        addr: usize,
        /// Length of the region.
        size: usize,
        /// Error reported by the operating system.
        #[source]
        source: io::Error,
    },

    /// The allocation policy did not produce a chunk. This is a bug in the policy.
    #[error("no chunk selected for a request of {size} bytes")]
    NoChunkFound {
        /// Requested size.
        size: usize,
    },

    /// The selected chunk had no block able to serve the request. This is a
    /// bug in the pairing of policy and block store.
    #[error("chunk at {chunk:#x} was selected but has no free block of {size} bytes")]
    NoFreeBlockFound {
        /// Requested size.
        size: usize,
        /// Base address of the selected chunk.
        chunk: usize,
    },

    /// The block handle was already freed.
    #[error("allocated block already freed")]
    AlreadyFreed,

    /// Copy between blocks of different sizes.
    #[error("allocated blocks differ in size: destination {dst}, source {src}")]
    SizeMismatch {
        /// Destination size.
        dst: usize,
        /// Source size.
        src: usize,
    },

    /// The span handed back to a pool does not belong to it.
    #[error("address {addr:#x} is outside of the pool")]
    InvalidAddress {
        /// Offending address.
        addr: usize,
    },

    /// The pool cursor reached the end of the region and no freed span fits.
    #[error("pool is full, cannot serve {requested} bytes")]
    PoolFull {
        /// Requested size.
        requested: usize,
    },

    /// An arena handle was returned to an arena pool it does not belong to.
    #[error("arena {index} does not belong to this arena pool")]
    ForeignArena {
        /// Index carried by the handle.
        index: usize,
    },

    /// The pool was closed and its region released.
    #[error("pool is closed")]
    PoolClosed,

    /// Zero-byte requests are not served.
    #[error("zero-sized allocation request")]
    ZeroSizedRequest,

    /// Construction options were rejected.
    #[error("invalid options: {0}")]
    InvalidOptions(&'static str),
}
