//! A fixed set of pools handed out round-robin.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    kernel::{Kernel, PageSource},
    pool::{Pool, PoolOptions, Ptr},
};

/// Options for [`ArenaPool::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ArenaPoolOptions {
    /// Number of pools.
    pub num_arenas: usize,
    /// Capacity of every pool in bytes.
    pub arena_size: usize,
}

impl Default for ArenaPoolOptions {
    fn default() -> Self {
        Self {
            num_arenas: 4,
            arena_size: 64 * 1024,
        }
    }
}

/// One pool of an [`ArenaPool`], as handed out by [`ArenaPool::get`].
#[derive(Debug)]
pub struct ArenaHandle {
    pool: Arc<Pool>,
    index: usize,
}

impl ArenaHandle {
    /// Position of the pool inside its arena pool.
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Whether both handles refer to the same pool.
    pub fn same_arena(&self, other: &ArenaHandle) -> bool {
        Arc::ptr_eq(&self.pool, &other.pool)
    }

    pub fn alloc(&self, size: usize) -> Result<Ptr> {
        self.pool.alloc(size)
    }

    pub fn free(&self, ptr: Ptr) -> Result<()> {
        self.pool.free(ptr)
    }
}

struct Schedule {
    next: usize,
    in_use: Vec<bool>,
}

/// Hands out `N` pools in turn so independent workers don't all contend on
/// the same pool lock.
///
/// Scheduling is plain round-robin and does not skip pools that are in use.
/// Returning a pool makes it the next one handed out, so bursty returns can
/// keep serving the same few pools; that is accepted.
pub struct ArenaPool {
    arenas: Vec<Arc<Pool>>,
    schedule: Mutex<Schedule>,
}

impl ArenaPool {
    /// Maps `num_arenas` pools of `arena_size` bytes from the OS.
    pub fn new(options: ArenaPoolOptions) -> Result<Self> {
        Self::with_source(options, Arc::new(Kernel))
    }

    pub fn with_source(options: ArenaPoolOptions, source: Arc<dyn PageSource>) -> Result<Self> {
        if options.num_arenas == 0 {
            return Err(Error::InvalidOptions("arena pool needs at least one arena"));
        }

        let arenas = (0..options.num_arenas)
            .map(|_| {
                Pool::with_source(PoolOptions { size: options.arena_size }, Arc::clone(&source))
                    .map(Arc::new)
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(
            arenas = options.num_arenas,
            arena_size = options.arena_size,
            "created arena pool"
        );

        Ok(Self {
            schedule: Mutex::new(Schedule {
                next: 0,
                in_use: vec![false; arenas.len()],
            }),
            arenas,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.arenas.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.arenas.is_empty()
    }

    /// Hands out the pool under the cursor, marks it in use and moves the
    /// cursor to the following pool.
    pub fn get(&self) -> ArenaHandle {
        let mut schedule = self.schedule.lock();

        let index = schedule.next;
        schedule.in_use[index] = true;
        schedule.next = (index + 1) % self.arenas.len();

        ArenaHandle {
            pool: Arc::clone(&self.arenas[index]),
            index,
        }
    }

    /// Takes `handle` back. Its pool is no longer in use and will be the
    /// next one handed out. Fails with [`Error::ForeignArena`], leaving the
    /// schedule untouched, if the handle came from another arena pool.
    pub fn return_arena(&self, handle: ArenaHandle) -> Result<()> {
        let owned = self
            .arenas
            .get(handle.index)
            .is_some_and(|pool| Arc::ptr_eq(pool, &handle.pool));
        if !owned {
            return Err(Error::ForeignArena { index: handle.index });
        }

        let mut schedule = self.schedule.lock();

        schedule.in_use[handle.index] = false;
        schedule.next = handle.index;

        Ok(())
    }

    /// Whether the pool at `index` is currently handed out.
    pub fn is_in_use(&self, index: usize) -> bool {
        self.schedule.lock().in_use.get(index).copied().unwrap_or(false)
    }

    /// Closes every pool. All pools are attempted; the first failure is returned.
    pub fn close(&self) -> Result<()> {
        let mut first_error = None;

        for (index, arena) in self.arenas.iter().enumerate() {
            if let Err(err) = arena.close() {
                warn!(index, %err, "could not close arena");
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
