use std::{sync::Arc, thread};

use pagealloc::{ArenaPool, ArenaPoolOptions};

fn main() -> pagealloc::Result<()> {
    let arenas = Arc::new(ArenaPool::new(ArenaPoolOptions {
        num_arenas: 4,
        arena_size: 4096,
    })?);

    let workers: Vec<_> = (0..4u64)
        .map(|worker| {
            let arenas = Arc::clone(&arenas);
            thread::spawn(move || -> pagealloc::Result<()> {
                let arena = arenas.get();

                for i in 0..16u64 {
                    let mut ptr = arena.alloc(8)?;
                    unsafe {
                        ptr.write(worker * 100 + i);
                        assert_eq!(ptr.read::<u64>(), worker * 100 + i);
                    }
                    arena.free(ptr)?;
                }

                println!(
                    "worker {worker} used arena {} ({} bytes bumped)",
                    arena.index(),
                    arena.pool().used()
                );
                arenas.return_arena(arena)
            })
        })
        .collect();

    for worker in workers {
        if let Ok(result) = worker.join() {
            result?;
        }
    }

    arenas.close()
}
