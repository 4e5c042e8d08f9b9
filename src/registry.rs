//! Registry for threads.
//!
//! Assigns each live thread a dense id in `[0, MAX_THREADS)`. The first call
//! to [`thread_id`] claims a free slot and caches it in a thread-local guard;
//! when the thread exits, the guard's `Drop` releases the slot for a later
//! thread. Lock indexing and the read-indicator layout both key off these ids,
//! which is why the registry lives in the core.

use crate::params::MAX_THREADS;
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub(crate) struct ThreadRegistry {
    /// Which tids are in use by threads.
    used: [AtomicBool; MAX_THREADS],
    /// Highest tid (+1) ever assigned. Only grows; scans over
    /// `[0, max_threads())` with a membership check stay correct after
    /// slots are released.
    max_tid: AtomicUsize,
}

#[allow(clippy::declare_interior_mutable_const)]
const UNUSED: AtomicBool = AtomicBool::new(false);

static REGISTRY: ThreadRegistry = ThreadRegistry {
    used: [UNUSED; MAX_THREADS],
    max_tid: AtomicUsize::new(0),
};

impl ThreadRegistry {
    // Progress condition: wait-free bounded (by the number of threads)
    fn register(&self) -> usize {
        for tid in 0..MAX_THREADS {
            if self.used[tid].load(Ordering::Acquire) {
                continue;
            }
            if self.used[tid]
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            // Grow the watermark until it covers our tid.
            let mut cur = self.max_tid.load(Ordering::Acquire);
            while cur <= tid {
                match self.max_tid.compare_exchange(
                    cur,
                    tid + 1,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => break,
                    Err(seen) => cur = seen,
                }
            }
            return tid;
        }
        panic!("petek: too many threads, registry can only hold {MAX_THREADS}");
    }

    // Progress condition: wait-free population oblivious
    fn deregister(&self, tid: usize) {
        self.used[tid].store(false, Ordering::Release);
    }
}

/// Highest thread id (+1) ever assigned. Upper bound for scans over
/// currently registered threads.
#[inline]
pub fn max_threads() -> usize {
    REGISTRY.max_tid.load(Ordering::Acquire)
}

struct SlotGuard {
    tid: Cell<Option<usize>>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if let Some(tid) = self.tid.get() {
            REGISTRY.deregister(tid);
        }
    }
}

thread_local! {
    static SLOT: SlotGuard = const {
        SlotGuard {
            tid: Cell::new(None),
        }
    };
}

/// The calling thread's registry id, claiming one on first use.
///
/// # Panics
///
/// Panics if more than `MAX_THREADS` threads are registered at once.
#[inline]
pub fn thread_id() -> usize {
    SLOT.with(|slot| match slot.tid.get() {
        Some(tid) => tid,
        None => {
            let tid = REGISTRY.register();
            slot.tid.set(Some(tid));
            tid
        }
    })
}
