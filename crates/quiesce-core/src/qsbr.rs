//! Quiescent-state-based reclamation (QSBR).
//!
//! Each registered worker periodically declares that it is quiescent, i.e.
//! that it holds no references to objects which may be reclaimed. A typical
//! placement of [`Qsbr::checkpoint`] is after processing a single request,
//! when no shared state is referenced any longer. The longer the period
//! between checkpoints, the coarser the reclamation granularity.
//!
//! Writers make the objects unreachable and then issue [`Qsbr::barrier`],
//! which returns a generation number. It is safe to reclaim those objects
//! once [`Qsbr::sync`] returns `true` for that number. The interface is
//! asynchronous: `sync` never blocks, it merely reports whether the grace
//! period has elapsed yet.
//!
//! QSBR makes no progress while any registered worker fails to checkpoint;
//! that is the caller's contract, not a defended condition.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering, fence};

use crate::Error;
use crate::registry::Registry;

/// A grace-period generation number.
///
/// Generations are 64-bit and monotonic; wrap-around is assumed impossible.
pub type Generation = u64;

/// Per-worker generation word, observed at each checkpoint.
///
/// Zero until the worker's first checkpoint, which stalls any in-flight
/// grace period: a newly registered worker must checkpoint before writers
/// can make progress. Cache-line aligned against false sharing.
#[derive(Default)]
#[repr(align(64))]
struct QsbrSlot {
    local: AtomicU64,
}

/// A quiescent-state-based reclamation domain.
#[repr(align(64))]
pub struct Qsbr {
    /// The global generation. Starts at 1 so that a slot's initial zero is
    /// unambiguously "never checkpointed".
    global: AtomicU64,
    workers: Registry<QsbrSlot>,
}

impl Qsbr {
    /// Create a reclamation domain with no registered workers.
    pub fn new() -> Self {
        Self {
            global: AtomicU64::new(1),
            workers: Registry::new(),
        }
    }

    /// Register the calling thread as a worker of this domain. Idempotent.
    pub fn register(&self) -> Result<(), Error> {
        self.workers.register()
    }

    /// Unregister the calling thread, removing its slot from sync scans.
    /// A no-op if the thread never registered.
    pub fn unregister(&self) {
        self.workers.unregister();
    }

    /// Declare a quiescent state for the calling thread.
    ///
    /// The seq-cst fence orders every preceding access before the
    /// declaration, so callers may treat a checkpoint as a full barrier:
    /// stores the worker made (say, unlinking a pointer) are globally
    /// visible before its quiescence is, and subsequent loads see the
    /// post-barrier world.
    #[inline]
    pub fn checkpoint(&self) {
        fence(Ordering::SeqCst);
        let generation = self.global.load(Ordering::Relaxed);
        let registered = self
            .workers
            .with_current(|slot| slot.local.store(generation, Ordering::Relaxed));
        debug_assert!(
            registered.is_some(),
            "checkpoint() on an unregistered worker"
        );
    }

    /// Open a new grace period and return its generation.
    ///
    /// Objects made unreachable *before* this call are reclaimable once
    /// [`sync`](Qsbr::sync) returns `true` for the returned generation.
    /// Internally serialised; writers may call it concurrently.
    #[inline]
    pub fn barrier(&self) -> Generation {
        self.global.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Has every registered worker passed a quiescent state at or after
    /// `target`?
    ///
    /// The calling thread checkpoints its own slot first, so a registered
    /// writer cannot stall itself. Non-blocking: callers poll.
    pub fn sync(&self, target: Generation) -> bool {
        self.checkpoint();
        self.workers
            .all(|slot| slot.local.load(Ordering::Relaxed) >= target)
    }
}

impl Default for Qsbr {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Qsbr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Qsbr")
            .field("global", &self.global.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
