//! Epoch-based reclamation (EBR).
//!
//! Reference:
//!
//! > K. Fraser, Practical lock-freedom,
//! > Technical Report UCAM-CL-TR-579, February 2004.
//!
//! Workers that actively reference globally visible objects must do so
//! between [`Ebr::enter`] and [`Ebr::exit`]. The grace period is tracked
//! with a global epoch counter taking only the values 0, 1 and 2: objects
//! unlinked while the global epoch is `e` may be reclaimed once the counter
//! has advanced twice past `e`. Three epochs suffice (`e`, `e-1`, `e-2`),
//! so the counter uses clock arithmetic.
//!
//! See [`Ebr::sync`] for the detailed argument.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering, fence};

use crate::Error;
use crate::registry::Registry;

/// Number of epoch values.
pub const EPOCHS: usize = 3;

/// High bit of the worker's local epoch word: set while the worker is
/// inside a critical section.
const ACTIVE: u32 = 0x8000_0000;

/// Per-worker epoch word.
///
/// Written only by the owning worker (at `enter`/`exit`), read by the
/// writer during `sync` scans. Cache-line aligned to keep one worker's
/// enter/exit traffic from invalidating another's line.
#[derive(Default)]
#[repr(align(64))]
struct EbrSlot {
    /// The observed epoch, with [`ACTIVE`] set while in a critical section.
    /// Zero when idle.
    local: AtomicU32,
}

/// Result of an [`Ebr::sync`] attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncStatus {
    /// Whether a new global epoch was announced.
    pub advanced: bool,
    /// The epoch whose retired objects are ready to be reclaimed.
    pub gc_epoch: u32,
}

/// An epoch-based reclamation domain.
///
/// Workers register themselves with [`Ebr::register`] before entering any
/// critical section. [`Ebr::sync`] calls must be serialised by the caller;
/// every other operation may run concurrently from any registered worker.
#[repr(align(64))]
pub struct Ebr {
    /// The global epoch, always one of 0, 1 or 2.
    global: AtomicU32,
    workers: Registry<EbrSlot>,
}

impl Ebr {
    /// Create a reclamation domain with the global epoch at 0 and no
    /// registered workers.
    pub fn new() -> Self {
        Self {
            global: AtomicU32::new(0),
            workers: Registry::new(),
        }
    }

    /// Register the calling thread as a worker of this domain.
    ///
    /// Must precede the first [`enter`](Ebr::enter). Idempotent.
    pub fn register(&self) -> Result<(), Error> {
        self.workers.register()
    }

    /// Unregister the calling thread, removing its slot from sync scans.
    ///
    /// Optional: a thread that exits without unregistering is cleaned up by
    /// its thread-local destructor. A no-op if the thread never registered.
    pub fn unregister(&self) {
        self.workers.unregister();
    }

    /// Mark the entrance to a critical section.
    ///
    /// Sets the active flag and observes the global epoch. The seq-cst
    /// fence ensures the observation is globally visible before any load
    /// performed inside the critical section.
    #[inline]
    pub fn enter(&self) {
        let epoch = self.global.load(Ordering::Relaxed) | ACTIVE;
        let registered = self
            .workers
            .with_current(|slot| slot.local.store(epoch, Ordering::Relaxed));
        debug_assert!(registered.is_some(), "enter() on an unregistered worker");
        fence(Ordering::SeqCst);
    }

    /// Mark the exit of a critical section.
    ///
    /// The seq-cst fence ensures every access made inside the critical
    /// section reaches global visibility before the active flag clears.
    #[inline]
    pub fn exit(&self) {
        fence(Ordering::SeqCst);
        let registered = self.workers.with_current(|slot| {
            debug_assert!(
                slot.local.load(Ordering::Relaxed) & ACTIVE != 0,
                "exit() without a matching enter()"
            );
            slot.local.store(0, Ordering::Relaxed);
        });
        debug_assert!(registered.is_some(), "exit() on an unregistered worker");
    }

    /// Attempt to announce a new global epoch.
    ///
    /// Sync points must be serialised by the caller; the domain provides no
    /// internal lock for them. A call doubles as a full memory barrier, so
    /// the caller's preceding unlink of an object is globally visible
    /// before any worker scan.
    ///
    /// Returns whether a new epoch was announced, together with the epoch
    /// whose objects are ready for reclamation.
    pub fn sync(&self) -> SyncStatus {
        let epoch = self.global.load(Ordering::Relaxed);
        fence(Ordering::SeqCst);

        // Has every active worker observed the current global epoch?
        let ready = self.workers.all(|slot| {
            let local = slot.local.load(Ordering::Relaxed);
            let active = local & ACTIVE != 0;
            !active || local == (epoch | ACTIVE)
        });
        if !ready {
            return SyncStatus {
                advanced: false,
                gc_epoch: self.gc_epoch(),
            };
        }

        // Announce the new global epoch `e`. At this point:
        //
        // - Active workers are either still running a critical section
        //   opened under `e-1`, or already observing `e`.
        // - Inactive workers may become active before or after the store,
        //   observing `e-1` or `e`.
        // - No active worker can hold a stale `e-2` observation: it would
        //   have failed the scan above. Clock arithmetic keeps the three
        //   values from aliasing.
        //
        // Therefore no worker is still running a critical section in
        // `e-2`, and that epoch is ready for reclamation.
        self.global
            .store((epoch + 1) % EPOCHS as u32, Ordering::Relaxed);

        SyncStatus {
            advanced: true,
            gc_epoch: self.gc_epoch(),
        }
    }

    /// The epoch into which objects unlinked *now* are staged.
    #[inline]
    pub fn staging_epoch(&self) -> u32 {
        self.global.load(Ordering::Relaxed)
    }

    /// The epoch whose objects are guaranteed reader-free.
    ///
    /// With three epoch values, `e-2` is the next epoch in clock
    /// arithmetic.
    #[inline]
    pub fn gc_epoch(&self) -> u32 {
        (self.global.load(Ordering::Relaxed) + 1) % EPOCHS as u32
    }
}

impl Default for Ebr {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Ebr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ebr")
            .field("global", &self.global.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
