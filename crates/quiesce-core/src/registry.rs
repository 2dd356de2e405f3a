//! Worker-slot registry shared by the EBR and QSBR reclaimers.
//!
//! Each reclaimer owns a set of per-worker slots. A worker's slot is written
//! only by the owning thread (its local epoch or generation word) and read by
//! writers scanning for the grace period. Slots are discovered through
//! thread-local storage keyed by a process-unique reclaimer id, so a single
//! thread can be registered with any number of reclaimers at once.
//!
//! ## Lifecycle
//!
//! - `register` allocates the calling thread's slot on first use,
//!   zero-initialises it, and inserts it into the reclaimer's set. Insertion
//!   and removal are serialised by a mutex; scans take the same mutex, which
//!   only contends with the rare register/unregister path.
//! - `unregister` drops the thread-local handle, which unlinks the slot from
//!   the set.
//! - A thread that exits without unregistering is cleaned up by the
//!   thread-local destructor: the handle's `Drop` performs the same removal,
//!   so a leaked slot never lingers in a scan.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::Error;

/// Maximum number of concurrently registered workers per reclaimer.
pub(crate) const MAX_WORKERS: usize = 512;

/// Source of reclaimer identifiers. Ids are never recycled, so a stale
/// thread-local entry can never be confused with a newer reclaimer.
static NEXT_RECLAIMER_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Slot handles held by the current thread, keyed by reclaimer id.
    /// Dropped on thread exit, unregistering any leaked slots.
    static THREAD_SLOTS: RefCell<HashMap<u64, Box<dyn Any>>> =
        RefCell::new(HashMap::new());
}

/// The slot set of one reclaimer.
struct SlotSet<S> {
    slots: Mutex<Vec<Arc<S>>>,
}

/// A registered worker's handle, stored in thread-local storage.
/// Dropping it removes the slot from the owning reclaimer's set.
struct SlotHandle<S> {
    slot: Arc<S>,
    set: Weak<SlotSet<S>>,
}

impl<S> Drop for SlotHandle<S> {
    fn drop(&mut self) {
        if let Some(set) = self.set.upgrade() {
            let mut slots = set.slots.lock();
            if let Some(pos) = slots.iter().position(|s| Arc::ptr_eq(s, &self.slot)) {
                slots.swap_remove(pos);
            }
        }
    }
}

/// Per-reclaimer worker registry.
pub(crate) struct Registry<S> {
    id: u64,
    shared: Arc<SlotSet<S>>,
}

impl<S: Default + Send + Sync + 'static> Registry<S> {
    pub(crate) fn new() -> Self {
        Self {
            id: NEXT_RECLAIMER_ID.fetch_add(1, Ordering::Relaxed),
            shared: Arc::new(SlotSet {
                slots: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register the calling thread, allocating its slot on first call.
    ///
    /// Idempotent: re-registering an already-registered worker is a no-op
    /// (and a debug-asserted misuse). Fails with [`Error::RegistryFull`] once
    /// [`MAX_WORKERS`] workers are registered, mutating nothing.
    pub(crate) fn register(&self) -> Result<(), Error> {
        THREAD_SLOTS.with(|tls| {
            let mut map = tls.borrow_mut();
            if map.contains_key(&self.id) {
                debug_assert!(false, "worker registered twice with the same reclaimer");
                return Ok(());
            }
            let slot = Arc::new(S::default());
            {
                let mut slots = self.shared.slots.lock();
                if slots.len() >= MAX_WORKERS {
                    return Err(Error::RegistryFull);
                }
                slots.push(Arc::clone(&slot));
            }
            map.insert(
                self.id,
                Box::new(SlotHandle {
                    slot,
                    set: Arc::downgrade(&self.shared),
                }),
            );
            Ok(())
        })
    }

    /// Unregister the calling thread, unlinking and freeing its slot.
    /// A no-op if the thread was never registered.
    pub(crate) fn unregister(&self) {
        THREAD_SLOTS.with(|tls| {
            tls.borrow_mut().remove(&self.id);
        });
    }

    /// Run `f` on the calling thread's slot, or return `None` if the thread
    /// is not registered with this reclaimer.
    #[inline]
    pub(crate) fn with_current<R>(&self, f: impl FnOnce(&S) -> R) -> Option<R> {
        THREAD_SLOTS.with(|tls| {
            let map = tls.borrow();
            let handle = map.get(&self.id)?.downcast_ref::<SlotHandle<S>>()?;
            Some(f(&handle.slot))
        })
    }

    /// Scan every registered slot; returns `true` iff `f` holds for all of
    /// them. Holds the set lock for the duration of the scan and does not
    /// allocate.
    pub(crate) fn all(&self, mut f: impl FnMut(&S) -> bool) -> bool {
        self.shared.slots.lock().iter().all(|slot| f(slot))
    }

    /// Number of registered workers.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.shared.slots.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;

    #[derive(Default)]
    struct TestSlot {
        word: AtomicU32,
    }

    #[test]
    fn register_inserts_one_slot() {
        let registry: Registry<TestSlot> = Registry::new();
        assert_eq!(registry.len(), 0);
        registry.register().unwrap();
        assert_eq!(registry.len(), 1);
        registry.unregister();
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn unregister_without_register_is_noop() {
        let registry: Registry<TestSlot> = Registry::new();
        registry.unregister();
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn with_current_requires_registration() {
        let registry: Registry<TestSlot> = Registry::new();
        assert!(registry.with_current(|_| ()).is_none());
        registry.register().unwrap();
        let loaded = registry.with_current(|slot| slot.word.load(Ordering::Relaxed));
        assert_eq!(loaded, Some(0));
        registry.unregister();
        assert!(registry.with_current(|_| ()).is_none());
    }

    #[test]
    fn slot_is_zero_initialised_on_reregister() {
        let registry: Registry<TestSlot> = Registry::new();
        registry.register().unwrap();
        registry
            .with_current(|slot| slot.word.store(7, Ordering::Relaxed))
            .unwrap();
        registry.unregister();
        registry.register().unwrap();
        let loaded = registry.with_current(|slot| slot.word.load(Ordering::Relaxed));
        assert_eq!(loaded, Some(0));
        registry.unregister();
    }

    #[test]
    fn two_reclaimers_do_not_share_slots() {
        let a: Registry<TestSlot> = Registry::new();
        let b: Registry<TestSlot> = Registry::new();
        a.register().unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 0);
        assert!(b.with_current(|_| ()).is_none());
        a.unregister();
    }

    #[test]
    fn all_scans_every_slot() {
        let registry: Registry<TestSlot> = Registry::new();
        assert!(registry.all(|_| false), "empty set is vacuously true");

        registry.register().unwrap();
        registry
            .with_current(|slot| slot.word.store(1, Ordering::Relaxed))
            .unwrap();
        assert!(registry.all(|slot| slot.word.load(Ordering::Relaxed) == 1));
        assert!(!registry.all(|slot| slot.word.load(Ordering::Relaxed) == 2));
        registry.unregister();
    }

    #[test]
    fn register_fails_when_full() {
        let registry: Registry<TestSlot> = Registry::new();
        {
            let mut slots = registry.shared.slots.lock();
            for _ in 0..MAX_WORKERS {
                slots.push(Arc::new(TestSlot::default()));
            }
        }
        assert_eq!(registry.register(), Err(Error::RegistryFull));
        // The failed call must not have left a thread-local handle behind.
        assert!(registry.with_current(|_| ()).is_none());
    }

    #[test]
    fn thread_exit_unlinks_leaked_slot() {
        let registry: Arc<Registry<TestSlot>> = Arc::new(Registry::new());
        let remote = Arc::clone(&registry);
        std::thread::spawn(move || {
            remote.register().unwrap();
            assert_eq!(remote.len(), 1);
            // No unregister: the thread-local destructor must clean up.
        })
        .join()
        .unwrap();
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn slots_are_per_thread() {
        let registry: Arc<Registry<TestSlot>> = Arc::new(Registry::new());
        registry.register().unwrap();
        registry
            .with_current(|slot| slot.word.store(42, Ordering::Relaxed))
            .unwrap();

        let remote = Arc::clone(&registry);
        std::thread::spawn(move || {
            remote.register().unwrap();
            let loaded = remote.with_current(|slot| slot.word.load(Ordering::Relaxed));
            assert_eq!(loaded, Some(0), "remote thread sees its own slot");
            remote.unregister();
        })
        .join()
        .unwrap();

        let loaded = registry.with_current(|slot| slot.word.load(Ordering::Relaxed));
        assert_eq!(loaded, Some(42));
        registry.unregister();
    }
}
