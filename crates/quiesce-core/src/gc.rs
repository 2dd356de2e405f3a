//! Deferred reclamation over epoch-based reclamation.
//!
//! Retired objects are first pushed onto a lock-free *limbo* list. Each
//! [`Gc::cycle`] asks the underlying [`Ebr`] domain to announce a new
//! epoch; when it does, the limbo list moves wholesale into the list of the
//! current staging epoch, and the list of the epoch declared reader-free is
//! handed to the reclaim callback. An object therefore survives at least
//! two full epoch advances between retirement and destruction, which is
//! the grace period EBR guarantees.
//!
//! Objects participate intrusively: they embed an [`Entry`] header, and the
//! collector converts between entry and object addresses using the byte
//! offset registered at construction. Retiring an object never allocates.

#![allow(unsafe_code)]

use std::fmt;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::thread;
use std::time::Duration;

use crate::Error;
use crate::backoff::Backoff;
use crate::ebr::{EPOCHS, Ebr};

/// Intrusive list header embedded in reclaimable objects.
///
/// Exactly one pointer wide. Callers hand object addresses to
/// [`Gc::limbo`]; the header's location inside the object is fixed once,
/// at collector construction, typically with `core::mem::offset_of!`.
#[repr(transparent)]
pub struct Entry {
    next: AtomicPtr<Entry>,
}

impl Entry {
    pub const fn new() -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

impl Default for Entry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry").finish_non_exhaustive()
    }
}

/// Iterator over a drained batch of retired objects.
///
/// Yields raw object pointers recovered from the intrusive list. The next
/// link is read *before* an object is yielded, so the callback may destroy
/// each object as it goes.
pub struct Drained<T> {
    next: *mut Entry,
    obj_off: usize,
    _marker: PhantomData<fn(*mut T)>,
}

impl<T> Iterator for Drained<T> {
    type Item = *mut T;

    fn next(&mut self) -> Option<*mut T> {
        if self.next.is_null() {
            return None;
        }
        let entry = self.next;
        // SAFETY: every entry on a drained list is a live header that was
        // pushed by `limbo`; its `next` field was written before the entry
        // became reachable from the list head.
        self.next = unsafe { (*entry).next.load(Ordering::Relaxed) };
        Some(entry.cast::<u8>().wrapping_sub(self.obj_off).cast::<T>())
    }
}

type ReclaimFn<T> = Box<dyn Fn(Drained<T>) + Send + Sync>;

/// A deferred-reclamation collector for objects of type `T`.
///
/// Readers bracket their accesses with [`crit_enter`](Gc::crit_enter) /
/// [`crit_exit`](Gc::crit_exit); the writer retires unlinked objects with
/// [`limbo`](Gc::limbo) and drives reclamation with [`cycle`](Gc::cycle)
/// or [`full`](Gc::full).
///
/// [`cycle`](Gc::cycle) and [`full`](Gc::full) inherit the serialisation
/// contract of [`Ebr::sync`]: at most one thread may drive them at a time.
/// Everything else may run concurrently from any registered worker.
pub struct Gc<T> {
    /// Retired entries accumulate here until a cycle steals the list.
    limbo: AtomicPtr<Entry>,
    /// One list per epoch value: filled at the staging epoch, drained once
    /// that epoch becomes reader-free.
    epoch_list: [AtomicPtr<Entry>; EPOCHS],
    ebr: Ebr,
    /// Byte offset of the embedded [`Entry`] within `T`.
    obj_off: usize,
    /// `None` selects the default reclaimer, which frees each object as a
    /// `Box<T>`.
    reclaim: Option<ReclaimFn<T>>,
    _marker: PhantomData<*mut T>,
}

// SAFETY: the collector shuttles raw object pointers between threads (an
// object retired on one thread is destroyed by whichever thread runs the
// reclaiming cycle), which is exactly the `T: Send` contract. It never
// produces a `&T`.
unsafe impl<T: Send> Send for Gc<T> {}
unsafe impl<T: Send> Sync for Gc<T> {}

impl<T> Gc<T> {
    /// Create a collector whose default reclaimer frees each object as a
    /// `Box<T>`.
    ///
    /// `obj_off` is the byte offset of the embedded [`Entry`] within `T`,
    /// typically `core::mem::offset_of!(T, entry)`. Objects retired through
    /// a default-reclaim collector must have been allocated with
    /// `Box::into_raw`.
    pub fn new(obj_off: usize) -> Self {
        Self::build(obj_off, None)
    }

    /// Create a collector with a custom reclaim callback.
    ///
    /// The callback receives each drained batch and is responsible for
    /// destroying every object the iterator yields.
    pub fn with_reclaim(
        obj_off: usize,
        reclaim: impl Fn(Drained<T>) + Send + Sync + 'static,
    ) -> Self {
        Self::build(obj_off, Some(Box::new(reclaim)))
    }

    fn build(obj_off: usize, reclaim: Option<ReclaimFn<T>>) -> Self {
        Self {
            limbo: AtomicPtr::new(ptr::null_mut()),
            epoch_list: [const { AtomicPtr::new(ptr::null_mut()) }; EPOCHS],
            ebr: Ebr::new(),
            obj_off,
            reclaim,
            _marker: PhantomData,
        }
    }

    /// Register the calling thread with the underlying EBR domain.
    pub fn register(&self) -> Result<(), Error> {
        self.ebr.register()
    }

    /// Unregister the calling thread.
    pub fn unregister(&self) {
        self.ebr.unregister();
    }

    /// Enter a read-side critical section.
    #[inline]
    pub fn crit_enter(&self) {
        self.ebr.enter();
    }

    /// Exit a read-side critical section.
    #[inline]
    pub fn crit_exit(&self) {
        self.ebr.exit();
    }

    /// Retire an object: push it onto the limbo list.
    ///
    /// Lock-free and allocation-free; safe to call from any thread,
    /// including concurrently with a cycle.
    ///
    /// # Safety
    ///
    /// - `obj` must point to a live `T` whose embedded [`Entry`] sits at
    ///   the offset registered at construction.
    /// - The object must already be unlinked from the shared structure, so
    ///   that no new references to it can be formed after this call.
    /// - The object must not be retired twice, and the caller must not
    ///   touch it again; ownership passes to the collector.
    pub unsafe fn limbo(&self, obj: *mut T) {
        let entry = obj.cast::<u8>().wrapping_add(self.obj_off).cast::<Entry>();
        loop {
            let head = self.limbo.load(Ordering::Relaxed);
            // SAFETY: `entry` is a valid header per the caller contract,
            // and until the push succeeds it is visible to no other thread.
            unsafe { (*entry).next.store(head, Ordering::Relaxed) };
            if self
                .limbo
                .compare_exchange_weak(head, entry, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    /// Run one step of the reclamation state machine.
    ///
    /// Non-blocking; returns without reclaiming if the EBR domain could not
    /// announce a new epoch. When an epoch is announced, the limbo list is
    /// staged under the new epoch and the list of the reader-free epoch is
    /// reclaimed; if that list is empty the step retries, advancing through
    /// at most one full epoch cycle in a single call.
    ///
    /// Calls must be serialised by the caller (the [`Ebr::sync`] contract).
    pub fn cycle(&self) {
        for _ in 0..EPOCHS {
            let status = self.ebr.sync();
            if !status.advanced {
                return;
            }

            // Move everything retired since the last step into the bin of
            // the current staging epoch. Those objects were unlinked while
            // readers may already have observed them; they must survive
            // until this staging epoch itself becomes reader-free.
            let staging = self.ebr.staging_epoch() as usize;
            debug_assert!(
                self.epoch_list[staging].load(Ordering::Relaxed).is_null(),
                "staging bin must have been drained two epochs ago"
            );
            let stolen = self.limbo.swap(ptr::null_mut(), Ordering::Acquire);
            self.epoch_list[staging].store(stolen, Ordering::Relaxed);

            let gc_list =
                self.epoch_list[status.gc_epoch as usize].swap(ptr::null_mut(), Ordering::Relaxed);
            if gc_list.is_null() {
                // Nothing was staged in the reader-free epoch; try the
                // next one, but only for one full cycle.
                continue;
            }
            self.invoke_reclaim(gc_list);
            return;
        }
    }

    /// Drain the collector: block until the limbo list and every epoch bin
    /// are empty.
    ///
    /// Runs [`cycle`](Gc::cycle) repeatedly, spinning with exponential
    /// backoff between attempts and, once the backoff saturates, sleeping
    /// `retry` per attempt. Blocks indefinitely if a reader never leaves
    /// its critical section; callers ensure reclamation can make progress.
    pub fn full(&self, retry: Duration) {
        let mut backoff = Backoff::new();
        loop {
            self.cycle();
            if self.is_drained() {
                return;
            }
            if !backoff.spin() {
                thread::sleep(retry);
            }
        }
    }

    fn is_drained(&self) -> bool {
        self.limbo.load(Ordering::Relaxed).is_null()
            && self
                .epoch_list
                .iter()
                .all(|list| list.load(Ordering::Relaxed).is_null())
    }

    fn invoke_reclaim(&self, head: *mut Entry) {
        let batch = Drained {
            next: head,
            obj_off: self.obj_off,
            _marker: PhantomData,
        };
        match &self.reclaim {
            Some(reclaim) => reclaim(batch),
            None => {
                for obj in batch {
                    // SAFETY: the default reclaimer requires (documented on
                    // `new`) that retired objects came from `Box::into_raw`;
                    // the epoch model guarantees no reader still observes
                    // them.
                    drop(unsafe { Box::from_raw(obj) });
                }
            }
        }
    }
}

impl<T> Drop for Gc<T> {
    fn drop(&mut self) {
        debug_assert!(
            self.is_drained(),
            "collector dropped with objects awaiting reclamation"
        );
    }
}

impl<T> fmt::Debug for Gc<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gc")
            .field("obj_off", &self.obj_off)
            .field("ebr", &self.ebr)
            .finish_non_exhaustive()
    }
}
