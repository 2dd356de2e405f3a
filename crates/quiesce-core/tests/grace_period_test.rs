//! End-to-end grace-period tests: readers dereference a writer-managed
//! pointer while the writer mutates, retires and reclaims it.

#![allow(unsafe_code)]

use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use quiesce_core::{Drained, Entry, Gc, Qsbr};

const MAGIC: u32 = 0x5a5a_5a5a;
const READERS: usize = 3;
const SWAPS: usize = 400;

struct Node {
    value: u32,
    entry: Entry,
}

impl Node {
    fn boxed() -> *mut Node {
        Box::into_raw(Box::new(Node {
            value: MAGIC,
            entry: Entry::new(),
        }))
    }
}

/// Writer keeps swapping a fresh node into a shared slot, retiring the old
/// one through the collector. Readers must always observe the magic value.
#[test]
fn gc_reclaims_every_retired_node() {
    let reclaimed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&reclaimed);
    let gc: Arc<Gc<Node>> = Arc::new(Gc::with_reclaim(
        mem::offset_of!(Node, entry),
        move |batch: Drained<Node>| {
            for obj in batch {
                counter.fetch_add(1, Ordering::Relaxed);
                // SAFETY: nodes are allocated with `Box::into_raw` below
                // and reclaimed exactly once.
                drop(unsafe { Box::from_raw(obj) });
            }
        },
    ));

    let slot = Arc::new(AtomicPtr::new(Node::boxed()));
    let stop = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..READERS)
        .map(|_| {
            let gc = Arc::clone(&gc);
            let slot = Arc::clone(&slot);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                gc.register().unwrap();
                while !stop.load(Ordering::Relaxed) {
                    gc.crit_enter();
                    let p = slot.load(Ordering::Acquire);
                    if !p.is_null() {
                        // SAFETY: the node was published before the load
                        // and cannot be reclaimed while this critical
                        // section is open.
                        let value = unsafe { (*p).value };
                        assert_eq!(value, MAGIC);
                    }
                    gc.crit_exit();
                }
                gc.unregister();
            })
        })
        .collect();

    gc.register().unwrap();
    let mut retired = 0usize;
    for _ in 0..SWAPS {
        let old = slot.swap(Node::boxed(), Ordering::AcqRel);
        // SAFETY: `old` is unlinked (no longer loadable from the slot) and
        // retired exactly once.
        unsafe { gc.limbo(old) };
        retired += 1;
        gc.cycle();
    }

    stop.store(true, Ordering::Relaxed);
    for reader in readers {
        reader.join().unwrap();
    }

    // Retire the final resident node and drain.
    let last = slot.swap(std::ptr::null_mut(), Ordering::AcqRel);
    unsafe { gc.limbo(last) };
    retired += 1;
    gc.full(Duration::from_millis(1));

    assert_eq!(reclaimed.load(Ordering::Relaxed), retired);
    gc.unregister();
}

/// The QSBR rendition: readers checkpoint after every dereference; the
/// writer gates destruction on a barrier generation.
#[test]
fn qsbr_barrier_gates_destruction() {
    let qsbr = Arc::new(Qsbr::new());
    let slot = Arc::new(AtomicPtr::new(Box::into_raw(Box::new(MAGIC))));
    let stop = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..READERS)
        .map(|_| {
            let qsbr = Arc::clone(&qsbr);
            let slot = Arc::clone(&slot);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                qsbr.register().unwrap();
                while !stop.load(Ordering::Relaxed) {
                    let p = slot.load(Ordering::Acquire);
                    if !p.is_null() {
                        // SAFETY: the writer frees a value only after every
                        // registered worker checkpointed past its barrier.
                        let value = unsafe { *p };
                        assert_eq!(value, MAGIC);
                    }
                    qsbr.checkpoint();
                }
                qsbr.unregister();
            })
        })
        .collect();

    qsbr.register().unwrap();
    for _ in 0..SWAPS {
        let old = slot.swap(Box::into_raw(Box::new(MAGIC)), Ordering::AcqRel);
        let target = qsbr.barrier();
        while !qsbr.sync(target) {
            thread::yield_now();
        }
        // Grace period elapsed: no reader can still hold `old`.
        // SAFETY: unlinked above, grace period confirmed.
        drop(unsafe { Box::from_raw(old) });
    }

    stop.store(true, Ordering::Relaxed);
    for reader in readers {
        reader.join().unwrap();
    }

    let last = slot.swap(std::ptr::null_mut(), Ordering::AcqRel);
    // SAFETY: readers are gone; the slot pointer is the last reference.
    drop(unsafe { Box::from_raw(last) });
    qsbr.unregister();
}
