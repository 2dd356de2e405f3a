//! Stress scenarios.
//!
//! A single writer toggles the visibility of four cache-aligned records and
//! retires the pointers they publish; every other worker is a reader that
//! dereferences through a record whenever it is visible. Readers must
//! always observe the magic value: a null or torn read means a pointer was
//! destroyed while a reader could still reach it.
//!
//! Destruction is simulated for the EBR and QSBR scenarios (the pointer
//! target is a static cell; "destroying" it means nulling the record's
//! pointer once the grace period has elapsed) and real for the GC scenario
//! (heap nodes retired through the collector and freed by its reclaim
//! callback).

#![allow(unsafe_code)]

use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use quiesce_core::{EPOCHS, Ebr, Entry, Gc, Qsbr};

/// The value every successful dereference must observe.
pub const MAGIC: u32 = 0x5a5a_5a5a;

/// Number of records in the shared table. Power of two.
const TABLE_SLOTS: usize = 4;

/// The pointer target for the simulated-destruction scenarios.
static MAGIC_CELL: u32 = MAGIC;

fn magic_ptr() -> *mut u32 {
    (&raw const MAGIC_CELL).cast_mut()
}

/// Which reclamation scheme a stress run exercises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    Ebr,
    Qsbr,
    Gc,
}

impl Scenario {
    pub fn name(self) -> &'static str {
        match self {
            Scenario::Ebr => "ebr",
            Scenario::Qsbr => "qsbr",
            Scenario::Gc => "gc",
        }
    }
}

/// Parameters of a stress run.
#[derive(Debug, Clone, Copy)]
pub struct StressConfig {
    pub duration: Duration,
    /// Total worker count, including the single writer.
    pub workers: usize,
}

impl StressConfig {
    /// Build a config; `workers` defaults to one reader per CPU plus the
    /// writer, and is clamped to at least one writer and one reader.
    pub fn new(duration: Duration, workers: Option<usize>) -> Self {
        let default_workers = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2)
            + 1;
        Self {
            duration,
            workers: workers.unwrap_or(default_workers).max(2),
        }
    }
}

/// Counters accumulated by a stress run.
#[derive(Debug, Clone, Copy, Default)]
pub struct StressOutcome {
    pub reader_loops: u64,
    pub writer_loops: u64,
    /// Pointers made unreachable and handed to the grace-period machinery.
    pub retired: u64,
    /// Pointers destroyed after their grace period elapsed.
    pub reclaimed: u64,
    /// Reader observations of a destroyed pointer. Must be zero.
    pub violations: u64,
}

/// Run one scenario to completion, including the final drain.
///
/// On return, `retired == reclaimed` and (for a correct implementation)
/// `violations == 0`.
pub fn run(scenario: Scenario, config: StressConfig) -> StressOutcome {
    match scenario {
        Scenario::Ebr => run_ebr(config),
        Scenario::Qsbr => run_qsbr(config),
        Scenario::Gc => run_gc(config),
    }
}

// ---------------------------------------------------------------------------
// Shared table records
// ---------------------------------------------------------------------------

/// A record of the shared table for the EBR and QSBR scenarios.
///
/// `tag` is zero while the record is live or empty; a removal stamps it
/// with the grace-period tag of the scheme under test (`EPOCHS + epoch`
/// for EBR, the barrier generation for QSBR).
#[repr(align(64))]
struct Record {
    ptr: AtomicPtr<u32>,
    visible: AtomicBool,
    tag: AtomicU64,
}

impl Record {
    fn new() -> Self {
        Self {
            ptr: AtomicPtr::new(ptr::null_mut()),
            visible: AtomicBool::new(false),
            tag: AtomicU64::new(0),
        }
    }
}

fn record_table() -> Arc<Vec<Record>> {
    Arc::new((0..TABLE_SLOTS).map(|_| Record::new()).collect())
}

/// One reader probe: dereference the record if it is visible.
/// Returns `true` on a violation.
#[inline]
fn probe(rec: &Record) -> bool {
    if rec.visible.load(Ordering::Acquire) {
        let p = rec.ptr.load(Ordering::Acquire);
        // SAFETY: a visible record's pointer refers to the static magic
        // cell; the writer nulls it only after the grace period. Observing
        // null (or anything but the magic value) is the failure this
        // harness exists to catch.
        if p.is_null() || unsafe { *p } != MAGIC {
            return true;
        }
    }
    false
}

// ---------------------------------------------------------------------------
// EBR scenario
// ---------------------------------------------------------------------------

fn run_ebr(config: StressConfig) -> StressOutcome {
    let ebr = Arc::new(Ebr::new());
    let table = record_table();
    let stop = Arc::new(AtomicBool::new(false));
    let start = Arc::new(Barrier::new(config.workers + 1));

    let mut readers = Vec::with_capacity(config.workers - 1);
    for _ in 1..config.workers {
        let ebr = Arc::clone(&ebr);
        let table = Arc::clone(&table);
        let stop = Arc::clone(&stop);
        let start = Arc::clone(&start);
        readers.push(thread::spawn(move || {
            ebr.register().expect("reader registration");
            start.wait();
            let mut n = 0;
            let (mut loops, mut violations) = (0u64, 0u64);
            while !stop.load(Ordering::Relaxed) {
                n = (n + 1) & (TABLE_SLOTS - 1);
                ebr.enter();
                if probe(&table[n]) {
                    violations += 1;
                }
                ebr.exit();
                loops += 1;
            }
            ebr.unregister();
            (loops, violations)
        }));
    }

    let writer = {
        let ebr = Arc::clone(&ebr);
        let table = Arc::clone(&table);
        let stop = Arc::clone(&stop);
        let start = Arc::clone(&start);
        thread::spawn(move || {
            ebr.register().expect("writer registration");
            start.wait();
            let mut outcome = StressOutcome::default();
            let mut n = 0;
            while !stop.load(Ordering::Relaxed) {
                n = (n + 1) & (TABLE_SLOTS - 1);
                ebr_writer_step(&ebr, &table, n, &mut outcome);
                outcome.writer_loops += 1;
            }
            // Drain the pending removals; with the readers winding down,
            // every sync soon advances.
            while table.iter().any(|rec| rec.tag.load(Ordering::Relaxed) != 0) {
                let status = ebr.sync();
                destroy_tagged(&table, EPOCHS as u64 + u64::from(status.gc_epoch), &mut outcome);
                thread::yield_now();
            }
            ebr.unregister();
            outcome
        })
    };

    start.wait();
    thread::sleep(config.duration);
    stop.store(true, Ordering::Relaxed);

    collect(writer, readers)
}

fn ebr_writer_step(ebr: &Ebr, table: &[Record], n: usize, out: &mut StressOutcome) {
    let rec = &table[n];
    if rec.visible.load(Ordering::Relaxed) {
        // Remove: hide the record, then stamp it with the epoch at
        // removal time.
        rec.visible.store(false, Ordering::Release);
        rec.tag.store(
            EPOCHS as u64 + u64::from(ebr.staging_epoch()),
            Ordering::Relaxed,
        );
        out.retired += 1;
    } else if rec.tag.load(Ordering::Relaxed) == 0 {
        // Insert: publish the value, then make the record visible.
        rec.ptr.store(magic_ptr(), Ordering::Release);
        rec.visible.store(true, Ordering::Release);
    }
    // Otherwise: invisible but not yet reclaimed.

    let status = ebr.sync();
    destroy_tagged(table, EPOCHS as u64 + u64::from(status.gc_epoch), out);
}

/// Destroy every record whose removal tag has reached its grace period.
fn destroy_tagged(table: &[Record], tag: u64, out: &mut StressOutcome) {
    for rec in table {
        if rec.tag.load(Ordering::Relaxed) == tag {
            rec.ptr.store(ptr::null_mut(), Ordering::Relaxed);
            rec.tag.store(0, Ordering::Relaxed);
            out.reclaimed += 1;
        }
    }
}

// ---------------------------------------------------------------------------
// QSBR scenario
// ---------------------------------------------------------------------------

fn run_qsbr(config: StressConfig) -> StressOutcome {
    let qsbr = Arc::new(Qsbr::new());
    let table = record_table();
    let stop = Arc::new(AtomicBool::new(false));
    let start = Arc::new(Barrier::new(config.workers + 1));

    let mut readers = Vec::with_capacity(config.workers - 1);
    for _ in 1..config.workers {
        let qsbr = Arc::clone(&qsbr);
        let table = Arc::clone(&table);
        let stop = Arc::clone(&stop);
        let start = Arc::clone(&start);
        readers.push(thread::spawn(move || {
            qsbr.register().expect("reader registration");
            start.wait();
            let mut n = 0;
            let (mut loops, mut violations) = (0u64, 0u64);
            while !stop.load(Ordering::Relaxed) {
                n = (n + 1) & (TABLE_SLOTS - 1);
                if probe(&table[n]) {
                    violations += 1;
                }
                // The record is no longer referenced: a natural quiescent
                // point.
                qsbr.checkpoint();
                loops += 1;
            }
            qsbr.unregister();
            (loops, violations)
        }));
    }

    let writer = {
        let qsbr = Arc::clone(&qsbr);
        let table = Arc::clone(&table);
        let stop = Arc::clone(&stop);
        let start = Arc::clone(&start);
        thread::spawn(move || {
            qsbr.register().expect("writer registration");
            start.wait();
            let mut outcome = StressOutcome::default();
            let mut n = 0;
            while !stop.load(Ordering::Relaxed) {
                n = (n + 1) & (TABLE_SLOTS - 1);
                qsbr_writer_step(&qsbr, &table, n, &mut outcome);
                outcome.writer_loops += 1;
            }
            // Drain: the exiting readers unregister, so every pending
            // generation is soon covered.
            while table.iter().any(|rec| rec.tag.load(Ordering::Relaxed) != 0) {
                qsbr_destroy_ready(&qsbr, &table, &mut outcome);
                thread::yield_now();
            }
            qsbr.unregister();
            outcome
        })
    };

    start.wait();
    thread::sleep(config.duration);
    stop.store(true, Ordering::Relaxed);

    collect(writer, readers)
}

fn qsbr_writer_step(qsbr: &Qsbr, table: &[Record], n: usize, out: &mut StressOutcome) {
    let rec = &table[n];
    if rec.visible.load(Ordering::Relaxed) {
        // Remove, then open a grace period for the removal.
        rec.visible.store(false, Ordering::Release);
        rec.tag.store(qsbr.barrier(), Ordering::Relaxed);
        out.retired += 1;
    } else if rec.tag.load(Ordering::Relaxed) == 0 {
        rec.ptr.store(magic_ptr(), Ordering::Release);
        rec.visible.store(true, Ordering::Release);
    }

    qsbr_destroy_ready(qsbr, table, out);
}

/// Destroy every record whose barrier generation has been covered by all
/// registered workers.
fn qsbr_destroy_ready(qsbr: &Qsbr, table: &[Record], out: &mut StressOutcome) {
    for rec in table {
        let target = rec.tag.load(Ordering::Relaxed);
        if target != 0 && qsbr.sync(target) {
            rec.ptr.store(ptr::null_mut(), Ordering::Relaxed);
            rec.tag.store(0, Ordering::Relaxed);
            out.reclaimed += 1;
        }
    }
}

// ---------------------------------------------------------------------------
// GC scenario
// ---------------------------------------------------------------------------

/// Heap node for the GC scenario; the intrusive header sits after the
/// payload, so the entry/object offset is exercised for real.
struct StressNode {
    value: u32,
    entry: Entry,
}

impl StressNode {
    fn boxed() -> *mut StressNode {
        Box::into_raw(Box::new(StressNode {
            value: MAGIC,
            entry: Entry::new(),
        }))
    }
}

/// A record of the shared table for the GC scenario.
#[repr(align(64))]
struct NodeRecord {
    ptr: AtomicPtr<StressNode>,
    visible: AtomicBool,
}

impl NodeRecord {
    fn new() -> Self {
        Self {
            ptr: AtomicPtr::new(ptr::null_mut()),
            visible: AtomicBool::new(false),
        }
    }
}

fn run_gc(config: StressConfig) -> StressOutcome {
    let reclaimed = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&reclaimed);
    let gc: Arc<Gc<StressNode>> = Arc::new(Gc::with_reclaim(
        mem::offset_of!(StressNode, entry),
        move |batch| {
            for obj in batch {
                counter.fetch_add(1, Ordering::Relaxed);
                // SAFETY: every node is allocated with `Box::into_raw` and
                // retired exactly once.
                drop(unsafe { Box::from_raw(obj) });
            }
        },
    ));
    let table: Arc<Vec<NodeRecord>> =
        Arc::new((0..TABLE_SLOTS).map(|_| NodeRecord::new()).collect());
    let stop = Arc::new(AtomicBool::new(false));
    let start = Arc::new(Barrier::new(config.workers + 1));

    let mut readers = Vec::with_capacity(config.workers - 1);
    for _ in 1..config.workers {
        let gc = Arc::clone(&gc);
        let table = Arc::clone(&table);
        let stop = Arc::clone(&stop);
        let start = Arc::clone(&start);
        readers.push(thread::spawn(move || {
            gc.register().expect("reader registration");
            start.wait();
            let mut n = 0;
            let (mut loops, mut violations) = (0u64, 0u64);
            while !stop.load(Ordering::Relaxed) {
                n = (n + 1) & (TABLE_SLOTS - 1);
                gc.crit_enter();
                let rec = &table[n];
                if rec.visible.load(Ordering::Acquire) {
                    let p = rec.ptr.load(Ordering::Acquire);
                    // SAFETY: the collector destroys a node only after the
                    // epoch model proves no critical section can still
                    // reach it.
                    if p.is_null() || unsafe { (*p).value } != MAGIC {
                        violations += 1;
                    }
                }
                gc.crit_exit();
                loops += 1;
            }
            gc.unregister();
            (loops, violations)
        }));
    }

    let writer = {
        let gc = Arc::clone(&gc);
        let table = Arc::clone(&table);
        let stop = Arc::clone(&stop);
        let start = Arc::clone(&start);
        let reclaimed = Arc::clone(&reclaimed);
        thread::spawn(move || {
            gc.register().expect("writer registration");
            start.wait();
            let mut outcome = StressOutcome::default();
            let mut n = 0;
            while !stop.load(Ordering::Relaxed) {
                n = (n + 1) & (TABLE_SLOTS - 1);
                let rec = &table[n];
                if rec.visible.load(Ordering::Relaxed) {
                    // Remove and retire. The record keeps its stale pointer;
                    // readers gate on the visibility flag.
                    rec.visible.store(false, Ordering::Release);
                    let node = rec.ptr.load(Ordering::Relaxed);
                    // SAFETY: the node is no longer visible, so it cannot
                    // be retired again.
                    unsafe { gc.limbo(node) };
                    outcome.retired += 1;
                } else {
                    rec.ptr.store(StressNode::boxed(), Ordering::Release);
                    rec.visible.store(true, Ordering::Release);
                }
                gc.cycle();
                outcome.writer_loops += 1;
            }
            // Retire whatever is still visible, then drain the collector.
            for rec in table.iter() {
                if rec.visible.load(Ordering::Relaxed) {
                    rec.visible.store(false, Ordering::Release);
                    let node = rec.ptr.load(Ordering::Relaxed);
                    // SAFETY: as above; each resident node is retired once.
                    unsafe { gc.limbo(node) };
                    outcome.retired += 1;
                }
            }
            gc.full(Duration::from_millis(1));
            outcome.reclaimed = reclaimed.load(Ordering::Relaxed);
            gc.unregister();
            outcome
        })
    };

    start.wait();
    thread::sleep(config.duration);
    stop.store(true, Ordering::Relaxed);

    collect(writer, readers)
}

// ---------------------------------------------------------------------------
// Worker collection
// ---------------------------------------------------------------------------

type ReaderHandle = thread::JoinHandle<(u64, u64)>;

fn collect(writer: thread::JoinHandle<StressOutcome>, readers: Vec<ReaderHandle>) -> StressOutcome {
    let mut outcome = writer.join().expect("writer thread");
    for reader in readers {
        let (loops, violations) = reader.join().expect("reader thread");
        outcome.reader_loops += loops;
        outcome.violations += violations;
    }
    outcome
}
