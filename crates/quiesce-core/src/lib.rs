//! # quiesce-core
//!
//! Safe memory reclamation primitives for lock-free and read-mostly data
//! structures.
//!
//! Concurrent readers traversing a shared structure cannot simply free nodes
//! that have been logically unlinked: a reader may still hold a reference to
//! such a node. This crate provides the coordination needed to decide when
//! deferred frees become safe.
//!
//! Three mechanisms are provided:
//!
//! - [`Ebr`]: epoch-based reclamation. Readers wrap their accesses in short
//!   critical sections ([`Ebr::enter`] / [`Ebr::exit`]); writers drive a
//!   three-valued global epoch and learn when no reader can still observe an
//!   old epoch.
//! - [`Qsbr`]: quiescent-state-based reclamation. Readers never mark
//!   critical sections; instead they periodically declare a quiescent state
//!   ([`Qsbr::checkpoint`]) at points where they hold no shared references.
//!   Writers take a generation snapshot ([`Qsbr::barrier`]) and wait until
//!   every registered worker has passed it.
//! - [`Gc`]: a deferred-reclamation engine built on EBR. Callers hand it
//!   retired objects ([`Gc::limbo`]); it batches them into per-epoch bins and
//!   invokes a reclaim callback exactly when the epoch model guarantees no
//!   worker can still reference them.
//!
//! None of these track per-object references; they provide *epoch*
//! guarantees, not hazard pointers. Reclamation latency is unbounded: a
//! reader that never leaves its critical section (EBR) or a worker that
//! never declares quiescence (QSBR) stalls reclamation indefinitely.

#![deny(unsafe_code)]

mod backoff;
mod registry;

pub mod ebr;
pub mod gc;
pub mod qsbr;

pub use ebr::{Ebr, EPOCHS, SyncStatus};
pub use gc::{Drained, Entry, Gc};
pub use qsbr::{Generation, Qsbr};

use thiserror::Error;

/// Errors surfaced by worker registration.
///
/// Registration is the only fallible operation; the reclamation paths
/// themselves never fail at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// The reclaimer already tracks the maximum number of workers.
    /// No state was mutated.
    #[error("worker registry is full")]
    RegistryFull,
}
