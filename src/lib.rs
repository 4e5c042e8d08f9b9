//! Petek: starvation-free software transactional memory.
//!
//! # Architecture
//!
//! Petek is a 2PL (two-phase locking) STM with a distributed reader-writer
//! lock and an undo log, using Wait-or-Die conflict resolution:
//!
//! - **Reads**: Pessimistic. A load arrives on the thread's read-indicator
//!   bit for the address's lock before checking for a writer.
//! - **Writes**: In place. A store takes the address's write-lock, logs the
//!   prior 64-bit value, and writes through; aborts restore the log in
//!   reverse.
//! - **Conflicts**: Resolved by a monotonic conflict clock. A transaction
//!   draws one timestamp at its first conflict and keeps it across restarts,
//!   so older transactions eventually outrank everyone: no transaction
//!   restarts more than the number of registered threads, and there is no
//!   commit-time validation at all.
//!
//! # Example
//!
//! ```
//! use petek::{update_tx, TxCell};
//!
//! let a = TxCell::new(10u64);
//! let b = TxCell::new(20u64);
//!
//! update_tx(|| {
//!     b.store(a.load());
//!     a.store(0);
//! });
//!
//! assert_eq!(a.load(), 0);
//! assert_eq!(b.load(), 10);
//! ```
//!
//! DANGER AHEAD: Don't run IO bound operations inside a transaction body. A
//! body may be re-executed any number of times before it commits, and only
//! stores made through [`TxCell`] are rolled back.
//!
//! Engines log cumulative commit/abort statistics when dropped. The
//! [`global`] engine is a `static` and is never dropped, so binaries that
//! want its shutdown report call [`report_shutdown_stats`] before exiting.

#![warn(missing_docs)]

mod alloc;
mod cell;
mod engine;
mod index;
mod opdata;
pub mod params;
mod registry;

pub use alloc::{tm_delete, tm_free, tm_malloc, tm_new};
pub use cell::TxCell;
pub use engine::{global, Stm, TxStats};
pub use registry::{max_threads, thread_id};

use engine::active;

/// Runs `f` as an update transaction on the [`global`] engine, retrying
/// until it commits, and returns its result. Called inside an open
/// transaction, `f` runs inline in that transaction.
pub fn update_tx<T, F: FnMut() -> T>(f: F) -> T {
    global().update_tx(f)
}

/// Runs `f` as a read transaction on the [`global`] engine. The distinction
/// is advisory; the body may still store.
pub fn read_tx<T, F: FnMut() -> T>(f: F) -> T {
    global().read_tx(f)
}

/// Opens a flat transaction on the [`global`] engine, for integration with
/// drivers that demand explicit begin/commit calls. See
/// [`Stm::begin_txn`].
pub fn begin_txn() {
    global().begin_txn()
}

/// Commits the flat transaction opened by [`begin_txn`].
pub fn end_txn() {
    global().end_txn()
}

/// Aborts the flat transaction, rolling back its stores unless
/// `enable_rollback` is false.
pub fn abort_txn(enable_rollback: bool) {
    global().abort_txn(enable_rollback)
}

/// Cumulative statistics of the [`global`] engine.
pub fn stats() -> TxStats {
    global().stats()
}

/// Logs the [`global`] engine's cumulative commit/abort statistics through
/// `tracing`, the report an engine normally emits when it is dropped.
///
/// The global engine lives in a `static`, which Rust never drops, so that
/// report cannot fire on its own at process exit; call this at the end of
/// `main` (or wherever the process tears down) to get it. Engines created
/// with [`Stm::new`] need no such call.
pub fn report_shutdown_stats() {
    global().report_stats()
}

/// Read-lock hint for externally managed memory: acquires a read-lock
/// covering `addr` in the calling thread's open transaction, returning
/// false when the transaction lost the conflict and should be aborted.
/// `len` is accepted but ignored; one lock covers the address. Outside a
/// transaction this trivially succeeds.
pub fn try_read_lock(addr: *const u8, _len: usize) -> bool {
    match active() {
        None => true,
        Some(tx) => unsafe { (*tx.engine).try_wait_read_lock(&mut *tx.op, addr as usize) },
    }
}

/// Write-lock hint for externally managed memory: acquires the write-lock
/// covering `addr` and logs the prior 64-bit value into the undo log.
/// `len` is accepted but ignored. Outside a transaction this trivially
/// succeeds.
///
/// # Safety
///
/// `addr` must be 8-byte aligned and point to a live 64-bit location that
/// stays valid until the transaction finishes; rollback writes the logged
/// value back through it.
pub unsafe fn try_write_lock(addr: *mut u8, _len: usize) -> bool {
    debug_assert!(addr as usize % 8 == 0, "write-lock hints need aligned words");
    match active() {
        None => true,
        Some(tx) => (*tx.engine).try_wait_write_lock(&mut *tx.op, addr as *mut u64),
    }
}
