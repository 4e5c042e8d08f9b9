//! The STM engine: two-phase locking over a distributed reader-writer lock
//! with an undo log, and Wait-or-Die conflict resolution.
//!
//! Each write-lock slot holds `UNLOCKED` or the owner tid. Read interest is a
//! bit per (thread, lock) in a bitmap partitioned so that every word has a
//! single writer thread. Conflicts are resolved by timestamp: a transaction
//! draws a timestamp from the conflict clock on its first conflict and keeps
//! it across restarts, so older transactions win every contest they stay in.
//! Aborts only happen on lock conflicts during the transaction; once a
//! transaction reaches commit there is no validation and no way to fail.

use crate::index::{addr_to_widx, ribit, ridx};
use crate::opdata::OpData;
use crate::params::{MAX_THREADS, NO_TID, NO_TIMESTAMP, NUM_RI_WORDS, NUM_RWL, UNLOCKED};
use crate::registry::{max_threads, thread_id};
use once_cell::race::OnceBox;
use std::cell::{Cell, UnsafeCell};
use std::hint::spin_loop;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};

/// Unwind payload used to leave an aborted transaction body. Raised with
/// `resume_unwind` so the panic hook stays silent; the run loop catches it
/// and re-enters the body.
pub(crate) struct RetryToken;

/// Cumulative engine statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxStats {
    /// Committed transactions.
    pub commits: u64,
    /// Aborted transaction attempts.
    pub aborts: u64,
    /// Highest attempt count any transaction needed to commit.
    pub max_restarts: u64,
}

/// One per-thread descriptor slot, aligned so neighboring threads' counters
/// never share a cache line. The descriptor itself is only touched by the
/// owning thread; the counters are atomics so statistics can be read from
/// anywhere at any time.
#[repr(align(128))]
struct OpSlot {
    data: UnsafeCell<OpData>,
    commits: AtomicU64,
    aborts: AtomicU64,
    max_restarts: AtomicU64,
}

impl OpSlot {
    fn new(tid: usize) -> Self {
        Self {
            data: UnsafeCell::new(OpData::new(tid)),
            commits: AtomicU64::new(0),
            aborts: AtomicU64::new(0),
            max_restarts: AtomicU64::new(0),
        }
    }
}

/// Announced-timestamp slot. Each thread publishes and clears only its own
/// slot, so every slot sits alone on a cache line: a publish never
/// invalidates the line a competitor is spinning on.
#[repr(align(128))]
struct TsSlot {
    ts: AtomicU64,
}

impl TsSlot {
    fn new() -> Self {
        Self {
            ts: AtomicU64::new(NO_TIMESTAMP),
        }
    }
}

/// The conflict clock, alone on its cache line: it is fetch-added by every
/// thread that hits a conflict and must not false-share with anything.
#[repr(align(128))]
struct ConflictClock {
    ticks: AtomicU64,
}

/// The transaction a thread currently has open, if any. Nested transactional
/// calls see this and run inline in the enclosing transaction.
#[derive(Clone, Copy)]
pub(crate) struct ActiveTx {
    pub(crate) engine: *const Stm,
    pub(crate) op: *mut OpData,
}

thread_local! {
    static ACTIVE: Cell<Option<ActiveTx>> = const { Cell::new(None) };
}

#[inline]
pub(crate) fn active() -> Option<ActiveTx> {
    ACTIVE.with(|a| a.get())
}

#[inline]
fn set_active(tx: Option<ActiveTx>) {
    ACTIVE.with(|a| a.set(tx));
}

/// The STM engine.
///
/// Holds the write-lock array, the read-indicator bitmap, the announced
/// timestamps, the conflict clock and one descriptor per registrable thread.
/// A process normally uses the [`global`] instance through the crate-level
/// free functions; independent instances exist for tests and embedders, with
/// the restriction that a given [`TxCell`](crate::TxCell) must only ever be
/// accessed under one engine.
pub struct Stm {
    /// Per-thread descriptors, indexed by registry tid.
    slots: Box<[OpSlot]>,
    /// Monotonic source of conflict timestamps. Starts at 1; `NO_TIMESTAMP`
    /// is unreachable within the lifetime of a process.
    conflict_clock: ConflictClock,
    /// Write-locks: `UNLOCKED` or the owner tid.
    wlocks: Box<[AtomicU64]>,
    /// Read-indicator bitmap, one single-writer word region per thread.
    read_indicators: Box<[AtomicU64]>,
    /// Announced timestamps, one padded slot per thread.
    txn_ts: Box<[TsSlot]>,
}

// The descriptor behind `slots[tid]` is only dereferenced by the thread
// registered as `tid`; everything else is atomics.
unsafe impl Send for Stm {}
unsafe impl Sync for Stm {}

static GLOBAL: OnceBox<Stm> = OnceBox::new();

/// The process-wide engine used by the crate-level convenience API.
#[inline]
pub fn global() -> &'static Stm {
    GLOBAL.get_or_init(|| Box::new(Stm::new()))
}

impl Default for Stm {
    fn default() -> Self {
        Self::new()
    }
}

impl Stm {
    /// Creates an engine with fresh lock tables and descriptors.
    pub fn new() -> Self {
        Self {
            slots: (0..MAX_THREADS).map(OpSlot::new).collect(),
            conflict_clock: ConflictClock {
                ticks: AtomicU64::new(1),
            },
            wlocks: (0..NUM_RWL).map(|_| AtomicU64::new(UNLOCKED)).collect(),
            read_indicators: (0..NUM_RI_WORDS).map(|_| AtomicU64::new(0)).collect(),
            txn_ts: (0..MAX_THREADS).map(|_| TsSlot::new()).collect(),
        }
    }

    /// Logs the cumulative commit/abort statistics through `tracing`.
    ///
    /// Dropping an engine does this automatically, but the [`global`]
    /// engine lives in a `static` and Rust never drops those; a binary that
    /// wants the shutdown report for the global engine calls
    /// [`report_shutdown_stats`](crate::report_shutdown_stats) itself.
    pub fn report_stats(&self) {
        let stats = self.stats();
        let restart_ratio = 100.0 * stats.aborts as f64 / (1 + stats.commits) as f64;
        tracing::info!(
            commits = stats.commits,
            aborts = stats.aborts,
            restart_ratio,
            "stm engine shutdown"
        );
    }

    /// Cumulative statistics over every thread that used this engine.
    pub fn stats(&self) -> TxStats {
        let mut stats = TxStats::default();
        for slot in self.slots.iter() {
            stats.commits += slot.commits.load(Ordering::Relaxed);
            stats.aborts += slot.aborts.load(Ordering::Relaxed);
            stats.max_restarts = stats
                .max_restarts
                .max(slot.max_restarts.load(Ordering::Relaxed));
        }
        stats
    }

    #[inline]
    fn op_ptr(&self, tid: usize) -> *mut OpData {
        self.slots[tid].data.get()
    }

    /// Runs `f` as an update transaction, retrying until it commits, and
    /// returns its result. Called inside an open transaction, `f` runs
    /// inline in that transaction instead.
    pub fn update_tx<T, F: FnMut() -> T>(&self, f: F) -> T {
        self.transaction(f)
    }

    /// Runs `f` as a read transaction. The distinction is advisory; reads
    /// still take read-locks and the body may store.
    pub fn read_tx<T, F: FnMut() -> T>(&self, f: F) -> T {
        self.transaction(f)
    }

    fn transaction<T, F: FnMut() -> T>(&self, mut f: F) -> T {
        if active().is_some() {
            // Flattened nesting: run in the enclosing transaction.
            return f();
        }
        let tid = thread_id();
        let op = self.op_ptr(tid);
        set_active(Some(ActiveTx { engine: self, op }));
        loop {
            unsafe { self.begin_tx(&mut *op) };
            match catch_unwind(AssertUnwindSafe(|| f())) {
                Ok(val) => {
                    unsafe { self.end_tx(&mut *op) };
                    return val;
                }
                Err(payload) => {
                    if payload.is::<RetryToken>() {
                        // Already aborted and rolled back; go again.
                        continue;
                    }
                    // A panic from user code: roll back, release, close the
                    // transaction for good, then re-surface it.
                    unsafe {
                        self.abort_tx(&mut *op, true);
                        self.close_descriptor(&mut *op);
                    }
                    set_active(None);
                    resume_unwind(payload);
                }
            }
        }
    }

    /// Opens a transaction in the flat, explicit form. The caller drives the
    /// transaction with cell accesses or the lock hints and finishes with
    /// [`end_txn`](Stm::end_txn) or [`abort_txn`](Stm::abort_txn). Flat
    /// transactions do not nest.
    pub fn begin_txn(&'static self) {
        let tid = thread_id();
        let op = self.op_ptr(tid);
        set_active(Some(ActiveTx { engine: self, op }));
        unsafe { self.begin_tx(&mut *op) };
    }

    /// Commits the flat transaction opened by [`begin_txn`](Stm::begin_txn).
    pub fn end_txn(&self) {
        // Commit through the engine recorded at begin; a thread has at most
        // one open transaction and it belongs to exactly one engine.
        let tx = active().expect("petek: end_txn with no open transaction");
        unsafe { (*tx.engine).end_tx(&mut *tx.op) };
    }

    /// Aborts the flat transaction, undoing its stores unless
    /// `enable_rollback` is false, and releasing every lock it holds. The
    /// caller decides whether to retry with a fresh `begin_txn`.
    pub fn abort_txn(&self, enable_rollback: bool) {
        let tx = active().expect("petek: abort_txn with no open transaction");
        unsafe { (*tx.engine).abort_tx(&mut *tx.op, enable_rollback) };
        set_active(None);
    }

    fn begin_tx(&self, op: &mut OpData) {
        // Clear the logs of the previous attempt.
        op.alog.clear();
        op.flog.clear();
        op.write_set.reset();
        op.read_set.reset();
        if op.attempt > 0 {
            self.wait_for_conflicting_txn(op);
        }
        op.attempt += 1;
    }

    /// Once we get here there is no longer any possibility of aborting.
    fn end_tx(&self, op: &mut OpData) {
        let tid = op.tid;
        for entry in op.write_set.iter() {
            self.unlock_write(entry.addr as usize, tid);
        }
        self.unlock_all_read_locks(op, tid);
        // Execute the de-allocations retired during the transaction.
        for del in op.flog.drain(..) {
            unsafe { (del.reclaim)(del.obj) };
        }
        op.alog.clear();
        let slot = &self.slots[tid];
        slot.commits.fetch_add(1, Ordering::Relaxed);
        slot.max_restarts.fetch_max(op.attempt, Ordering::Relaxed);
        self.close_descriptor(op);
        set_active(None);
    }

    pub(crate) fn abort_tx(&self, op: &mut OpData, enable_rollback: bool) {
        // Undo the modifications, newest first.
        if enable_rollback {
            op.write_set.rollback();
        }
        let tid = op.tid;
        for entry in op.write_set.iter() {
            self.unlock_write(entry.addr as usize, tid);
        }
        self.unlock_all_read_locks(op, tid);
        // Undo allocations.
        for del in op.alog.drain(..) {
            unsafe { (del.reclaim)(del.obj) };
        }
        op.flog.clear();
        self.slots[tid].aborts.fetch_add(1, Ordering::Relaxed);
    }

    /// Aborts the current attempt and unwinds back to the run loop.
    pub(crate) fn die(&self, op: &mut OpData) -> ! {
        self.abort_tx(op, true);
        resume_unwind(Box::new(RetryToken))
    }

    /// Resets the descriptor once a transaction is over for good.
    fn close_descriptor(&self, op: &mut OpData) {
        op.attempt = 0;
        self.txn_ts[op.tid].ts.store(NO_TIMESTAMP, Ordering::Release);
        op.my_ts = NO_TIMESTAMP;
        op.o_ts = NO_TIMESTAMP;
        op.otid = NO_TID;
    }

    /// Spins until the transaction we lost against has either committed or
    /// moved on to a different timestamp.
    fn wait_for_conflicting_txn(&self, op: &OpData) {
        if op.otid == NO_TID || op.o_ts == NO_TIMESTAMP || op.o_ts >= op.my_ts {
            // No (valid) conflict on record, e.g. an externally requested
            // abort through the flat API.
            return;
        }
        let mut iter: u64 = 0;
        while self.txn_ts[op.otid].ts.load(Ordering::Relaxed) == op.o_ts {
            if iter == 100_000_000 {
                tracing::warn!(
                    tid = op.tid,
                    my_ts = op.my_ts,
                    otid = op.otid,
                    o_ts = op.o_ts,
                    "100M spins waiting on a conflicting transaction"
                );
            }
            spin_loop();
            iter += 1;
        }
    }

    /// Acquires (or confirms) a read-lock covering `addr`.
    pub(crate) fn try_wait_read_lock(&self, op: &mut OpData, addr: usize) -> bool {
        let widx = addr_to_widx(addr);
        let ridx = ridx(widx, op.tid);
        // Single-writer word: no other thread mutates it, a plain load is
        // always current.
        let ri = self.read_indicators[ridx].load(Ordering::Relaxed);
        let newri = ri | ribit(widx);
        // If we already arrived, we hold the read-lock.
        if newri == ri {
            return true;
        }
        op.read_set.push(widx);
        // SeqCst keeps the arrival ordered before the write-lock check, so a
        // writer's emptiness scan and our check cannot both miss.
        self.read_indicators[ridx].swap(newri, Ordering::SeqCst);
        let wstate = self.wlocks[widx].load(Ordering::SeqCst);
        if wstate == UNLOCKED || wstate == op.tid as u64 {
            return true;
        }
        // A writer holds this lock.
        self.read_lock_slow(op, widx, ridx, newri)
    }

    /// Acquires (or confirms) the write-lock covering `addr`, logging the
    /// prior value into the undo log on success.
    ///
    /// # Safety
    ///
    /// `addr` must point to a valid, 8-byte-aligned, live 64-bit location.
    pub(crate) unsafe fn try_wait_write_lock(&self, op: &mut OpData, addr: *mut u64) -> bool {
        let widx = addr_to_widx(addr as usize);
        let wstate = self.wlocks[widx].load(Ordering::Acquire);
        if wstate == op.tid as u64 {
            op.write_set.record(addr);
            return true;
        }
        if wstate == UNLOCKED
            && self.wlocks[widx]
                .compare_exchange(UNLOCKED, op.tid as u64, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            && self.is_empty(widx, op.tid)
        {
            op.write_set.record(addr);
            return true;
        }
        // CAS lost, or a reader is still arrived; possibly holding the lock
        // already. Sort it out on the slow path.
        if self.write_lock_slow(op, widx) {
            op.write_set.record(addr);
            return true;
        }
        false
    }

    /// Wait-or-Die for readers: wait while the writer is younger, die when it
    /// is older.
    #[cold]
    fn read_lock_slow(&self, op: &mut OpData, widx: usize, ridx: usize, ri: u64) -> bool {
        self.announce(op);
        loop {
            if self.wlocks[widx].load(Ordering::Acquire) == UNLOCKED {
                self.txn_ts[op.tid].ts.store(NO_TIMESTAMP, Ordering::Release);
                return true;
            }
            let (o_ts, otid) = self.writer_ts(widx, op.tid);
            op.o_ts = o_ts;
            op.otid = otid;
            if op.o_ts < op.my_ts {
                // The writer has priority: depart from the read-indicator
                // and die.
                self.read_indicators[ridx].store(ri & !ribit(widx), Ordering::Release);
                return false;
            }
            spin_loop();
        }
    }

    /// Wait-or-Die for writers: announce intent on the read-indicator, then
    /// wait while every contender is younger, die when any is older.
    #[cold]
    fn write_lock_slow(&self, op: &mut OpData, widx: usize) -> bool {
        self.announce(op);
        // Arrive on the read-indicator to signal that we want this lock,
        // unless we are there already from a read-lock.
        let ridx = ridx(widx, op.tid);
        let ri = self.read_indicators[ridx].load(Ordering::Relaxed);
        self.read_indicators[ridx].swap(ri | ribit(widx), Ordering::SeqCst);
        loop {
            let wstate = self.wlocks[widx].load(Ordering::Acquire);
            if wstate == UNLOCKED {
                let _ = self.wlocks[widx].compare_exchange(
                    UNLOCKED,
                    op.tid as u64,
                    Ordering::SeqCst,
                    Ordering::Relaxed,
                );
            }
            let wstate = self.wlocks[widx].load(Ordering::SeqCst);
            if wstate == op.tid as u64 && self.is_empty(widx, op.tid) {
                // The write-lock now covers any read-lock we held here.
                self.read_indicators[ridx].store(ri & !ribit(widx), Ordering::Release);
                self.txn_ts[op.tid].ts.store(NO_TIMESTAMP, Ordering::Release);
                return true;
            }
            let (o_ts, otid) = self.lowest_ts(widx, op.tid);
            op.o_ts = o_ts;
            op.otid = otid;
            if op.o_ts < op.my_ts {
                // An announced reader or writer has priority: depart, drop
                // the lock if we were the one holding it, and die.
                self.read_indicators[ridx].store(ri & !ribit(widx), Ordering::Release);
                if self.wlocks[widx].load(Ordering::Relaxed) == op.tid as u64 {
                    self.wlocks[widx].store(UNLOCKED, Ordering::Release);
                }
                return false;
            }
            spin_loop();
        }
    }

    /// Draws the transaction's conflict timestamp if it has none, and
    /// re-publishes it if the announcement slot was cleared.
    fn announce(&self, op: &mut OpData) {
        if op.my_ts == NO_TIMESTAMP {
            op.my_ts = self.conflict_clock.ticks.fetch_add(1, Ordering::SeqCst);
            debug_assert_ne!(op.my_ts, NO_TIMESTAMP, "conflict clock overflow");
        }
        if self.txn_ts[op.tid].ts.load(Ordering::Relaxed) == NO_TIMESTAMP {
            self.txn_ts[op.tid].ts.swap(op.my_ts, Ordering::SeqCst);
        }
    }

    /// Timestamp and tid of the thread write-locking `widx`, or
    /// `(NO_TIMESTAMP, NO_TID)` when it is free, ours, or unannounced.
    fn writer_ts(&self, widx: usize, tid: usize) -> (u64, usize) {
        let wstate = self.wlocks[widx].load(Ordering::Acquire);
        if wstate != UNLOCKED && wstate != tid as u64 {
            let otid = wstate as usize;
            let o_ts = self.txn_ts[otid].ts.load(Ordering::Relaxed);
            if o_ts != NO_TIMESTAMP {
                return (o_ts, otid);
            }
        }
        (NO_TIMESTAMP, NO_TID)
    }

    /// Lowest announced timestamp among the writer and every arrived reader
    /// or waiting writer of `widx`, skipping ourselves. Slow(ish) is fine;
    /// this only runs on the slow path.
    fn lowest_ts(&self, widx: usize, tid: usize) -> (u64, usize) {
        let (mut low_ts, mut low_tid) = self.writer_ts(widx, tid);
        let rmask = ribit(widx);
        for itid in 0..MAX_THREADS {
            if itid == tid {
                continue;
            }
            let ri = self.read_indicators[ridx(widx, itid)].load(Ordering::Acquire);
            if ri & rmask == 0 {
                continue;
            }
            let o_ts = self.txn_ts[itid].ts.load(Ordering::Relaxed);
            if o_ts < low_ts {
                low_ts = o_ts;
                low_tid = itid;
            }
        }
        (low_ts, low_tid)
    }

    /// True when no other thread is arrived on the read-indicator of `widx`.
    fn is_empty(&self, widx: usize, tid: usize) -> bool {
        let mask = ribit(widx);
        for itid in 0..max_threads() {
            let ri = self.read_indicators[ridx(widx, itid)].load(Ordering::SeqCst);
            if ri & mask == mask && itid != tid {
                return false;
            }
        }
        true
    }

    fn unlock_write(&self, addr: usize, tid: usize) {
        let widx = addr_to_widx(addr);
        let wstate = self.wlocks[widx].load(Ordering::Relaxed);
        // Entries of the write-set can share a widx; only the first release
        // finds us as the owner.
        if wstate == tid as u64 {
            self.wlocks[widx].store(UNLOCKED, Ordering::Release);
        }
    }

    fn unlock_read(&self, widx: usize, tid: usize) {
        let ridx = ridx(widx, tid);
        let ri = self.read_indicators[ridx].load(Ordering::Relaxed);
        let rmask = ribit(widx);
        if ri & rmask == 0 {
            return;
        }
        self.read_indicators[ridx].store(ri & !rmask, Ordering::Release);
    }

    fn unlock_all_read_locks(&self, op: &OpData, tid: usize) {
        for widx in op.read_set.iter() {
            self.unlock_read(widx, tid);
        }
    }
}

impl Drop for Stm {
    fn drop(&mut self) {
        self.report_stats();
    }
}
