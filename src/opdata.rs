//! Per-thread transaction state: read-set, undo log, allocation logs and the
//! descriptor gluing them together.

use crate::params::{
    MAX_READ_SET_ENTRIES, MAX_WRITE_SET_ENTRIES, NO_TID, NO_TIMESTAMP, TX_MAX_ALLOCS,
    TX_MAX_RETIRES,
};
use std::sync::atomic::{AtomicU64, Ordering};

/// The set of read-locks acquired by the current transaction, as write-lock
/// indices. Entries are only appended when the indicator bit was not already
/// set, so the set stays duplicate-free per indicator bit.
pub(crate) struct ReadSet {
    entries: Vec<u32>,
}

impl ReadSet {
    fn new() -> Self {
        Self {
            entries: Vec::with_capacity(256),
        }
    }

    #[inline]
    pub(crate) fn reset(&mut self) {
        self.entries.clear();
    }

    #[inline]
    pub(crate) fn push(&mut self, widx: usize) {
        // If you see this panic, raise MAX_READ_SET_ENTRIES.
        assert!(
            self.entries.len() != MAX_READ_SET_ENTRIES,
            "petek: read-set overflow ({MAX_READ_SET_ENTRIES} entries)"
        );
        self.entries.push(widx as u32);
    }

    #[inline]
    pub(crate) fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.entries.iter().map(|&w| w as usize)
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Undo log of the words modified during the transaction.
pub(crate) struct WriteSet {
    entries: Vec<WriteSetEntry>,
}

pub(crate) struct WriteSetEntry {
    pub(crate) addr: *mut u64,
    /// Value held before the transaction's store.
    old: u64,
}

impl WriteSet {
    fn new() -> Self {
        Self {
            entries: Vec::with_capacity(256),
        }
    }

    #[inline]
    pub(crate) fn reset(&mut self) {
        self.entries.clear();
    }

    /// Logs the word at `addr` before it is overwritten.
    ///
    /// # Safety
    ///
    /// `addr` must point to a valid, 8-byte-aligned, live 64-bit location.
    #[inline]
    pub(crate) unsafe fn record(&mut self, addr: *mut u64) {
        // If you see this panic, raise MAX_WRITE_SET_ENTRIES.
        assert!(
            self.entries.len() != MAX_WRITE_SET_ENTRIES,
            "petek: write-set overflow ({MAX_WRITE_SET_ENTRIES} entries)"
        );
        let old = AtomicU64::from_ptr(addr).load(Ordering::Relaxed);
        self.entries.push(WriteSetEntry { addr, old });
    }

    /// Restores every logged word, newest first. LIFO order unwinds repeated
    /// stores to the same word back to its pre-transaction value.
    #[inline]
    pub(crate) fn rollback(&self) {
        for entry in self.entries.iter().rev() {
            unsafe { AtomicU64::from_ptr(entry.addr).store(entry.old, Ordering::Relaxed) };
        }
    }

    #[inline]
    pub(crate) fn iter(&self) -> impl Iterator<Item = &WriteSetEntry> {
        self.entries.iter()
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// A pointer plus a type-erased reclaim trampoline (drop + free).
pub(crate) struct Deletable {
    pub(crate) obj: *mut u8,
    pub(crate) reclaim: unsafe fn(*mut u8),
}

/// Holds one thread's transactional state. Only the owning thread touches a
/// descriptor while its transaction runs; commit/abort counters live outside
/// (see `OpSlot`) so statistics stay readable from any thread.
pub(crate) struct OpData {
    pub(crate) tid: usize,
    /// Restart count of the current transaction, reset on commit.
    pub(crate) attempt: u64,
    /// Conflict timestamp, drawn lazily on first conflict and kept across
    /// restarts until commit. Stability across aborts is what bounds the
    /// number of restarts.
    pub(crate) my_ts: u64,
    /// Lowest competing timestamp observed when this transaction last died,
    /// and its owner. `begin` waits on this pair before retrying.
    pub(crate) o_ts: u64,
    pub(crate) otid: usize,
    pub(crate) write_set: WriteSet,
    pub(crate) read_set: ReadSet,
    /// Objects allocated during the transaction; reclaimed on abort.
    pub(crate) alog: Vec<Deletable>,
    /// Objects retired during the transaction; reclaimed on commit.
    pub(crate) flog: Vec<Deletable>,
}

impl OpData {
    pub(crate) fn new(tid: usize) -> Self {
        Self {
            tid,
            attempt: 0,
            my_ts: NO_TIMESTAMP,
            o_ts: NO_TIMESTAMP,
            otid: NO_TID,
            write_set: WriteSet::new(),
            read_set: ReadSet::new(),
            alog: Vec::with_capacity(32),
            flog: Vec::with_capacity(32),
        }
    }

    #[inline]
    pub(crate) fn push_alloc(&mut self, obj: *mut u8, reclaim: unsafe fn(*mut u8)) {
        // If you see this panic, raise TX_MAX_ALLOCS.
        assert!(
            self.alog.len() != TX_MAX_ALLOCS,
            "petek: allocation log overflow ({TX_MAX_ALLOCS} entries)"
        );
        self.alog.push(Deletable { obj, reclaim });
    }

    #[inline]
    pub(crate) fn push_retire(&mut self, obj: *mut u8, reclaim: unsafe fn(*mut u8)) {
        // If you see this panic, raise TX_MAX_RETIRES.
        assert!(
            self.flog.len() != TX_MAX_RETIRES,
            "petek: retire log overflow ({TX_MAX_RETIRES} entries)"
        );
        self.flog.push(Deletable { obj, reclaim });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rollback_is_lifo() {
        let mut word: u64 = 7;
        let addr = &mut word as *mut u64;
        let mut ws = WriteSet::new();
        unsafe {
            ws.record(addr); // logs 7
            word = 11;
            ws.record(addr); // logs 11
            word = 13;
        }
        ws.rollback();
        // Newest-first restore must land on the pre-transaction value.
        assert_eq!(word, 7);
    }

    #[test]
    fn test_read_set_reset() {
        let mut rs = ReadSet::new();
        rs.push(3);
        rs.push(90);
        assert_eq!(rs.iter().collect::<Vec<_>>(), vec![3, 90]);
        rs.reset();
        assert_eq!(rs.len(), 0);
    }
}
