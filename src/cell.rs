//! The transactional scalar wrapper.

use crate::engine::active;
use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};

/// A 64-bit-wide transactional memory cell.
///
/// Outside a transaction, [`load`](TxCell::load) and [`store`](TxCell::store)
/// are plain accesses to the cell. Inside a transaction they interpose: a
/// load acquires a read-lock covering the cell's address, a store acquires
/// the write-lock and logs the prior value into the undo log, and either one
/// aborts the transaction on a lost conflict (the body is then re-run by the
/// engine, so code inside a transaction never observes the failure).
///
/// `T` must be `Copy` and at most 64 bits wide; wider values have to be
/// split across cells. Pointer cells are legal:
///
/// ```
/// use petek::TxCell;
///
/// let head: TxCell<*mut u64> = TxCell::new(std::ptr::null_mut());
/// assert!(head.load().is_null());
/// ```
#[repr(transparent)]
pub struct TxCell<T> {
    raw: AtomicU64,
    _marker: PhantomData<T>,
}

// The cell hands out copies of T by value, never references into itself.
unsafe impl<T: Copy + Send> Send for TxCell<T> {}
unsafe impl<T: Copy + Send> Sync for TxCell<T> {}

impl<T: Copy> TxCell<T> {
    const FITS_IN_WORD: () = assert!(
        mem::size_of::<T>() <= mem::size_of::<u64>(),
        "TxCell values must be 64 bits or smaller"
    );

    #[inline]
    fn pack(val: T) -> u64 {
        let () = Self::FITS_IN_WORD;
        let mut word = 0u64;
        // Write T into the low-address bytes of the word; unpack reads the
        // same bytes back, so the round-trip is endian-agnostic.
        unsafe {
            std::ptr::copy_nonoverlapping(
                &val as *const T as *const u8,
                &mut word as *mut u64 as *mut u8,
                mem::size_of::<T>(),
            );
        }
        word
    }

    #[inline]
    fn unpack(word: u64) -> T {
        unsafe { mem::transmute_copy(&word) }
    }

    /// Creates a cell holding `val`. Outside transactions only in the sense
    /// that no locking happens; the cell becomes transactional as soon as it
    /// is reachable from one.
    #[inline]
    pub fn new(val: T) -> Self {
        Self {
            raw: AtomicU64::new(Self::pack(val)),
            _marker: PhantomData,
        }
    }

    /// Reads the cell, taking a read-lock when called inside a transaction.
    #[inline]
    pub fn load(&self) -> T {
        if let Some(tx) = active() {
            let engine = unsafe { &*tx.engine };
            let op = unsafe { &mut *tx.op };
            if !engine.try_wait_read_lock(op, self.raw.as_ptr() as usize) {
                engine.die(op);
            }
        }
        Self::unpack(self.raw.load(Ordering::Relaxed))
    }

    /// Writes the cell, taking the write-lock and logging the prior value
    /// when called inside a transaction.
    #[inline]
    pub fn store(&self, val: T) {
        if let Some(tx) = active() {
            let engine = unsafe { &*tx.engine };
            let op = unsafe { &mut *tx.op };
            if !unsafe { engine.try_wait_write_lock(op, self.raw.as_ptr()) } {
                engine.die(op);
            }
        }
        self.raw.store(Self::pack(val), Ordering::Relaxed);
    }

    /// Stores `val` and returns the previous value.
    #[inline]
    pub fn replace(&self, val: T) -> T {
        let old = self.load();
        self.store(val);
        old
    }

    /// Applies `f` to the current value and stores the result.
    #[inline]
    pub fn update<F: FnOnce(T) -> T>(&self, f: F) {
        self.store(f(self.load()));
    }
}

impl<T: Copy + std::ops::Add<Output = T>> TxCell<T> {
    /// Adds `rhs` to the cell and returns the previous value.
    #[inline]
    pub fn fetch_add(&self, rhs: T) -> T {
        let old = self.load();
        self.store(old + rhs);
        old
    }
}

impl<T: Copy + std::ops::Sub<Output = T>> TxCell<T> {
    /// Subtracts `rhs` from the cell and returns the previous value.
    #[inline]
    pub fn fetch_sub(&self, rhs: T) -> T {
        let old = self.load();
        self.store(old - rhs);
        old
    }
}

impl<T: Copy + Default> Default for TxCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: Copy> From<T> for TxCell<T> {
    fn from(val: T) -> Self {
        Self::new(val)
    }
}

impl<T: Copy> Clone for TxCell<T> {
    fn clone(&self) -> Self {
        Self::new(self.load())
    }
}

// Comparisons are load-then-compare against plain values; no transactional
// read is inferred on the right-hand side.
impl<T: Copy + PartialEq> PartialEq<T> for TxCell<T> {
    fn eq(&self, other: &T) -> bool {
        self.load() == *other
    }
}

impl<T: Copy + PartialOrd> PartialOrd<T> for TxCell<T> {
    fn partial_cmp(&self, other: &T) -> Option<std::cmp::Ordering> {
        self.load().partial_cmp(other)
    }
}

impl<T: Copy + fmt::Debug> fmt::Debug for TxCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TxCell").field(&self.load()).finish()
    }
}
