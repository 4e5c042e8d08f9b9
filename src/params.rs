//! Compile-time tunables.
//!
//! Everything here is a constant so the hot paths compile down to shifts and
//! masks. Sizes are adjusted through cargo features:
//!
//! ```toml
//! petek = { features = ["max-threads-512", "lock-table-4m"] }
//! ```

/// Maximum number of registered threads that can execute transactions.
#[cfg(feature = "max-threads-512")]
pub const MAX_THREADS: usize = 512;
/// Maximum number of registered threads that can execute transactions.
#[cfg(all(feature = "max-threads-128", not(feature = "max-threads-512")))]
pub const MAX_THREADS: usize = 128;
/// Maximum number of registered threads that can execute transactions.
/// Default: 256.
#[cfg(not(any(feature = "max-threads-128", feature = "max-threads-512")))]
pub const MAX_THREADS: usize = 256;

/// Number of write-locks. Must be a power of 2.
///
/// One lock covers a 32-byte region, so the default table spans 32 MiB of
/// distinct addresses before aliasing. `lock-table-4m` restores the larger
/// table used by workloads with very wide footprints.
#[cfg(feature = "lock-table-4m")]
pub const NUM_RWL: usize = 4 * 1024 * 1024;
/// Number of write-locks. Must be a power of 2.
#[cfg(not(feature = "lock-table-4m"))]
pub const NUM_RWL: usize = 1024 * 1024;

/// Number of write-locks sharing one read-indicator bit. Must be a power of
/// 2 and at least 1. Sharing trades memory for coarser (more conservative)
/// read-conflict detection.
#[cfg(feature = "ri-share-4")]
pub const RI_PER_RWL: usize = 4;
/// Number of write-locks sharing one read-indicator bit.
#[cfg(not(feature = "ri-share-4"))]
pub const RI_PER_RWL: usize = 1;

/// Number of read-indicators.
pub const NUM_RI: usize = NUM_RWL / RI_PER_RWL;

/// Number of 64-bit words backing the read-indicators, all threads together.
pub const NUM_RI_WORDS: usize = NUM_RI * MAX_THREADS / 64;

/// Words of the read-indicator array owned by one thread.
pub(crate) const RI_WORDS_PER_THREAD: usize = NUM_RI_WORDS / MAX_THREADS;

/// Write-lock state meaning "no owner". Any other value is the owner tid.
pub(crate) const UNLOCKED: u64 = (1 << 16) - 1;

/// Announced-timestamp value meaning "not contending".
pub(crate) const NO_TIMESTAMP: u64 = u64::MAX;

/// Sentinel tid meaning "no conflicting thread recorded".
pub(crate) const NO_TID: usize = MAX_THREADS;

/// Maximum number of allocations in one transaction.
pub const TX_MAX_ALLOCS: usize = 10 * 1024;

/// Maximum number of deallocations in one transaction.
pub const TX_MAX_RETIRES: usize = 10 * 1024;

/// Maximum number of read-locks acquired by one transaction.
pub const MAX_READ_SET_ENTRIES: usize = 64 * 1024;

/// Maximum number of stores logged by one transaction.
pub const MAX_WRITE_SET_ENTRIES: usize = 128 * 1024;

const _: () = {
    assert!(NUM_RWL.is_power_of_two());
    assert!(RI_PER_RWL.is_power_of_two());
    // Every thread's indicator region must be whole words.
    assert!(NUM_RI % 64 == 0);
    // Owner tids must never collide with the UNLOCKED sentinel.
    assert!(MAX_THREADS < UNLOCKED as usize);
};
