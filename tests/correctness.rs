use petek::{abort_txn, begin_txn, end_txn, read_tx, update_tx, Stm, TxCell};
use std::sync::Arc;
use std::thread;

#[test]
fn test_read_then_write_commits() {
    let a = TxCell::new(10u64);
    let b = TxCell::new(20u64);

    update_tx(|| {
        b.store(a.load());
        a.store(0);
    });

    assert_eq!(a.load(), 0);
    assert_eq!(b.load(), 10);
}

#[test]
fn test_read_then_write_aborted_mid_transaction() {
    let a = TxCell::new(10u64);
    let b = TxCell::new(20u64);

    begin_txn();
    b.store(a.load());
    a.store(0);
    // Inside the transaction the new values are visible.
    assert_eq!(a.load(), 0);
    assert_eq!(b.load(), 10);
    abort_txn(true);

    // The undo log restored both words.
    assert_eq!(a.load(), 10);
    assert_eq!(b.load(), 20);
}

#[test]
fn test_flat_transaction_commits() {
    let a = TxCell::new(1u64);
    begin_txn();
    a.store(a.load() + 1);
    end_txn();
    assert_eq!(a.load(), 2);
}

#[test]
fn test_transaction_return_value() {
    let cell = TxCell::new(10i64);

    let result = update_tx(|| {
        let v = cell.load();
        cell.store(v * 2);
        v
    });

    assert_eq!(result, 10);
    assert_eq!(cell.load(), 20);
}

#[test]
fn test_round_trip_through_commit() {
    let cell = TxCell::new(0u64);
    update_tx(|| cell.store(123));
    assert_eq!(read_tx(|| cell.load()), 123);
}

#[test]
fn test_nested_transactions_flatten() {
    let a = TxCell::new(0u64);
    let b = TxCell::new(0u64);

    update_tx(|| {
        a.store(1);
        // The inner call joins this transaction instead of committing on
        // its own; its stores roll back with ours and commit with ours.
        update_tx(|| b.store(a.load() + 1));
        a.store(3);
    });

    assert_eq!(a.load(), 3);
    assert_eq!(b.load(), 2);
}

#[test]
fn test_lock_hints_cover_external_words() {
    let mut word: u64 = 5;
    let addr = &mut word as *mut u64;

    begin_txn();
    assert!(petek::try_read_lock(addr as *const u8, 8));
    assert!(unsafe { petek::try_write_lock(addr as *mut u8, 8) });
    unsafe { *addr = 9 };
    abort_txn(true);

    // Rollback wrote the logged value back through the hint address.
    assert_eq!(word, 5);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_restart_bound_under_contention() {
    let stm = Arc::new(Stm::new());
    let cell = Arc::new(TxCell::new(0u64));
    let iterations = 5_000u64;

    let mut handles = vec![];
    for _ in 0..2 {
        let stm = stm.clone();
        let cell = cell.clone();
        handles.push(thread::spawn(move || {
            for _ in 0..iterations {
                stm.update_tx(|| cell.store(cell.load() + 1));
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(cell.load(), 2 * iterations);
    let stats = stm.stats();
    assert_eq!(stats.commits, 2 * iterations);
    // Wait-or-Die with stable timestamps: no transaction needs more
    // attempts than there are registrable threads.
    assert!(
        stats.max_restarts <= petek::params::MAX_THREADS as u64,
        "max_restarts = {}",
        stats.max_restarts
    );
}
