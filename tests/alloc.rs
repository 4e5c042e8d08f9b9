use petek::{abort_txn, begin_txn, end_txn, tm_delete, tm_free, tm_malloc, tm_new, update_tx};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Heap object whose drop is observable through a counter.
struct Tracked {
    value: u64,
    drops: &'static AtomicUsize,
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

fn counter() -> &'static AtomicUsize {
    Box::leak(Box::new(AtomicUsize::new(0)))
}

#[test]
fn test_aborted_allocations_are_reclaimed() {
    let drops = counter();

    begin_txn();
    let mut objs = Vec::new();
    for i in 0..1000 {
        objs.push(tm_new(Tracked { value: i, drops }));
    }
    assert_eq!(drops.load(Ordering::SeqCst), 0);
    abort_txn(true);

    // Every allocation of the aborted transaction was dropped and freed.
    assert_eq!(drops.load(Ordering::SeqCst), 1000);
}

#[test]
fn test_committed_allocations_survive() {
    let drops = counter();

    let ptr = update_tx(|| tm_new(Tracked { value: 7, drops }));
    assert_eq!(drops.load(Ordering::SeqCst), 0);
    unsafe {
        assert_eq!((*ptr).value, 7);
        tm_delete(ptr);
    }
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test]
fn test_committed_retire_frees_exactly_once() {
    let drops = counter();
    let ptr = tm_new(Tracked { value: 1, drops });

    update_tx(|| unsafe { tm_delete(ptr) });

    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test]
fn test_aborted_retire_leaves_object_alive() {
    let drops = counter();
    let ptr = tm_new(Tracked { value: 42, drops });

    begin_txn();
    unsafe { tm_delete(ptr) };
    abort_txn(true);

    // The retirement was discarded wholesale: no drop ran and the object is
    // still usable by the next attempt.
    assert_eq!(drops.load(Ordering::SeqCst), 0);
    unsafe {
        assert_eq!((*ptr).value, 42);
        tm_delete(ptr);
    }
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test]
fn test_retire_inside_transaction_defers_to_commit() {
    let drops = counter();
    let ptr = tm_new(Tracked { value: 3, drops });

    update_tx(|| {
        unsafe { tm_delete(ptr) };
        // Not yet: the free runs at commit, after locks are released.
        assert_eq!(drops.load(Ordering::SeqCst), 0);
    });

    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test]
fn test_raw_buffers_follow_the_same_discipline() {
    // Abort reclaims the transaction's buffers.
    begin_txn();
    let buf = tm_malloc(128);
    assert!(!buf.is_null());
    unsafe { buf.write(0xAB) };
    abort_txn(true);

    // Commit keeps them; a later retire frees them.
    let buf = update_tx(|| tm_malloc(64));
    assert!(!buf.is_null());
    unsafe {
        for i in 0..64 {
            assert_eq!(*buf.add(i), 0, "tm_malloc must zero-fill");
        }
    }
    begin_txn();
    unsafe { tm_free(buf) };
    end_txn();
}

#[test]
fn test_alloc_then_retire_in_one_transaction() {
    let drops = counter();

    update_tx(|| {
        let ptr = tm_new(Tracked { value: 9, drops });
        unsafe { tm_delete(ptr) };
    });

    // Allocated and retired in the same committed transaction: dropped once.
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}
