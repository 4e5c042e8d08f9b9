//! The transactional allocator.
//!
//! Inside a transaction, `new`/`delete` cannot be used directly: a restart
//! would leak the allocations and other re-executions may still be reading
//! retired objects. Allocations are therefore logged and reclaimed on abort;
//! retirements are logged and executed on commit. An aborted transaction
//! discards its retirements entirely, so the retired objects stay fully
//! intact for the next execution of the body.
//!
//! Outside a transaction every function degrades to the plain allocator.

use crate::engine::active;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr;

/// Header prefix of raw buffers, holding the payload size so deferred frees
/// can reconstruct the layout. Keeps payloads 16-byte aligned.
const HEADER: usize = 16;

unsafe fn reclaim_box<T>(obj: *mut u8) {
    drop(Box::from_raw(obj as *mut T));
}

unsafe fn reclaim_raw(ptr: *mut u8) {
    let base = ptr.sub(HEADER);
    let size = (base as *const usize).read();
    dealloc(base, Layout::from_size_align_unchecked(size + HEADER, HEADER));
}

/// Heap-allocates `val` under transactional control.
///
/// If the enclosing transaction aborts, the object is dropped and freed; if
/// it commits (or there is none), the object lives until [`tm_delete`].
pub fn tm_new<T>(val: T) -> *mut T {
    let ptr = Box::into_raw(Box::new(val));
    if let Some(tx) = active() {
        let op = unsafe { &mut *tx.op };
        op.push_alloc(ptr as *mut u8, reclaim_box::<T>);
    }
    ptr
}

/// Retires an object created by [`tm_new`].
///
/// Inside a transaction, both the drop and the free are deferred to commit;
/// an abort discards the retirement and leaves the object untouched. Outside
/// a transaction the object is dropped and freed immediately.
///
/// # Safety
///
/// `obj` must come from [`tm_new`] and must not be retired twice or used
/// after the retiring transaction commits.
pub unsafe fn tm_delete<T>(obj: *mut T) {
    if obj.is_null() {
        return;
    }
    match active() {
        None => drop(Box::from_raw(obj)),
        Some(tx) => {
            let op = &mut *tx.op;
            op.push_retire(obj as *mut u8, reclaim_box::<T>);
        }
    }
}

/// Allocates `size` zero-filled bytes under transactional control.
///
/// Returns null when the allocator fails; callers must check.
pub fn tm_malloc(size: usize) -> *mut u8 {
    let Ok(layout) = Layout::from_size_align(size + HEADER, HEADER) else {
        return ptr::null_mut();
    };
    let base = unsafe { alloc_zeroed(layout) };
    if base.is_null() {
        return ptr::null_mut();
    }
    unsafe { (base as *mut usize).write(size) };
    let buf = unsafe { base.add(HEADER) };
    if let Some(tx) = active() {
        let op = unsafe { &mut *tx.op };
        op.push_alloc(buf, reclaim_raw);
    }
    buf
}

/// Retires a buffer created by [`tm_malloc`], with the same deferral rules
/// as [`tm_delete`].
///
/// # Safety
///
/// `buf` must come from [`tm_malloc`] and must not be retired twice or used
/// after the retiring transaction commits.
pub unsafe fn tm_free(buf: *mut u8) {
    if buf.is_null() {
        return;
    }
    match active() {
        None => reclaim_raw(buf),
        Some(tx) => {
            let op = &mut *tx.op;
            op.push_retire(buf, reclaim_raw);
        }
    }
}
