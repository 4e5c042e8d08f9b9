//! Transactional ordered map on top of the petek STM runtime.
//!
//! A skip list whose every field lives in a [`TxCell`], so lookups,
//! insertions and removals are plain sequential code wrapped in a
//! transaction. Nodes come from [`tm_new`] and go through [`tm_delete`], so
//! an aborted operation leaks nothing and a removed node is only freed once
//! the removing transaction commits.
//!
//! Operations run on the global petek engine. Calling them inside an open
//! transaction composes: the operation joins the enclosing transaction.

#![warn(missing_docs)]

use petek::{read_tx, tm_delete, tm_new, update_tx, TxCell};
use std::ptr;

/// Tallest tower a node can have.
const MAX_LEVEL: usize = 23;

struct Node<K, V> {
    key: TxCell<K>,
    value: TxCell<V>,
    forw: [TxCell<*mut Node<K, V>>; MAX_LEVEL + 1],
}

impl<K: Copy, V: Copy> Node<K, V> {
    fn new(key: K, value: V) -> Self {
        Self {
            key: TxCell::new(key),
            value: TxCell::new(value),
            forw: std::array::from_fn(|_| TxCell::new(ptr::null_mut())),
        }
    }
}

/// Tower height with a geometric distribution, p = 1/2.
fn random_level() -> usize {
    let r: u64 = rand::random();
    (r.trailing_zeros() as usize).min(MAX_LEVEL)
}

/// A concurrent ordered map with transactional operations.
///
/// Keys and values must fit a [`TxCell`]: `Copy` and at most 64 bits.
///
/// # Example
///
/// ```
/// use petek_map::SkipMap;
///
/// let map: SkipMap<u64, u64> = SkipMap::new();
/// assert!(map.insert(3, 30));
/// assert!(map.insert(1, 10));
/// assert!(!map.insert(3, 99)); // duplicate, first value wins
/// assert_eq!(map.get(3), Some(30));
/// assert_eq!(map.keys(), vec![1, 3]);
/// ```
pub struct SkipMap<K, V> {
    /// Sentinel node; its key is never compared.
    head: TxCell<*mut Node<K, V>>,
    /// Highest level currently in use.
    level: TxCell<usize>,
}

unsafe impl<K: Copy + Send, V: Copy + Send> Send for SkipMap<K, V> {}
unsafe impl<K: Copy + Send, V: Copy + Send> Sync for SkipMap<K, V> {}

impl<K: Copy + Ord + Default, V: Copy + Default> SkipMap<K, V> {
    /// Creates an empty map.
    pub fn new() -> Self {
        let sentinel = tm_new(Node::new(K::default(), V::default()));
        Self {
            head: TxCell::new(sentinel),
            level: TxCell::new(0),
        }
    }
}

impl<K: Copy + Ord + Default, V: Copy + Default> Default for SkipMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Copy + Ord, V: Copy> SkipMap<K, V> {
    /// First node with key >= `key`, or null. Must run inside a transaction.
    unsafe fn seek(&self, key: K) -> *mut Node<K, V> {
        let mut x = self.head.load();
        for i in (0..=self.level.load()).rev() {
            loop {
                let nxt = (*x).forw[i].load();
                if !nxt.is_null() && (*nxt).key.load() < key {
                    x = nxt;
                } else {
                    break;
                }
            }
        }
        (*x).forw[0].load()
    }

    /// True when `key` is present.
    pub fn contains(&self, key: K) -> bool {
        read_tx(|| unsafe {
            let x = self.seek(key);
            !x.is_null() && (*x).key.load() == key
        })
    }

    /// The value stored under `key`, if any.
    pub fn get(&self, key: K) -> Option<V> {
        read_tx(|| unsafe {
            let x = self.seek(key);
            if !x.is_null() && (*x).key.load() == key {
                Some((*x).value.load())
            } else {
                None
            }
        })
    }

    /// Inserts `key` -> `value`. Returns false (and stores nothing) when the
    /// key is already present.
    pub fn insert(&self, key: K, value: V) -> bool {
        update_tx(|| unsafe {
            let head = self.head.load();
            let mut update = [ptr::null_mut::<Node<K, V>>(); MAX_LEVEL + 1];
            let cur_level = self.level.load();
            let mut x = head;
            for i in (0..=cur_level).rev() {
                loop {
                    let nxt = (*x).forw[i].load();
                    if !nxt.is_null() && (*nxt).key.load() < key {
                        x = nxt;
                    } else {
                        break;
                    }
                }
                update[i] = x;
            }
            let nxt = (*x).forw[0].load();
            if !nxt.is_null() && (*nxt).key.load() == key {
                return false;
            }
            let lvl = random_level();
            if lvl > cur_level {
                for slot in update.iter_mut().take(lvl + 1).skip(cur_level + 1) {
                    *slot = head;
                }
                self.level.store(lvl);
            }
            let node = tm_new(Node::new(key, value));
            for i in 0..=lvl {
                (*node).forw[i].store((*update[i]).forw[i].load());
                (*update[i]).forw[i].store(node);
            }
            true
        })
    }

    /// Removes `key`. Returns false when it was not present.
    pub fn remove(&self, key: K) -> bool {
        update_tx(|| unsafe {
            let head = self.head.load();
            let mut update = [ptr::null_mut::<Node<K, V>>(); MAX_LEVEL + 1];
            let cur_level = self.level.load();
            let mut x = head;
            for i in (0..=cur_level).rev() {
                loop {
                    let nxt = (*x).forw[i].load();
                    if !nxt.is_null() && (*nxt).key.load() < key {
                        x = nxt;
                    } else {
                        break;
                    }
                }
                update[i] = x;
            }
            let x = (*x).forw[0].load();
            if x.is_null() || (*x).key.load() != key {
                return false;
            }
            for i in 0..=cur_level {
                if (*update[i]).forw[i].load() != x {
                    break;
                }
                (*update[i]).forw[i].store((*x).forw[i].load());
            }
            tm_delete(x);
            // Shrink the level while the top lanes are empty.
            while self.level.load() > 0 && (*head).forw[self.level.load()].load().is_null() {
                self.level.store(self.level.load() - 1);
            }
            true
        })
    }

    /// Every key, in order.
    pub fn keys(&self) -> Vec<K> {
        read_tx(|| unsafe {
            let mut out = Vec::new();
            let mut x = (*self.head.load()).forw[0].load();
            while !x.is_null() {
                out.push((*x).key.load());
                x = (*x).forw[0].load();
            }
            out
        })
    }

    /// Keys in `[lo, hi)`, in order.
    pub fn range(&self, lo: K, hi: K) -> Vec<K> {
        read_tx(|| unsafe {
            let mut out = Vec::new();
            let mut x = self.seek(lo);
            while !x.is_null() {
                let key = (*x).key.load();
                if key >= hi {
                    break;
                }
                out.push(key);
                x = (*x).forw[0].load();
            }
            out
        })
    }

    /// Number of entries. Walks the whole list.
    pub fn len(&self) -> usize {
        read_tx(|| unsafe {
            let mut n = 0;
            let mut x = (*self.head.load()).forw[0].load();
            while !x.is_null() {
                n += 1;
                x = (*x).forw[0].load();
            }
            n
        })
    }

    /// True when the map holds no entries.
    pub fn is_empty(&self) -> bool {
        read_tx(|| unsafe { (*self.head.load()).forw[0].load().is_null() })
    }
}

impl<K, V> Drop for SkipMap<K, V> {
    fn drop(&mut self) {
        // Exclusive access; free the chain, sentinel included, outside any
        // transaction.
        unsafe {
            let mut x = self.head.load();
            while !x.is_null() {
                let nxt = (*x).forw[0].load();
                tm_delete(x);
                x = nxt;
            }
        }
    }
}
