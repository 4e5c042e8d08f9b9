use petek_map::SkipMap;
use std::sync::Arc;
use std::thread;

#[test]
fn test_insert_and_in_order_traversal() {
    let map: SkipMap<u64, u64> = SkipMap::new();
    let mut inserted = 0;
    for key in [3u64, 1, 4, 1, 5, 9, 2, 6] {
        if map.insert(key, key * 10) {
            inserted += 1;
        }
    }
    // The duplicate 1 was rejected.
    assert_eq!(inserted, 7);
    assert_eq!(map.keys(), vec![1, 2, 3, 4, 5, 6, 9]);

    assert!(map.remove(4));
    assert_eq!(map.keys(), vec![1, 2, 3, 5, 6, 9]);
}

#[test]
fn test_get_contains_remove() {
    let map: SkipMap<u64, u64> = SkipMap::new();
    assert!(map.is_empty());
    assert!(map.insert(10, 100));
    assert!(map.insert(20, 200));

    assert!(map.contains(10));
    assert!(!map.contains(15));
    assert_eq!(map.get(20), Some(200));
    assert_eq!(map.get(15), None);

    assert!(map.remove(10));
    assert!(!map.remove(10));
    assert!(!map.contains(10));
    assert_eq!(map.len(), 1);
}

#[test]
fn test_duplicate_insert_keeps_first_value() {
    let map: SkipMap<u64, u64> = SkipMap::new();
    assert!(map.insert(5, 50));
    assert!(!map.insert(5, 99));
    assert_eq!(map.get(5), Some(50));
}

#[test]
fn test_range_query() {
    let map: SkipMap<u64, u64> = SkipMap::new();
    for key in [8u64, 2, 6, 4, 10] {
        map.insert(key, key);
    }
    assert_eq!(map.range(2, 8), vec![2, 4, 6]);
    assert_eq!(map.range(3, 11), vec![4, 6, 8, 10]);
    assert_eq!(map.range(11, 20), Vec::<u64>::new());
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_concurrent_disjoint_inserts() {
    let map: Arc<SkipMap<u64, u64>> = Arc::new(SkipMap::new());
    let threads = 4u64;
    let per_thread = 500u64;

    let mut handles = vec![];
    for t in 0..threads {
        let map = map.clone();
        handles.push(thread::spawn(move || {
            for i in 0..per_thread {
                let key = t * per_thread + i;
                assert!(map.insert(key, key));
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    let keys = map.keys();
    assert_eq!(keys.len(), (threads * per_thread) as usize);
    assert!(keys.windows(2).all(|w| w[0] < w[1]), "keys out of order");
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_concurrent_mixed_operations() {
    let map: Arc<SkipMap<u64, u64>> = Arc::new(SkipMap::new());
    for key in 0..64u64 {
        map.insert(key, key);
    }

    let mut handles = vec![];
    for t in 0..4u64 {
        let map = map.clone();
        handles.push(thread::spawn(move || {
            for round in 0..500u64 {
                let key = (t * 16) + (round % 16);
                if round % 2 == 0 {
                    map.remove(key);
                } else {
                    map.insert(key, key);
                }
                map.contains(key);
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    // Whatever interleaving happened, the list structure must be intact:
    // strictly ascending keys and every key in its owner's range or the
    // shared survivors.
    let keys = map.keys();
    assert!(keys.windows(2).all(|w| w[0] < w[1]), "keys out of order");
    assert!(keys.iter().all(|&k| k < 64));
}
