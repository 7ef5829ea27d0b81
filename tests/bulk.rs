use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Mutex;

use binmap::HashMap;

mod common;
use common::with_map;

// Sequential, maximally parallel, and default-ish thresholds.
const THRESHOLDS: [u64; 3] = [u64::MAX, 1, 512];

const ENTRIES: i64 = if cfg!(miri) { 64 } else { 10_000 };

fn populate<S: std::hash::BuildHasher>(map: &HashMap<i64, i64, S>) {
    let guard = map.guard();
    for i in 0..ENTRIES {
        map.insert(i, 2 * i, &guard).unwrap();
    }
}

#[test]
fn for_each() {
    with_map::<i64, i64>(|map| {
        let map = map();
        populate(&map);

        for threshold in THRESHOLDS {
            let seen = Mutex::new(HashSet::new());
            map.for_each(threshold, |k, v| {
                assert_eq!(*v, 2 * k);
                assert!(seen.lock().unwrap().insert(*k));
            });
            assert_eq!(seen.into_inner().unwrap().len(), ENTRIES as usize);

            let count = AtomicUsize::new(0);
            map.for_each_key(threshold, |_| {
                count.fetch_add(1, Ordering::Relaxed);
            });
            assert_eq!(count.load(Ordering::Relaxed), ENTRIES as usize);

            let sum = AtomicI64::new(0);
            map.for_each_value(threshold, |v| {
                sum.fetch_add(*v, Ordering::Relaxed);
            });
            assert_eq!(sum.load(Ordering::Relaxed), ENTRIES * (ENTRIES - 1));

            let count = AtomicUsize::new(0);
            map.for_each_entry(threshold, |(k, v)| {
                assert_eq!(*v, 2 * k);
                count.fetch_add(1, Ordering::Relaxed);
            });
            assert_eq!(count.load(Ordering::Relaxed), ENTRIES as usize);
        }
    });
}

#[test]
fn for_each_with_transformer() {
    with_map::<i64, i64>(|map| {
        let map = map();
        populate(&map);

        for threshold in THRESHOLDS {
            // Odd keys are skipped by the transformer.
            let count = AtomicUsize::new(0);
            map.for_each_with(
                threshold,
                |k, v| (k % 2 == 0).then_some(*v),
                |v| {
                    assert_eq!(v % 4, 0);
                    count.fetch_add(1, Ordering::Relaxed);
                },
            );
            assert_eq!(count.load(Ordering::Relaxed), ENTRIES as usize / 2);

            let count = AtomicUsize::new(0);
            map.for_each_key_with(threshold, |k| (*k < 10).then_some(*k), |_| {
                count.fetch_add(1, Ordering::Relaxed);
            });
            assert_eq!(count.load(Ordering::Relaxed), 10);

            let count = AtomicUsize::new(0);
            map.for_each_value_with(threshold, |v| (*v < 10).then_some(*v), |_| {
                count.fetch_add(1, Ordering::Relaxed);
            });
            assert_eq!(count.load(Ordering::Relaxed), 5);
        }
    });
}

#[test]
fn reduce() {
    with_map::<i64, i64>(|map| {
        let map = map();
        populate(&map);

        let n = ENTRIES;
        for threshold in THRESHOLDS {
            assert_eq!(map.reduce(threshold, |k, v| Some(k + v), |a, b| a + b), Some(3 * n * (n - 1) / 2));
            assert_eq!(map.reduce_keys(threshold, i64::max), Some(n - 1));
            assert_eq!(map.reduce_values(threshold, i64::min), Some(0));
            assert_eq!(
                map.reduce_keys_with(threshold, |k| (k % 2 == 1).then_some(1), |a, b| a + b),
                Some(n / 2)
            );
            assert_eq!(
                map.reduce_values_with(threshold, |v| (*v >= 2 * (n - 2)).then_some(*v), |a, b| a + b),
                Some(2 * (n - 2) + 2 * (n - 1))
            );
            assert_eq!(
                map.reduce_entries(threshold, |a, b| if a.0 > b.0 { a } else { b }),
                Some((n - 1, 2 * (n - 1)))
            );
        }
    });
}

#[test]
fn reduce_empty() {
    with_map::<i64, i64>(|map| {
        let map = map();

        for threshold in THRESHOLDS {
            assert_eq!(map.reduce(threshold, |k, _| Some(*k), |a, b| a + b), None);
            assert_eq!(map.reduce_keys(threshold, |a, b| a + b), None);
            assert_eq!(map.reduce_entries(threshold, |a, _| a), None);
            assert_eq!(map.reduce_to_i64(threshold, |k, _| *k, 7, |a, b| a + b), 7);
        }
    });
}

#[test]
fn reduce_to_primitive() {
    with_map::<i64, i64>(|map| {
        let map = map();
        populate(&map);

        let n = ENTRIES;
        for threshold in THRESHOLDS {
            assert_eq!(map.reduce_values_to_i64(threshold, |v| *v, 0, |a, b| a + b), n * (n - 1));
            assert_eq!(map.reduce_keys_to_i64(threshold, |k| *k, 0, |a, b| a + b), n * (n - 1) / 2);
            assert_eq!(map.reduce_to_i64(threshold, |k, v| v - k, 0, |a, b| a + b), n * (n - 1) / 2);
            assert_eq!(map.reduce_to_i64(threshold, |k, _| *k, i64::MIN, i64::max), n - 1);

            assert_eq!(map.reduce_to_i32(threshold, |_, _| 1, 0, |a, b| a + b), n as i32);
            assert_eq!(map.reduce_keys_to_i32(threshold, |k| (*k % 7) as i32, 0, i32::max), 6);
            assert_eq!(map.reduce_values_to_i32(threshold, |v| *v as i32, i32::MAX, i32::min), 0);

            assert_eq!(map.reduce_to_f64(threshold, |_, _| 0.5, 0.0, |a, b| a + b), n as f64 / 2.0);
            assert_eq!(map.reduce_keys_to_f64(threshold, |k| *k as f64, 0.0, f64::max), (n - 1) as f64);
            assert_eq!(map.reduce_values_to_f64(threshold, |v| *v as f64, f64::INFINITY, f64::min), 0.0);
        }
    });
}

#[test]
fn search() {
    with_map::<i64, i64>(|map| {
        let map = map();
        populate(&map);

        for threshold in THRESHOLDS {
            assert_eq!(map.search(threshold, |k, v| (*k == 42).then_some(*v)), Some(84));
            assert_eq!(map.search(threshold, |k, _| (*k < 0).then_some(*k)), None);
            assert_eq!(map.search_keys(threshold, |k| (*k == 7).then(|| k.to_string())), Some("7".to_owned()));
            assert_eq!(map.search_values(threshold, |v| (*v == 10).then_some(*v / 2)), Some(5));
            assert_eq!(map.search_entries(threshold, |(k, v)| (*k == 1).then_some((*k, *v))), Some((1, 2)));

            // Any of the matching entries may be returned.
            let found = map.search_keys(threshold, |k| (*k % 1000 == 0).then_some(*k)).unwrap();
            assert_eq!(found % 1000, 0);
        }
    });
}

#[test]
fn search_empty() {
    let map: HashMap<i64, i64> = HashMap::new();
    assert_eq!(map.search(1, |k, _| Some(*k)), None);
    assert_eq!(map.search(u64::MAX, |k, _| Some(*k)), None);
}

#[test]
fn bulk_during_updates() {
    // Bulk operations observe a weakly consistent view while other threads update
    // the map, but always see entries that were never removed.
    let map: HashMap<i64, i64> = HashMap::with_capacity(1);
    populate(&map);

    std::thread::scope(|s| {
        s.spawn(|| {
            let guard = map.guard();
            for i in ENTRIES..2 * ENTRIES {
                map.insert(i, 2 * i, &guard).unwrap();
            }
        });

        for _ in 0..4 {
            let count = map.reduce_keys_to_i64(1, |k| (*k < ENTRIES) as i64, 0, |a, b| a + b);
            assert_eq!(count, ENTRIES);
        }
    });

    assert_eq!(map.reduce_to_i64(1, |_, _| 1, 0, |a, b| a + b), 2 * ENTRIES);
}
