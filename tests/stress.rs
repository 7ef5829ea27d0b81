// adapted from: https://github.com/jonhoo/flurry/tree/main/tests/jdk

use binmap::HashMap;
use rand::prelude::*;

use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Barrier;
use std::thread;

mod common;
use common::threads;

fn with_map<K, V>(mut test: impl FnMut(&dyn Fn() -> HashMap<K, V>)) {
    test(&(|| HashMap::new()));
    test(&(|| HashMap::with_capacity(1)));
    test(&(|| HashMap::builder().concurrency_level(threads()).build()));
}

#[test]
fn contains_key_stress() {
    const ITERATIONS: usize = if cfg!(miri) { 1 } else { 64 };
    const ENTRIES: usize = if cfg!(miri) { 64 } else { 1 << 10 };
    const ROUNDS: usize = if cfg!(miri) { 1 } else { 32 };

    with_map(|map| {
        let map = map();
        let mut content = [0; ENTRIES];

        {
            let guard = map.guard();
            for k in 0..ENTRIES {
                map.insert(k, k, &guard).unwrap();
                content[k] = k;
            }
        }

        for _ in 0..ITERATIONS {
            let threads = threads();
            let barrier = Barrier::new(threads);
            thread::scope(|s| {
                for _ in 0..threads {
                    s.spawn(|| {
                        barrier.wait();
                        let guard = map.guard();
                        for i in 0..ENTRIES * ROUNDS {
                            let key = content[i % content.len()];
                            assert!(map.contains_key(&key, &guard));
                        }
                    });
                }
            });
        }
    });
}

#[test]
fn merge_stress() {
    const ITERATIONS: usize = if cfg!(miri) { 1 } else { 32 };
    const ENTRIES: usize = if cfg!(miri) { 64 } else { 1 << 12 };

    with_map(|map| {
        let map = map();

        for t in 0..ITERATIONS {
            let threads = threads();
            let barrier = Barrier::new(threads);

            thread::scope(|s| {
                for _ in 0..threads {
                    s.spawn(|| {
                        barrier.wait();
                        let guard = map.guard();
                        for i in 0..ENTRIES {
                            let new = *map.merge(i, 1, |v, n| Some(v + n), &guard).unwrap().unwrap();
                            assert!((1..=(threads * (t + 1))).contains(&new));
                        }
                    });
                }
            });

            // No update was lost.
            let guard = map.guard();
            for i in 0..ENTRIES {
                assert_eq!(*map.get(&i, &guard).unwrap(), threads * (t + 1));
            }
            assert_eq!(map.len(), ENTRIES);
        }
    });
}

#[test]
fn compute_if_absent_stress() {
    const ITERATIONS: usize = if cfg!(miri) { 1 } else { 16 };
    const ENTRIES: usize = if cfg!(miri) { 64 } else { 1 << 12 };

    with_map(|map| {
        for _ in 0..ITERATIONS {
            let map = map();
            let calls = AtomicUsize::new(0);
            let threads = threads();
            let barrier = Barrier::new(threads);

            thread::scope(|s| {
                for t in 0..threads {
                    let (map, calls, barrier) = (&map, &calls, &barrier);
                    s.spawn(move || {
                        barrier.wait();
                        let guard = map.guard();
                        for i in 0..ENTRIES {
                            let value = map
                                .compute_if_absent(
                                    i,
                                    |_| {
                                        calls.fetch_add(1, Ordering::Relaxed);
                                        Some(t)
                                    },
                                    &guard,
                                )
                                .unwrap();

                            // Every thread observes the value of the single winner.
                            assert_eq!(value, map.get(&i, &guard));
                        }
                    });
                }
            });

            // The mapping function ran exactly once per key.
            assert_eq!(calls.load(Ordering::Relaxed), ENTRIES);
            assert_eq!(map.len(), ENTRIES);
        }
    });
}

#[test]
fn insert_if_absent_stress() {
    const ITERATIONS: usize = if cfg!(miri) { 1 } else { 16 };
    const ENTRIES: usize = if cfg!(miri) { 64 } else { 1 << 12 };

    with_map(|map| {
        for _ in 0..ITERATIONS {
            let map = map();
            let winners = AtomicUsize::new(0);
            let threads = threads();
            let barrier = Barrier::new(threads);

            thread::scope(|s| {
                for t in 0..threads {
                    let (map, winners, barrier) = (&map, &winners, &barrier);
                    s.spawn(move || {
                        barrier.wait();
                        let map = map.pin();
                        for i in 0..ENTRIES {
                            if map.insert_if_absent(i, t).unwrap().is_none() {
                                winners.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    });
                }
            });

            assert_eq!(winners.load(Ordering::Relaxed), ENTRIES);
            assert_eq!(map.len(), ENTRIES);
        }
    });
}

#[test]
fn insert_stress() {
    const ITERATIONS: usize = if cfg!(miri) { 1 } else { 32 };
    const ENTRIES: usize = if cfg!(miri) { 64 } else { 1 << 12 };

    #[derive(Hash, PartialEq, Eq, Clone, Copy)]
    struct KeyVal {
        _data: usize,
    }

    impl KeyVal {
        pub fn new() -> Self {
            let mut rng = rand::thread_rng();
            Self { _data: rng.gen() }
        }
    }

    with_map(|map| {
        for _ in 0..ITERATIONS {
            let map = map();
            let threads = threads();
            let barrier = Barrier::new(threads);
            thread::scope(|s| {
                for _ in 0..threads {
                    s.spawn(|| {
                        barrier.wait();
                        for _ in 0..ENTRIES {
                            let key = KeyVal::new();
                            map.insert(key, key, &map.guard()).unwrap();
                            assert!(map.contains_key(&key, &map.guard()));
                        }
                    });
                }
            });
        }
    });
}

#[test]
fn resize_with_readers() {
    const ENTRIES: usize = if cfg!(miri) { 256 } else { 100_000 };

    let map: HashMap<usize, usize> = HashMap::with_capacity(1);
    let writers = threads();
    let done = AtomicBool::new(false);
    let inserted = AtomicUsize::new(0);

    thread::scope(|s| {
        for t in 0..writers {
            let (map, inserted) = (&map, &inserted);
            s.spawn(move || {
                let guard = map.guard();
                for i in (t..ENTRIES).step_by(writers) {
                    assert_eq!(map.insert(i, i, &guard).unwrap(), None);
                    inserted.fetch_add(1, Ordering::Relaxed);
                }
            });
        }

        // Readers never observe a value for a key that differs from the one written.
        for _ in 0..2 {
            let (map, done) = (&map, &done);
            s.spawn(move || {
                let mut rng = rand::thread_rng();
                while !done.load(Ordering::Relaxed) {
                    let guard = map.guard();
                    let key = rng.gen_range(0..ENTRIES);
                    if let Some(value) = map.get(&key, &guard) {
                        assert_eq!(*value, key);
                    }
                }
            });
        }

        while inserted.load(Ordering::Relaxed) < ENTRIES {
            thread::yield_now();
        }
        done.store(true, Ordering::Relaxed);
    });

    assert_eq!(map.len(), ENTRIES);
    assert!(map.capacity() >= ENTRIES);

    let guard = map.guard();
    for i in 0..ENTRIES {
        assert_eq!(map.get(&i, &guard), Some(&i));
    }
}

#[test]
fn iterate_during_removal() {
    const ENTRIES: usize = if cfg!(miri) { 64 } else { 1 << 14 };

    with_map(|map| {
        let map = map();
        {
            let guard = map.guard();
            for i in 0..ENTRIES {
                map.insert(i, i, &guard).unwrap();
            }
        }

        thread::scope(|s| {
            s.spawn(|| {
                let guard = map.guard();
                for i in 0..ENTRIES {
                    map.remove(&i, &guard).unwrap();
                }
            });

            // Iteration is weakly consistent and always terminates, never yielding
            // more entries than were ever present.
            let guard = map.guard();
            let mut seen = 0;
            for (k, v) in map.iter(&guard) {
                assert_eq!(k, v);
                seen += 1;
            }
            assert!(seen <= ENTRIES);
        });

        assert!(map.is_empty());
    });
}

#[test]
fn mixed_stress() {
    const ITERATIONS: usize = if cfg!(miri) { 1 } else { 32 };
    const CHUNK: usize = if cfg!(miri) { 48 } else { 1 << 12 };

    let run = |barrier: &Barrier, t: usize, map: &HashMap<usize, usize>, threads: usize| {
        barrier.wait();

        let (start, end) = (CHUNK * t, CHUNK * (t + 1));

        for i in start..end {
            assert_eq!(map.pin().insert(i, i + 1).unwrap(), None);
        }

        for i in start..end {
            assert_eq!(map.pin().get(&i), Some(&(i + 1)));
        }

        for i in start..end {
            assert_eq!(map.pin().compute_if_present(&i, |_, v| Some(v - 1)).unwrap(), Some(&i));
        }

        for i in start..end {
            assert_eq!(map.pin().remove(&i).unwrap(), Some(&i));
        }

        for i in start..end {
            assert_eq!(map.pin().get(&i), None);
        }

        for i in start..end {
            assert_eq!(map.pin().insert(i, i + 1).unwrap(), None);
        }

        for i in start..end {
            assert_eq!(map.pin().get(&i), Some(&(i + 1)));
        }

        for (&k, &v) in map.pin().iter() {
            assert!(k < CHUNK * threads);
            assert!(v == k || v == k + 1);
        }
    };

    with_map(|map| {
        for _ in 0..ITERATIONS {
            let map = map();
            let threads = threads();
            let barrier = Barrier::new(threads);

            thread::scope(|s| {
                for t in 0..threads {
                    let map = &map;
                    let barrier = &barrier;

                    s.spawn(move || run(barrier, t, map, threads));
                }
            });

            let v: Vec<_> = (0..CHUNK * threads).map(|i| (i, i + 1)).collect();
            let mut got: Vec<_> = map.pin().iter().map(|(&k, &v)| (k, v)).collect();
            got.sort();
            assert_eq!(v, got);
        }
    });
}

const SIZE: usize = if cfg!(miri) { 12 } else { 50_000 };

// there must be more things absent than present!
const ABSENT_SIZE: usize = if cfg!(miri) { 1 << 5 } else { 1 << 17 };
const ABSENT_MASK: usize = ABSENT_SIZE - 1;

fn t1<K, V>(map: &HashMap<K, V>, keys: &[K], expect: usize)
where
    K: Hash + Eq,
{
    let mut sum = 0;
    let iters = 4;
    let guard = map.guard();
    for _ in 0..iters {
        for key in keys {
            if map.get(key, &guard).is_some() {
                sum += 1;
            }
        }
    }
    assert_eq!(sum, expect * iters);
}

fn t2<K>(map: &HashMap<K, usize>, keys: &[K], expect: usize)
where
    K: Hash + Eq,
{
    let mut sum = 0;
    let guard = map.guard();
    for key in keys {
        if map.remove(key, &guard).unwrap().is_some() {
            sum += 1;
        }
    }
    assert_eq!(sum, expect);
}

fn t3<K>(map: &HashMap<K, usize>, keys: &[K], expect: usize)
where
    K: Copy + Hash + Eq,
{
    let mut sum = 0;
    let guard = map.guard();
    for key in keys {
        if map.insert(*key, 0, &guard).unwrap().is_none() {
            sum += 1;
        }
    }
    assert_eq!(sum, expect);
}

fn t4<K>(map: &HashMap<K, usize>, keys: &[K], expect: usize)
where
    K: Hash + Eq,
{
    let mut sum = 0;
    let guard = map.guard();
    for key in keys {
        if map.contains_key(key, &guard) {
            sum += 1;
        }
    }
    assert_eq!(sum, expect);
}

fn t5<K>(map: &HashMap<K, usize>, keys: &[K], expect: usize)
where
    K: Hash + Eq,
{
    let mut sum = 0;
    let guard = map.guard();
    let mut i = keys.len() as isize - 2;
    while i >= 0 {
        if map.remove(&keys[i as usize], &guard).unwrap().is_some() {
            sum += 1;
        }
        i -= 2;
    }
    assert_eq!(sum, expect);
}

fn t6<K, V>(map: &HashMap<K, V>, keys1: &[K], keys2: &[K], expect: usize)
where
    K: Hash + Eq,
{
    let mut sum = 0;
    let guard = map.guard();
    for i in 0..expect {
        if map.get(&keys1[i], &guard).is_some() {
            sum += 1;
        }
        if map.get(&keys2[i & ABSENT_MASK], &guard).is_some() {
            sum += 1;
        }
    }
    assert_eq!(sum, expect);
}

fn t7<K>(map: &HashMap<K, usize>, k1: &[K], k2: &[K])
where
    K: Hash + Eq,
{
    let mut sum = 0;
    let guard = map.guard();
    for i in 0..k1.len() {
        if map.contains_key(&k1[i], &guard) {
            sum += 1;
        }
        if map.contains_key(&k2[i], &guard) {
            sum += 1;
        }
    }
    assert_eq!(sum, k1.len());
}

fn ittest1<K>(map: &HashMap<K, usize>, expect: usize) {
    let guard = map.guard();
    assert_eq!(map.keys(&guard).count(), expect);
}

fn ittest2<K>(map: &HashMap<K, usize>, expect: usize) {
    let guard = map.guard();
    assert_eq!(map.values(&guard).count(), expect);
}

fn ittest3<K>(map: &HashMap<K, usize>, expect: usize) {
    let guard = map.guard();
    assert_eq!(map.iter(&guard).count(), expect);
}

fn bulktest<K>(map: &HashMap<K, usize>, expect: usize)
where
    K: Send + Sync,
{
    assert_eq!(map.reduce_to_i64(1, |_, _| 1, 0, |a, b| a + b), expect as i64);
    assert_eq!(map.reduce_to_i64(u64::MAX, |_, _| 1, 0, |a, b| a + b), expect as i64);
}

#[test]
fn everything() {
    let mut rng = rand::thread_rng();

    with_map(|map| {
        let map = map();
        let mut keys: Vec<_> = (0..ABSENT_SIZE + SIZE).collect();
        keys.shuffle(&mut rng);
        let absent_keys = &keys[0..ABSENT_SIZE];
        let keys = &keys[ABSENT_SIZE..];

        // put (absent)
        t3(&map, keys, SIZE);
        // put (present)
        t3(&map, keys, 0);
        // contains_key (present & absent)
        t7(&map, keys, absent_keys);
        // contains_key (present)
        t4(&map, keys, SIZE);
        // contains_key (absent)
        t4(&map, absent_keys, 0);
        // get
        t6(&map, keys, absent_keys, SIZE);
        // get (present)
        t1(&map, keys, SIZE);
        // get (absent)
        t1(&map, absent_keys, 0);
        // remove (absent)
        t2(&map, absent_keys, 0);
        // remove (present)
        t5(&map, keys, SIZE / 2);
        // put (half present)
        t3(&map, keys, SIZE / 2);
        // iter, keys, values (present)
        ittest1(&map, SIZE);
        ittest2(&map, SIZE);
        ittest3(&map, SIZE);
        // bulk (present)
        bulktest(&map, SIZE);
    });
}
