#![no_main]

use libfuzzer_sys::fuzz_target;
use std::collections::hash_map::{DefaultHasher, Entry};

use arbitrary::Arbitrary;
use binmap::{Guard, HashMap as BinHashMap, HashMapRef};
use std::collections::HashMap as StdHashMap;
use std::hash::{BuildHasher, Hasher};

#[derive(Debug, Arbitrary)]
enum Operation<K, V> {
    Insert(K, V),
    InsertIfAbsent(K, V),
    Remove(K),
    RemoveValue(K, V),
    Replace(K, V),
    Get(K),
    Contains(K),
    Clear,
    Len,
    IsEmpty,
    Merge(K, V),
    ComputeIfAbsent(K, V),
    Compute(K),
    Reserve(u8),
    Retain(V),
}

#[derive(Debug, Arbitrary)]
struct FuzzInput {
    collide: bool,
    operations: Vec<Operation<u16, u32>>,
}

// Optionally discards most hash bits so bins grow long enough to become trees.
#[derive(Clone, Copy)]
struct MaskedState(u64);

struct MaskedHasher(DefaultHasher, u64);

impl BuildHasher for MaskedState {
    type Hasher = MaskedHasher;

    fn build_hasher(&self) -> MaskedHasher {
        MaskedHasher(DefaultHasher::new(), self.0)
    }
}

impl Hasher for MaskedHasher {
    fn finish(&self) -> u64 {
        self.0.finish() & self.1
    }

    fn write(&mut self, bytes: &[u8]) {
        self.0.write(bytes)
    }
}

fn fuzz_hashmap(input: FuzzInput) {
    let mask = if input.collide { 0b11 } else { u64::MAX };
    let mut std_map = StdHashMap::new();
    let bin_raw = BinHashMap::with_hasher(MaskedState(mask));
    let bin_map = bin_raw.pin();

    for op in input.operations {
        match op {
            Operation::Insert(k, v) => {
                let std_result = std_map.insert(k, v);
                let bin_result = bin_map.insert(k, v).unwrap();
                assert_eq!(std_result.as_ref(), bin_result);
            }
            Operation::InsertIfAbsent(k, v) => {
                let std_result = match std_map.entry(k) {
                    Entry::Occupied(entry) => Some(*entry.get()),
                    Entry::Vacant(entry) => {
                        entry.insert(v);
                        None
                    }
                };
                let bin_result = bin_map.insert_if_absent(k, v).unwrap();
                assert_eq!(std_result.as_ref(), bin_result);
            }
            Operation::Remove(k) => {
                let std_result = std_map.remove(&k);
                let bin_result = bin_map.remove(&k).unwrap();
                assert_eq!(std_result.as_ref(), bin_result);
            }
            Operation::RemoveValue(k, v) => {
                let std_result = std_map.get(&k) == Some(&v);
                if std_result {
                    std_map.remove(&k);
                }
                let bin_result = bin_map.remove_value(&k, &v).unwrap();
                assert_eq!(std_result, bin_result);
            }
            Operation::Replace(k, v) => {
                let std_result = std_map.get_mut(&k).map(|e| std::mem::replace(e, v));
                let bin_result = bin_map.replace(&k, v).unwrap();
                assert_eq!(std_result.as_ref(), bin_result);
            }
            Operation::Get(k) => {
                let std_result = std_map.get(&k);
                let bin_result = bin_map.get(&k);
                assert_eq!(std_result, bin_result);
            }
            Operation::Contains(k) => {
                let std_result = std_map.contains_key(&k);
                let bin_result = bin_map.contains_key(&k);
                assert_eq!(std_result, bin_result);
            }
            Operation::Clear => {
                std_map.clear();
                bin_map.clear().unwrap();
            }
            Operation::Len => {
                assert_eq!(std_map.len(), bin_map.len());
            }
            Operation::IsEmpty => {
                assert_eq!(std_map.is_empty(), bin_map.is_empty());
            }
            Operation::Merge(k, v) => {
                let std_result = *std_map
                    .entry(k)
                    .and_modify(|e| *e = e.wrapping_add(v))
                    .or_insert(v);
                let bin_result = bin_map.merge(k, v, |e, v| Some(e.wrapping_add(v))).unwrap();
                assert_eq!(Some(&std_result), bin_result);
            }
            Operation::ComputeIfAbsent(k, v) => {
                let std_result = *std_map.entry(k).or_insert(v);
                let bin_result = bin_map.compute_if_absent(k, |_| Some(v)).unwrap();
                assert_eq!(Some(&std_result), bin_result);
            }
            Operation::Compute(k) => compute(&mut std_map, &bin_map, k),
            Operation::Reserve(additional) => {
                bin_map.try_reserve(additional as usize).unwrap();
            }
            Operation::Retain(v) => {
                std_map.retain(|_, e| *e >= v);
                bin_map.retain(|_, e| *e >= v).unwrap();
            }
        }
    }

    // Final consistency checks
    for (k, v) in std_map.iter() {
        let bin_result = bin_map.get(k);
        assert_eq!(Some(v), bin_result);
    }
    assert_eq!(std_map.len(), bin_map.len());
    assert_eq!(std_map.len(), bin_map.iter().count());
    assert_eq!(std_map.is_empty(), bin_map.is_empty());
}

fn compute<S, G>(std: &mut StdHashMap<u16, u32>, map: &HashMapRef<u16, u32, S, G>, k: u16)
where
    S: BuildHasher,
    G: Guard,
{
    // Remove even values, increment odd ones, and insert zero for missing keys.
    let expected = match std.entry(k) {
        Entry::Occupied(mut entry) => {
            let value = *entry.get();
            if value % 2 == 0 {
                entry.remove();
                None
            } else {
                *entry.get_mut() = value.wrapping_add(1);
                Some(value.wrapping_add(1))
            }
        }
        Entry::Vacant(entry) => Some(*entry.insert(0)),
    };

    let result = map
        .compute(k, |_, value| match value {
            Some(value) if value % 2 == 0 => None,
            Some(value) => Some(value.wrapping_add(1)),
            None => Some(0),
        })
        .unwrap();

    assert_eq!(expected.as_ref(), result);
}

fuzz_target!(|data: FuzzInput| {
    fuzz_hashmap(data);
});
