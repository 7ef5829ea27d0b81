#![allow(dead_code)]

use binmap::HashMap;

use std::collections::hash_map::{DefaultHasher, RandomState};
use std::hash::{BuildHasher, Hasher};

// Run the test on different configurations of a `HashMap`.
pub fn with_map<K, V>(mut test: impl FnMut(&dyn Fn() -> HashMap<K, V, TestHasher>)) {
    // Default configuration.
    test(&(|| HashMap::builder().hasher(TestHasher::random()).build()));

    // A tiny initial table, forcing many resizes.
    test(
        &(|| {
            HashMap::builder()
                .capacity(1)
                .hasher(TestHasher::random())
                .build()
        }),
    );

    // Every key hashes to the same bin, forcing it to be treeified.
    if !cfg!(binmap_stress) {
        test(&(|| HashMap::builder().hasher(TestHasher::colliding()).build()));
    }
}

// A hasher that is either randomly seeded or maps every key to the same hash.
#[derive(Clone, Default)]
pub struct TestHasher {
    collide: bool,
    random: RandomState,
}

impl TestHasher {
    pub fn random() -> TestHasher {
        TestHasher::default()
    }

    pub fn colliding() -> TestHasher {
        TestHasher {
            collide: true,
            random: RandomState::new(),
        }
    }
}

impl BuildHasher for TestHasher {
    type Hasher = TestHasherState;

    fn build_hasher(&self) -> TestHasherState {
        TestHasherState {
            collide: self.collide,
            inner: self.random.build_hasher(),
        }
    }
}

pub struct TestHasherState {
    collide: bool,
    inner: DefaultHasher,
}

impl Hasher for TestHasherState {
    fn finish(&self) -> u64 {
        if self.collide {
            0x2a
        } else {
            self.inner.finish()
        }
    }

    fn write(&mut self, bytes: &[u8]) {
        self.inner.write(bytes)
    }
}

// Prints a log message if `RUST_LOG=debug` is set.
#[macro_export]
macro_rules! debug {
    ($($x:tt)*) => {
        if std::env::var("RUST_LOG").as_deref() == Ok("debug") {
            println!($($x)*);
        }
    };
}

// Returns the number of threads to use for stress testing.
pub fn threads() -> usize {
    if cfg!(miri) {
        2
    } else {
        num_cpus::get_physical().next_power_of_two()
    }
}
