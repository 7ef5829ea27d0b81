//! Bulk operations over every entry of a [`HashMap`].
//!
//! Each operation takes a `parallelism_threshold`, the estimated number of entries
//! below which the operation runs on the calling thread. A threshold of `u64::MAX`
//! always runs sequentially, and a threshold of `1` uses as much parallelism as the
//! [`rayon`] pool offers. Larger maps are split by table range into parts that run
//! on the pool, at most four per worker thread.
//!
//! Bulk operations are weakly consistent, like [`HashMap::iter`]. Every entry
//! present for the whole operation is visited exactly once, and entries inserted or
//! removed concurrently may or may not be visited. If a user function panics, the
//! operation is aborted and the panic resumes on the calling thread.
//!
//! Functions passed to these methods may run concurrently on several threads, so
//! reducers must be associative and commutative.

use crate::HashMap;

use std::sync::OnceLock;

impl<K, V, S> HashMap<K, V, S>
where
    K: Send + Sync,
    V: Send + Sync,
    S: Sync,
{
    /// Performs `action` for each key-value pair.
    ///
    /// # Examples
    ///
    /// ```
    /// use binmap::HashMap;
    /// use std::sync::atomic::{AtomicUsize, Ordering};
    ///
    /// let map: HashMap<usize, usize> = (0..100).map(|i| (i, i)).collect();
    ///
    /// let sum = AtomicUsize::new(0);
    /// map.for_each(1, |_, v| {
    ///     sum.fetch_add(*v, Ordering::Relaxed);
    /// });
    /// assert_eq!(sum.into_inner(), 4950);
    /// ```
    pub fn for_each<F>(&self, parallelism_threshold: u64, action: F)
    where
        F: Fn(&K, &V) + Sync,
    {
        self.raw.bulk(
            parallelism_threshold,
            |entries| entries.for_each(|(k, v)| action(k, v)),
            |(), ()| (),
        )
    }

    /// Performs `action` for each non-`None` result of `transformer` applied to each
    /// key-value pair.
    pub fn for_each_with<U, T, F>(&self, parallelism_threshold: u64, transformer: T, action: F)
    where
        T: Fn(&K, &V) -> Option<U> + Sync,
        F: Fn(U) + Sync,
    {
        self.for_each(parallelism_threshold, |k, v| {
            if let Some(u) = transformer(k, v) {
                action(u);
            }
        })
    }

    /// Performs `action` for each key.
    pub fn for_each_key<F>(&self, parallelism_threshold: u64, action: F)
    where
        F: Fn(&K) + Sync,
    {
        self.for_each(parallelism_threshold, |k, _| action(k))
    }

    /// Performs `action` for each non-`None` result of `transformer` applied to each key.
    pub fn for_each_key_with<U, T, F>(&self, parallelism_threshold: u64, transformer: T, action: F)
    where
        T: Fn(&K) -> Option<U> + Sync,
        F: Fn(U) + Sync,
    {
        self.for_each_with(parallelism_threshold, |k, _| transformer(k), action)
    }

    /// Performs `action` for each value.
    pub fn for_each_value<F>(&self, parallelism_threshold: u64, action: F)
    where
        F: Fn(&V) + Sync,
    {
        self.for_each(parallelism_threshold, |_, v| action(v))
    }

    /// Performs `action` for each non-`None` result of `transformer` applied to each value.
    pub fn for_each_value_with<U, T, F>(&self, parallelism_threshold: u64, transformer: T, action: F)
    where
        T: Fn(&V) -> Option<U> + Sync,
        F: Fn(U) + Sync,
    {
        self.for_each_with(parallelism_threshold, |_, v| transformer(v), action)
    }

    /// Performs `action` for each entry, passed as a key-value tuple.
    pub fn for_each_entry<F>(&self, parallelism_threshold: u64, action: F)
    where
        F: Fn((&K, &V)) + Sync,
    {
        self.for_each(parallelism_threshold, |k, v| action((k, v)))
    }

    /// Returns the result of accumulating the non-`None` results of `transformer`
    /// applied to each key-value pair using `reducer`, or `None` if there are none.
    ///
    /// # Examples
    ///
    /// ```
    /// use binmap::HashMap;
    ///
    /// let map: HashMap<u64, u64> = (0..100).map(|i| (i, i)).collect();
    ///
    /// let max_even = map.reduce(1, |_, v| (v % 2 == 0).then_some(*v), u64::max);
    /// assert_eq!(max_even, Some(98));
    /// ```
    pub fn reduce<U, T, R>(&self, parallelism_threshold: u64, transformer: T, reducer: R) -> Option<U>
    where
        U: Send,
        T: Fn(&K, &V) -> Option<U> + Sync,
        R: Fn(U, U) -> U + Sync,
    {
        self.raw.bulk(
            parallelism_threshold,
            |entries| {
                entries
                    .filter_map(|(k, v)| transformer(k, v))
                    .reduce(&reducer)
            },
            |left, right| match (left, right) {
                (Some(left), Some(right)) => Some(reducer(left, right)),
                (left, right) => left.or(right),
            },
        )
    }

    /// Returns the result of accumulating all keys using `reducer`, or `None` if the
    /// map is empty.
    pub fn reduce_keys<R>(&self, parallelism_threshold: u64, reducer: R) -> Option<K>
    where
        K: Clone,
        R: Fn(K, K) -> K + Sync,
    {
        self.reduce(parallelism_threshold, |k, _| Some(k.clone()), reducer)
    }

    /// Returns the result of accumulating the non-`None` results of `transformer`
    /// applied to each key using `reducer`.
    pub fn reduce_keys_with<U, T, R>(&self, parallelism_threshold: u64, transformer: T, reducer: R) -> Option<U>
    where
        U: Send,
        T: Fn(&K) -> Option<U> + Sync,
        R: Fn(U, U) -> U + Sync,
    {
        self.reduce(parallelism_threshold, |k, _| transformer(k), reducer)
    }

    /// Returns the result of accumulating all values using `reducer`, or `None` if the
    /// map is empty.
    pub fn reduce_values<R>(&self, parallelism_threshold: u64, reducer: R) -> Option<V>
    where
        V: Clone,
        R: Fn(V, V) -> V + Sync,
    {
        self.reduce(parallelism_threshold, |_, v| Some(v.clone()), reducer)
    }

    /// Returns the result of accumulating the non-`None` results of `transformer`
    /// applied to each value using `reducer`.
    pub fn reduce_values_with<U, T, R>(&self, parallelism_threshold: u64, transformer: T, reducer: R) -> Option<U>
    where
        U: Send,
        T: Fn(&V) -> Option<U> + Sync,
        R: Fn(U, U) -> U + Sync,
    {
        self.reduce(parallelism_threshold, |_, v| transformer(v), reducer)
    }

    /// Returns the result of accumulating all entries using `reducer`, or `None` if the
    /// map is empty.
    pub fn reduce_entries<R>(&self, parallelism_threshold: u64, reducer: R) -> Option<(K, V)>
    where
        K: Clone,
        V: Clone,
        R: Fn((K, V), (K, V)) -> (K, V) + Sync,
    {
        self.reduce(
            parallelism_threshold,
            |k, v| Some((k.clone(), v.clone())),
            reducer,
        )
    }

    // Folds the results of `transformer` into `basis` with `reducer`. Every part of a
    // parallel operation starts from `basis`.
    fn reduce_to<U, T, R>(&self, parallelism_threshold: u64, transformer: T, basis: U, reducer: R) -> U
    where
        U: Copy + Send + Sync,
        T: Fn(&K, &V) -> U + Sync,
        R: Fn(U, U) -> U + Sync,
    {
        self.raw.bulk(
            parallelism_threshold,
            |entries| entries.fold(basis, |acc, (k, v)| reducer(acc, transformer(k, v))),
            &reducer,
        )
    }

    /// Returns the result of accumulating `transformer` applied to each key-value pair
    /// using `reducer`, starting from `basis`.
    ///
    /// `basis` must be an identity of `reducer`, as each part of a parallel
    /// operation starts from it.
    ///
    /// # Examples
    ///
    /// ```
    /// use binmap::HashMap;
    ///
    /// let map: HashMap<i64, i64> = (0..10_000).map(|i| (i, i * 2)).collect();
    ///
    /// let sum = map.reduce_to_i64(1, |_, v| *v, 0, |a, b| a + b);
    /// assert_eq!(sum, 9999 * 10_000);
    /// ```
    pub fn reduce_to_i64<T, R>(&self, parallelism_threshold: u64, transformer: T, basis: i64, reducer: R) -> i64
    where
        T: Fn(&K, &V) -> i64 + Sync,
        R: Fn(i64, i64) -> i64 + Sync,
    {
        self.reduce_to(parallelism_threshold, transformer, basis, reducer)
    }

    /// Returns the result of accumulating `transformer` applied to each key using
    /// `reducer`, starting from `basis`.
    pub fn reduce_keys_to_i64<T, R>(&self, parallelism_threshold: u64, transformer: T, basis: i64, reducer: R) -> i64
    where
        T: Fn(&K) -> i64 + Sync,
        R: Fn(i64, i64) -> i64 + Sync,
    {
        self.reduce_to(parallelism_threshold, |k, _| transformer(k), basis, reducer)
    }

    /// Returns the result of accumulating `transformer` applied to each value using
    /// `reducer`, starting from `basis`.
    pub fn reduce_values_to_i64<T, R>(&self, parallelism_threshold: u64, transformer: T, basis: i64, reducer: R) -> i64
    where
        T: Fn(&V) -> i64 + Sync,
        R: Fn(i64, i64) -> i64 + Sync,
    {
        self.reduce_to(parallelism_threshold, |_, v| transformer(v), basis, reducer)
    }

    /// Returns the result of accumulating `transformer` applied to each key-value pair
    /// using `reducer`, starting from `basis`.
    pub fn reduce_to_i32<T, R>(&self, parallelism_threshold: u64, transformer: T, basis: i32, reducer: R) -> i32
    where
        T: Fn(&K, &V) -> i32 + Sync,
        R: Fn(i32, i32) -> i32 + Sync,
    {
        self.reduce_to(parallelism_threshold, transformer, basis, reducer)
    }

    /// Returns the result of accumulating `transformer` applied to each key using
    /// `reducer`, starting from `basis`.
    pub fn reduce_keys_to_i32<T, R>(&self, parallelism_threshold: u64, transformer: T, basis: i32, reducer: R) -> i32
    where
        T: Fn(&K) -> i32 + Sync,
        R: Fn(i32, i32) -> i32 + Sync,
    {
        self.reduce_to(parallelism_threshold, |k, _| transformer(k), basis, reducer)
    }

    /// Returns the result of accumulating `transformer` applied to each value using
    /// `reducer`, starting from `basis`.
    pub fn reduce_values_to_i32<T, R>(&self, parallelism_threshold: u64, transformer: T, basis: i32, reducer: R) -> i32
    where
        T: Fn(&V) -> i32 + Sync,
        R: Fn(i32, i32) -> i32 + Sync,
    {
        self.reduce_to(parallelism_threshold, |_, v| transformer(v), basis, reducer)
    }

    /// Returns the result of accumulating `transformer` applied to each key-value pair
    /// using `reducer`, starting from `basis`.
    ///
    /// Floating point addition is not associative, so results may differ slightly
    /// between runs with parallelism enabled.
    pub fn reduce_to_f64<T, R>(&self, parallelism_threshold: u64, transformer: T, basis: f64, reducer: R) -> f64
    where
        T: Fn(&K, &V) -> f64 + Sync,
        R: Fn(f64, f64) -> f64 + Sync,
    {
        self.reduce_to(parallelism_threshold, transformer, basis, reducer)
    }

    /// Returns the result of accumulating `transformer` applied to each key using
    /// `reducer`, starting from `basis`.
    pub fn reduce_keys_to_f64<T, R>(&self, parallelism_threshold: u64, transformer: T, basis: f64, reducer: R) -> f64
    where
        T: Fn(&K) -> f64 + Sync,
        R: Fn(f64, f64) -> f64 + Sync,
    {
        self.reduce_to(parallelism_threshold, |k, _| transformer(k), basis, reducer)
    }

    /// Returns the result of accumulating `transformer` applied to each value using
    /// `reducer`, starting from `basis`.
    pub fn reduce_values_to_f64<T, R>(&self, parallelism_threshold: u64, transformer: T, basis: f64, reducer: R) -> f64
    where
        T: Fn(&V) -> f64 + Sync,
        R: Fn(f64, f64) -> f64 + Sync,
    {
        self.reduce_to(parallelism_threshold, |_, v| transformer(v), basis, reducer)
    }

    /// Returns a non-`None` result of `f` applied to some key-value pair, or `None`
    /// if there is none.
    ///
    /// Once a result is found, the remaining parts of the operation stop early. If
    /// several entries match, any one of their results may be returned.
    ///
    /// # Examples
    ///
    /// ```
    /// use binmap::HashMap;
    ///
    /// let map: HashMap<u64, u64> = (0..1000).map(|i| (i, i)).collect();
    ///
    /// assert_eq!(map.search(1, |k, _| (*k == 500).then_some(*k)), Some(500));
    /// assert_eq!(map.search(1, |k, _| (*k == 5000).then_some(*k)), None);
    /// ```
    pub fn search<U, F>(&self, parallelism_threshold: u64, f: F) -> Option<U>
    where
        U: Send + Sync,
        F: Fn(&K, &V) -> Option<U> + Sync,
    {
        let result = OnceLock::new();

        self.raw.bulk(
            parallelism_threshold,
            |entries| {
                for (k, v) in entries {
                    if result.get().is_some() {
                        return;
                    }

                    if let Some(found) = f(k, v) {
                        let _ = result.set(found);
                        return;
                    }
                }
            },
            |(), ()| (),
        );

        result.into_inner()
    }

    /// Returns a non-`None` result of `f` applied to some key.
    ///
    /// See [`HashMap::search`] for details.
    pub fn search_keys<U, F>(&self, parallelism_threshold: u64, f: F) -> Option<U>
    where
        U: Send + Sync,
        F: Fn(&K) -> Option<U> + Sync,
    {
        self.search(parallelism_threshold, |k, _| f(k))
    }

    /// Returns a non-`None` result of `f` applied to some value.
    ///
    /// See [`HashMap::search`] for details.
    pub fn search_values<U, F>(&self, parallelism_threshold: u64, f: F) -> Option<U>
    where
        U: Send + Sync,
        F: Fn(&V) -> Option<U> + Sync,
    {
        self.search(parallelism_threshold, |_, v| f(v))
    }

    /// Returns a non-`None` result of `f` applied to some entry, passed as a
    /// key-value tuple.
    ///
    /// See [`HashMap::search`] for details.
    pub fn search_entries<U, F>(&self, parallelism_threshold: u64, f: F) -> Option<U>
    where
        U: Send + Sync,
        F: Fn((&K, &V)) -> Option<U> + Sync,
    {
        self.search(parallelism_threshold, |k, v| f((k, v)))
    }
}
