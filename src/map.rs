use crate::raw::{self, Action, Compute, Insert, KeyRef};
use crate::Error;
use seize::{Collector, Guard, LocalGuard, OwnedGuard};

use std::borrow::Borrow;
use std::collections::hash_map::RandomState;
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::marker::PhantomData;

/// A concurrent hash table.
///
/// Reads are lock-free. Writes lock a single bin of the table, so writes to
/// different keys rarely contend. When the table grows, every thread that touches
/// it helps move bins to the new table.
///
/// Most hash table operations require a [`Guard`](crate::Guard), which can be acquired through
/// [`HashMap::guard`] or using the [`HashMap::pin`] API. See the [crate-level documentation](crate#usage)
/// for details.
pub struct HashMap<K, V, S = RandomState> {
    pub(crate) raw: raw::HashMap<K, V, S>,
}

/// A builder for a [`HashMap`].
///
/// # Examples
///
/// ```rust
/// use binmap::HashMap;
/// use seize::Collector;
/// use std::collections::hash_map::RandomState;
///
/// let map: HashMap<i32, i32> = HashMap::builder()
///     // Set the initial capacity.
///     .capacity(2048)
///     // Set the load factor used to size the initial table.
///     .load_factor(0.5)
///     // Set the estimated number of concurrently updating threads.
///     .concurrency_level(8)
///     // Set the hasher.
///     .hasher(RandomState::new())
///     // Set a custom garbage collector.
///     .collector(Collector::new().batch_size(128))
///     // Construct the hash map.
///     .build();
/// ```
pub struct HashMapBuilder<K, V, S = RandomState> {
    hasher: S,
    capacity: usize,
    load_factor: f32,
    concurrency_level: usize,
    collector: Collector,
    key_order: Option<raw::KeyOrder<K>>,
    _kv: PhantomData<(K, V)>,
}

impl<K, V> HashMapBuilder<K, V> {
    /// Set the hash builder used to hash keys.
    ///
    /// Warning: `hash_builder` is normally randomly generated, and is designed
    /// to allow HashMaps to be resistant to attacks that cause many collisions
    /// and very poor performance. Setting it manually using this function can
    /// expose a DoS attack vector.
    pub fn hasher<S>(self, hasher: S) -> HashMapBuilder<K, V, S> {
        HashMapBuilder {
            hasher,
            capacity: self.capacity,
            load_factor: self.load_factor,
            concurrency_level: self.concurrency_level,
            collector: self.collector,
            key_order: self.key_order,
            _kv: PhantomData,
        }
    }
}

impl<K, V, S> HashMapBuilder<K, V, S> {
    /// Set the initial capacity of the map.
    ///
    /// The map should be able to hold at least `capacity` elements before resizing.
    /// However, the capacity is an estimate, and the map may prematurely resize due
    /// to poor hash distribution.
    pub fn capacity(self, capacity: usize) -> HashMapBuilder<K, V, S> {
        HashMapBuilder { capacity, ..self }
    }

    /// Set the load factor used to size the initial table.
    ///
    /// The load factor only affects the initial table length. Once the map is in use,
    /// the table grows when it is three quarters full. Must be positive.
    pub fn load_factor(self, load_factor: f32) -> HashMapBuilder<K, V, S> {
        HashMapBuilder {
            load_factor,
            ..self
        }
    }

    /// Set the estimated number of concurrently updating threads.
    ///
    /// This is used as a hint for the initial table length. Must be non-zero.
    pub fn concurrency_level(self, concurrency_level: usize) -> HashMapBuilder<K, V, S> {
        HashMapBuilder {
            concurrency_level,
            ..self
        }
    }

    /// Set the [`seize::Collector`] used for garbage collection.
    ///
    /// This method may be useful when you want more control over garbage collection.
    ///
    /// Note that all `Guard` references used to access the map must be produced by
    /// the provided `collector`.
    pub fn collector(self, collector: Collector) -> HashMapBuilder<K, V, S> {
        HashMapBuilder { collector, ..self }
    }

    /// Order keys whose hashes collide by their [`Ord`] implementation.
    ///
    /// Bins with many colliding keys are converted to balanced trees. By default,
    /// keys with equal hashes are placed by an arbitrary but stable order, and a lookup
    /// may search every key with the same hash. With ordered keys, insertions and
    /// updates through an owned key take logarithmic time even when every key shares
    /// the same hash.
    ///
    /// # Examples
    ///
    /// ```
    /// use binmap::HashMap;
    ///
    /// let map: HashMap<u64, u64> = HashMap::builder().ordered_keys().build();
    /// map.pin().insert(1, 2).unwrap();
    /// ```
    pub fn ordered_keys(self) -> HashMapBuilder<K, V, S>
    where
        K: Ord,
    {
        HashMapBuilder {
            key_order: Some(<K as Ord>::cmp),
            ..self
        }
    }

    /// Construct a [`HashMap`] from the builder, using the configured options.
    ///
    /// Returns [`Error::InvalidArgument`] if the load factor is not positive, or the
    /// concurrency level is zero.
    pub fn try_build(self) -> Result<HashMap<K, V, S>, Error> {
        if !(self.load_factor > 0.0) {
            return Err(Error::InvalidArgument("load factor must be positive"));
        }

        if self.concurrency_level == 0 {
            return Err(Error::InvalidArgument("concurrency level must be non-zero"));
        }

        let size = if self.capacity == 0 && self.concurrency_level == 1 {
            0
        } else {
            raw::HashMap::<K, V, S>::initial_size(
                self.capacity,
                self.load_factor,
                self.concurrency_level,
            )
        };

        let mut raw = raw::HashMap::new(size, self.hasher, self.collector);
        if let Some(order) = self.key_order {
            raw = raw.with_key_order(order);
        }

        Ok(HashMap { raw })
    }

    /// Construct a [`HashMap`] from the builder, using the configured options.
    ///
    /// # Panics
    ///
    /// Panics if the configuration is invalid. See [`HashMapBuilder::try_build`].
    pub fn build(self) -> HashMap<K, V, S> {
        match self.try_build() {
            Ok(map) => map,
            Err(err) => panic!("{err}"),
        }
    }
}

impl<K, V, S> fmt::Debug for HashMapBuilder<K, V, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashMapBuilder")
            .field("capacity", &self.capacity)
            .field("load_factor", &self.load_factor)
            .field("concurrency_level", &self.concurrency_level)
            .field("collector", &self.collector)
            .field("ordered_keys", &self.key_order.is_some())
            .finish()
    }
}

impl<K, V> HashMap<K, V> {
    /// Creates an empty `HashMap`.
    ///
    /// The table is not allocated until the first insertion.
    ///
    /// # Examples
    ///
    /// ```
    /// use binmap::HashMap;
    /// let map: HashMap<&str, i32> = HashMap::new();
    /// ```
    pub fn new() -> HashMap<K, V> {
        HashMap::with_capacity_and_hasher(0, RandomState::new())
    }

    /// Creates an empty `HashMap` with the specified capacity.
    ///
    /// The map should be able to hold at least `capacity` elements before resizing.
    /// However, the capacity is an estimate, and the map may prematurely resize due
    /// to poor hash distribution.
    ///
    /// # Examples
    ///
    /// ```
    /// use binmap::HashMap;
    /// let map: HashMap<&str, i32> = HashMap::with_capacity(10);
    /// ```
    pub fn with_capacity(capacity: usize) -> HashMap<K, V> {
        HashMap::with_capacity_and_hasher(capacity, RandomState::new())
    }

    /// Returns a builder for a `HashMap`.
    ///
    /// The builder can be used for more complex configuration, such as using
    /// a custom [`Collector`], or a load factor.
    pub fn builder() -> HashMapBuilder<K, V> {
        HashMapBuilder {
            capacity: 0,
            load_factor: 0.75,
            concurrency_level: 1,
            hasher: RandomState::default(),
            collector: Collector::new(),
            key_order: None,
            _kv: PhantomData,
        }
    }
}

impl<K, V, S> Default for HashMap<K, V, S>
where
    S: Default,
{
    fn default() -> Self {
        HashMap::with_hasher(S::default())
    }
}

impl<K, V, S> HashMap<K, V, S> {
    /// Creates an empty `HashMap` which will use the given hash builder to hash
    /// keys.
    ///
    /// Warning: `hash_builder` is normally randomly generated, and is designed
    /// to allow HashMaps to be resistant to attacks that cause many collisions
    /// and very poor performance. Setting it manually using this function can
    /// expose a DoS attack vector.
    ///
    /// # Examples
    ///
    /// ```
    /// use binmap::HashMap;
    /// use std::collections::hash_map::RandomState;
    ///
    /// let s = RandomState::new();
    /// let map = HashMap::with_hasher(s);
    /// map.pin().insert(1, 2).unwrap();
    /// ```
    pub fn with_hasher(hash_builder: S) -> HashMap<K, V, S> {
        HashMap::with_capacity_and_hasher(0, hash_builder)
    }

    /// Creates an empty `HashMap` with at least the specified capacity, using
    /// `hash_builder` to hash the keys.
    ///
    /// See [`HashMap::with_capacity`] and [`HashMap::with_hasher`] for details.
    ///
    /// # Examples
    ///
    /// ```
    /// use binmap::HashMap;
    /// use std::collections::hash_map::RandomState;
    ///
    /// let s = RandomState::new();
    /// let map = HashMap::with_capacity_and_hasher(10, s);
    /// map.pin().insert(1, 2).unwrap();
    /// ```
    pub fn with_capacity_and_hasher(capacity: usize, hash_builder: S) -> HashMap<K, V, S> {
        let size = if capacity == 0 {
            0
        } else {
            raw::HashMap::<K, V, S>::initial_size(capacity, 0.75, 1)
        };

        HashMap {
            raw: raw::HashMap::new(size, hash_builder, Collector::new()),
        }
    }

    /// Returns a pinned reference to the map.
    ///
    /// The returned reference manages a guard internally, preventing garbage collection
    /// for as long as it is held. See the [crate-level documentation](crate#usage) for details.
    #[inline]
    pub fn pin(&self) -> HashMapRef<'_, K, V, S, LocalGuard<'_>> {
        HashMapRef {
            guard: self.guard(),
            map: self,
        }
    }

    /// Returns a pinned reference to the map.
    ///
    /// Unlike [`HashMap::pin`], the returned reference implements `Send` and `Sync`,
    /// allowing it to be held across `.await` points in work-stealing schedulers.
    #[inline]
    pub fn pin_owned(&self) -> HashMapRef<'_, K, V, S, OwnedGuard<'_>> {
        HashMapRef {
            guard: self.owned_guard(),
            map: self,
        }
    }

    /// Returns a guard for use with this map.
    ///
    /// Note that holding on to a guard prevents garbage collection.
    /// See the [crate-level documentation](crate#usage) for details.
    #[inline]
    pub fn guard(&self) -> LocalGuard<'_> {
        self.raw.guard()
    }

    /// Returns an owned guard for use with this map.
    ///
    /// Owned guards implement `Send` and `Sync`, allowing them to be held across
    /// `.await` points in work-stealing schedulers.
    #[inline]
    pub fn owned_guard(&self) -> OwnedGuard<'_> {
        self.raw.owned_guard()
    }

    /// Returns the number of entries in the map.
    ///
    /// The count is the sum of several independently updated counters, so under
    /// concurrent modification it is an estimate.
    ///
    /// # Examples
    ///
    /// ```
    /// use binmap::HashMap;
    ///
    /// let map = HashMap::new();
    ///
    /// map.pin().insert(1, "a").unwrap();
    /// map.pin().insert(2, "b").unwrap();
    /// assert!(map.len() == 2);
    /// ```
    #[inline]
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    /// Returns `true` if the map is empty. Otherwise returns `false`.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of bins in the current table, or 0 if no table has
    /// been allocated yet.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.raw.capacity(&self.guard())
    }

    /// An iterator visiting all key-value pairs in arbitrary order.
    ///
    /// The iterator is weakly consistent. It never fails due to concurrent modification,
    /// and yields every entry that is present for the whole iteration exactly once.
    /// Entries inserted or removed concurrently may or may not be yielded.
    ///
    /// # Examples
    ///
    /// ```
    /// use binmap::HashMap;
    ///
    /// let map = HashMap::from([
    ///     ("a", 1),
    ///     ("b", 2),
    ///     ("c", 3),
    /// ]);
    ///
    /// for (key, val) in map.pin().iter() {
    ///     println!("key: {key} val: {val}");
    /// }
    /// ```
    #[inline]
    pub fn iter<'g, G>(&self, guard: &'g G) -> Iter<'g, K, V, G>
    where
        G: Guard,
    {
        self.raw.verify(guard);

        Iter {
            raw: self.raw.iter(guard),
            guard,
        }
    }

    /// An iterator visiting all keys in arbitrary order.
    ///
    /// See [`HashMap::iter`] for details.
    #[inline]
    pub fn keys<'g, G>(&self, guard: &'g G) -> Keys<'g, K, V, G>
    where
        G: Guard,
    {
        Keys {
            iter: self.iter(guard),
        }
    }

    /// An iterator visiting all values in arbitrary order.
    ///
    /// See [`HashMap::iter`] for details.
    #[inline]
    pub fn values<'g, G>(&self, guard: &'g G) -> Values<'g, K, V, G>
    where
        G: Guard,
    {
        Values {
            iter: self.iter(guard),
        }
    }
}

impl<K, V, S> HashMap<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    /// Returns `true` if the map contains a value for the specified key.
    ///
    /// The key may be any borrowed form of the map's key type, but
    /// [`Hash`] and [`Eq`] on the borrowed form *must* match those for
    /// the key type.
    ///
    /// # Examples
    ///
    /// ```
    /// use binmap::HashMap;
    ///
    /// let map = HashMap::new();
    /// map.pin().insert(1, "a").unwrap();
    /// assert_eq!(map.pin().contains_key(&1), true);
    /// assert_eq!(map.pin().contains_key(&2), false);
    /// ```
    #[inline]
    pub fn contains_key<Q>(&self, key: &Q, guard: &impl Guard) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.get(key, guard).is_some()
    }

    /// Returns a reference to the value corresponding to the key.
    ///
    /// This method never blocks.
    ///
    /// # Examples
    ///
    /// ```
    /// use binmap::HashMap;
    ///
    /// let map = HashMap::new();
    /// map.pin().insert(1, "a").unwrap();
    /// assert_eq!(map.pin().get(&1), Some(&"a"));
    /// assert_eq!(map.pin().get(&2), None);
    /// ```
    #[inline]
    pub fn get<'g, Q>(&self, key: &Q, guard: &'g impl Guard) -> Option<&'g V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.raw.verify(guard);
        self.raw.get(key, guard).map(|entry| entry.value(guard))
    }

    /// Returns the key-value pair corresponding to the supplied key.
    ///
    /// # Examples
    ///
    /// ```
    /// use binmap::HashMap;
    ///
    /// let map = HashMap::new();
    /// map.pin().insert(1, "a").unwrap();
    /// assert_eq!(map.pin().get_key_value(&1), Some((&1, &"a")));
    /// assert_eq!(map.pin().get_key_value(&2), None);
    /// ```
    #[inline]
    pub fn get_key_value<'g, Q>(&self, key: &Q, guard: &'g impl Guard) -> Option<(&'g K, &'g V)>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.raw.verify(guard);
        self.raw
            .get(key, guard)
            .map(|entry| (&entry.key, entry.value(guard)))
    }

    /// Returns the value corresponding to the key, or `default` if the key is
    /// not present.
    #[inline]
    pub fn get_or_default<'g, Q>(&self, key: &Q, default: &'g V, guard: &'g impl Guard) -> &'g V
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.get(key, guard).unwrap_or(default)
    }

    /// Returns `true` if any key in the map maps to `value`.
    ///
    /// This requires a traversal of the entire map.
    pub fn contains_value(&self, value: &V, guard: &impl Guard) -> bool
    where
        V: PartialEq,
    {
        self.iter(guard).any(|(_, v)| v == value)
    }

    /// Inserts a key-value pair into the map.
    ///
    /// If the map did not have this key present, `None` is returned. If the map
    /// did have this key present, the value is updated, and the old value is returned.
    /// The key is not updated, though; this matters for types that can be `==`
    /// without being identical.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RecursiveUpdate`] when called from inside a compute callback
    /// for a key in the same bin, and [`Error::AllocationFailed`] if the first table
    /// could not be allocated.
    ///
    /// # Examples
    ///
    /// ```
    /// use binmap::HashMap;
    ///
    /// let map = HashMap::new();
    /// assert_eq!(map.pin().insert(37, "a").unwrap(), None);
    /// assert_eq!(map.pin().is_empty(), false);
    ///
    /// map.pin().insert(37, "b").unwrap();
    /// assert_eq!(map.pin().insert(37, "c").unwrap(), Some(&"b"));
    /// assert_eq!(map.pin().get(&37), Some(&"c"));
    /// ```
    #[inline]
    pub fn insert<'g>(&self, key: K, value: V, guard: &'g impl Guard) -> Result<Option<&'g V>, Error>
    where
        K: 'g,
    {
        self.raw.verify(guard);

        match self.raw.insert(key, value, true, guard)? {
            Insert::Inserted => Ok(None),
            Insert::Replaced(old) | Insert::Present(old) => Ok(Some(old)),
        }
    }

    /// Inserts a key-value pair into the map if the key is not already present.
    ///
    /// Returns `None` if the pair was inserted. Otherwise returns the current value,
    /// leaving the map unchanged.
    ///
    /// # Examples
    ///
    /// ```
    /// use binmap::HashMap;
    ///
    /// let map = HashMap::new();
    /// let map = map.pin();
    ///
    /// assert_eq!(map.insert_if_absent(37, "a").unwrap(), None);
    /// assert_eq!(map.insert_if_absent(37, "b").unwrap(), Some(&"a"));
    /// assert_eq!(map.get(&37), Some(&"a"));
    /// ```
    #[inline]
    pub fn insert_if_absent<'g>(
        &self,
        key: K,
        value: V,
        guard: &'g impl Guard,
    ) -> Result<Option<&'g V>, Error>
    where
        K: 'g,
    {
        self.raw.verify(guard);

        match self.raw.insert(key, value, false, guard)? {
            Insert::Inserted => Ok(None),
            Insert::Present(current) | Insert::Replaced(current) => Ok(Some(current)),
        }
    }

    /// Removes a key from the map, returning the value at the key if the key
    /// was previously in the map.
    ///
    /// # Examples
    ///
    /// ```
    /// use binmap::HashMap;
    ///
    /// let map = HashMap::new();
    /// map.pin().insert(1, "a").unwrap();
    /// assert_eq!(map.pin().remove(&1).unwrap(), Some(&"a"));
    /// assert_eq!(map.pin().remove(&1).unwrap(), None);
    /// ```
    #[inline]
    pub fn remove<'g, Q>(&self, key: &Q, guard: &'g impl Guard) -> Result<Option<&'g V>, Error>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.remove_if(key, |_, _| true, guard)
    }

    /// Removes a key from the map if `f` returns `true` for its current value.
    ///
    /// `f` is called at most once, with the bin locked, so the check and removal are
    /// atomic. Returns the removed value.
    pub fn remove_if<'g, Q, F>(&self, key: &Q, f: F, guard: &'g impl Guard) -> Result<Option<&'g V>, Error>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        F: FnOnce(&K, &V) -> bool,
    {
        self.raw.verify(guard);

        let hash = self.raw.hash(key);
        let result = self.raw.compute(
            hash,
            KeyRef::Borrowed(key),
            |key, current| match current {
                Some(value) => {
                    if f(key, value) {
                        Action::Remove
                    } else {
                        Action::Keep
                    }
                }
                None => Action::Keep,
            },
            guard,
        )?;

        match result {
            Compute::Removed(old) => Ok(Some(old)),
            _ => Ok(None),
        }
    }

    /// Removes a key from the map only if it is currently mapped to `value`.
    ///
    /// Returns `true` if the entry was removed.
    #[inline]
    pub fn remove_value<Q>(&self, key: &Q, value: &V, guard: &impl Guard) -> Result<bool, Error>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: PartialEq,
    {
        self.remove_if(key, |_, current| current == value, guard)
            .map(|removed| removed.is_some())
    }

    /// Replaces the value of a key only if it is present, returning the previous value.
    ///
    /// # Examples
    ///
    /// ```
    /// use binmap::HashMap;
    ///
    /// let map = HashMap::new();
    /// let map = map.pin();
    ///
    /// assert_eq!(map.replace(&1, "a").unwrap(), None);
    /// assert_eq!(map.get(&1), None);
    ///
    /// map.insert(1, "a").unwrap();
    /// assert_eq!(map.replace(&1, "b").unwrap(), Some(&"a"));
    /// assert_eq!(map.get(&1), Some(&"b"));
    /// ```
    pub fn replace<'g, Q>(&self, key: &Q, value: V, guard: &'g impl Guard) -> Result<Option<&'g V>, Error>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.raw.verify(guard);

        let hash = self.raw.hash(key);
        let result = self
            .raw
            .compute(hash, KeyRef::Borrowed(key), |_, _| Action::Set(value), guard)?;

        match result {
            Compute::Updated { old, .. } => Ok(Some(old)),
            _ => Ok(None),
        }
    }

    /// Replaces the value of a key only if it is currently mapped to `old`.
    ///
    /// Returns `true` if the value was replaced.
    pub fn replace_value<Q>(&self, key: &Q, old: &V, new: V, guard: &impl Guard) -> Result<bool, Error>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: PartialEq,
    {
        self.raw.verify(guard);

        let hash = self.raw.hash(key);
        let result = self.raw.compute(
            hash,
            KeyRef::Borrowed(key),
            |_, current| match current {
                Some(current) if current == old => Action::Set(new),
                _ => Action::Keep,
            },
            guard,
        )?;

        Ok(matches!(result, Compute::Updated { .. }))
    }

    /// Returns the value for `key`, computing and inserting it with `f` if the key
    /// is absent.
    ///
    /// `f` is called at most once. While it runs, other updates to keys in the same
    /// bin wait for it to complete, so `f` should be short and must not update the map
    /// itself. If `f` returns `None`, nothing is inserted and `None` is returned.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RecursiveUpdate`] if `f` attempts to update the bin it is
    /// computing.
    ///
    /// # Examples
    ///
    /// ```
    /// use binmap::HashMap;
    ///
    /// let map = HashMap::new();
    /// let map = map.pin();
    ///
    /// assert_eq!(map.compute_if_absent("a", |_| Some(1)).unwrap(), Some(&1));
    /// assert_eq!(map.compute_if_absent("a", |_| Some(2)).unwrap(), Some(&1));
    /// assert_eq!(map.compute_if_absent("b", |_| None).unwrap(), None);
    /// assert_eq!(map.len(), 1);
    /// ```
    pub fn compute_if_absent<'g, F>(&self, key: K, f: F, guard: &'g impl Guard) -> Result<Option<&'g V>, Error>
    where
        F: FnOnce(&K) -> Option<V>,
    {
        // Avoid locking the bin if the key is already present.
        if let Some(value) = self.get(&key, guard) {
            return Ok(Some(value));
        }

        let hash = self.raw.hash(&key);
        let result = self.raw.compute(
            hash,
            KeyRef::<K, K>::Owned(key),
            |key, current| match current {
                Some(_) => Action::Keep,
                None => match f(key) {
                    Some(value) => Action::Set(value),
                    None => Action::Keep,
                },
            },
            guard,
        )?;

        match result {
            Compute::Unchanged(value) | Compute::Inserted(value) => Ok(Some(value)),
            _ => Ok(None),
        }
    }

    /// Computes a new value for a key only if it is present.
    ///
    /// If `f` returns `None`, the entry is removed. Returns the new value, if any.
    ///
    /// # Examples
    ///
    /// ```
    /// use binmap::HashMap;
    ///
    /// let map = HashMap::new();
    /// let map = map.pin();
    ///
    /// map.insert("a", 1).unwrap();
    /// assert_eq!(map.compute_if_present("a", |_, v| Some(v + 1)).unwrap(), Some(&2));
    /// assert_eq!(map.compute_if_present("a", |_, _| None).unwrap(), None);
    /// assert_eq!(map.get("a"), None);
    /// ```
    pub fn compute_if_present<'g, Q, F>(&self, key: &Q, f: F, guard: &'g impl Guard) -> Result<Option<&'g V>, Error>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        F: FnOnce(&K, &V) -> Option<V>,
    {
        self.raw.verify(guard);

        let hash = self.raw.hash(key);
        let result = self.raw.compute(
            hash,
            KeyRef::Borrowed(key),
            |key, current| match current {
                Some(value) => match f(key, value) {
                    Some(value) => Action::Set(value),
                    None => Action::Remove,
                },
                None => Action::Keep,
            },
            guard,
        )?;

        match result {
            Compute::Updated { new, .. } => Ok(Some(new)),
            _ => Ok(None),
        }
    }

    /// Computes a new mapping for a key from its current value, if any.
    ///
    /// If `f` returns `None`, any existing entry is removed. Returns the new value, if any.
    ///
    /// # Examples
    ///
    /// ```
    /// use binmap::HashMap;
    ///
    /// let map = HashMap::new();
    /// let map = map.pin();
    ///
    /// assert_eq!(map.compute("a", |_, v| Some(v.map_or(1, |v| v + 1))).unwrap(), Some(&1));
    /// assert_eq!(map.compute("a", |_, v| Some(v.map_or(1, |v| v + 1))).unwrap(), Some(&2));
    /// assert_eq!(map.compute("a", |_, _| None).unwrap(), None);
    /// assert!(map.is_empty());
    /// ```
    pub fn compute<'g, F>(&self, key: K, f: F, guard: &'g impl Guard) -> Result<Option<&'g V>, Error>
    where
        F: FnOnce(&K, Option<&V>) -> Option<V>,
    {
        self.raw.verify(guard);

        let hash = self.raw.hash(&key);
        let result = self.raw.compute(
            hash,
            KeyRef::<K, K>::Owned(key),
            |key, current| match f(key, current) {
                Some(value) => Action::Set(value),
                None => Action::Remove,
            },
            guard,
        )?;

        match result {
            Compute::Inserted(value) | Compute::Updated { new: value, .. } => Ok(Some(value)),
            _ => Ok(None),
        }
    }

    /// Inserts `value` if the key is absent, otherwise replaces the current value
    /// with the result of `f(current, value)`.
    ///
    /// If `f` returns `None`, the entry is removed. Returns the new value, if any.
    ///
    /// # Examples
    ///
    /// ```
    /// use binmap::HashMap;
    ///
    /// let map = HashMap::new();
    /// let map = map.pin();
    ///
    /// assert_eq!(map.merge("a", 1, |old, new| Some(old + new)).unwrap(), Some(&1));
    /// assert_eq!(map.merge("a", 2, |old, new| Some(old + new)).unwrap(), Some(&3));
    /// assert_eq!(map.merge("a", 0, |_, _| None).unwrap(), None);
    /// ```
    pub fn merge<'g, F>(&self, key: K, value: V, f: F, guard: &'g impl Guard) -> Result<Option<&'g V>, Error>
    where
        F: FnOnce(&V, V) -> Option<V>,
    {
        self.raw.verify(guard);

        let hash = self.raw.hash(&key);
        let result = self.raw.compute(
            hash,
            KeyRef::<K, K>::Owned(key),
            |_, current| match current {
                None => Action::Set(value),
                Some(old) => match f(old, value) {
                    Some(value) => Action::Set(value),
                    None => Action::Remove,
                },
            },
            guard,
        )?;

        match result {
            Compute::Inserted(value) | Compute::Updated { new: value, .. } => Ok(Some(value)),
            _ => Ok(None),
        }
    }

    /// Tries to reserve capacity for `additional` more elements to be inserted
    /// in the `HashMap`.
    ///
    /// If a resize is already in progress, this method returns immediately.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CapacityOverflow`] if the map would need to hold more entries
    /// than the largest table, 2<sup>30</sup> bins, is sized for. Nothing is allocated in
    /// that case. Returns [`Error::AllocationFailed`] if the table could not be allocated.
    /// The map is left valid at its previous size in either case.
    pub fn try_reserve(&self, additional: usize, guard: &impl Guard) -> Result<(), Error> {
        self.raw.verify(guard);
        self.raw.reserve(additional, guard)
    }

    /// Reserves capacity for `additional` more elements to be inserted in the `HashMap`.
    ///
    /// Allocation failures leave the map at its current size. See [`HashMap::try_reserve`]
    /// to observe them.
    ///
    /// # Panics
    ///
    /// Panics if the new capacity exceeds the largest table. See [`HashMap::try_reserve`].
    ///
    /// # Examples
    ///
    /// ```
    /// use binmap::HashMap;
    ///
    /// let map: HashMap<&str, i32> = HashMap::new();
    /// map.pin().reserve(10);
    /// assert!(map.capacity() >= 16);
    /// ```
    pub fn reserve(&self, additional: usize, guard: &impl Guard) {
        if let Err(Error::CapacityOverflow) = self.try_reserve(additional, guard) {
            panic!("capacity overflow");
        }
    }

    /// Inserts every pair from `iter` into the map, reserving space up front.
    ///
    /// Stops at the first error, including a failure to reserve space for the
    /// iterator's lower size bound.
    pub fn put_all<T>(&self, iter: T, guard: &impl Guard) -> Result<(), Error>
    where
        T: IntoIterator<Item = (K, V)>,
    {
        let iter = iter.into_iter();
        self.try_reserve(iter.size_hint().0, guard)?;

        for (key, value) in iter {
            self.insert(key, value, guard)?;
        }

        Ok(())
    }

    /// Clears the map, removing all key-value pairs.
    ///
    /// Each bin is cleared atomically, but the map as a whole is not. Entries
    /// inserted concurrently may remain.
    ///
    /// # Examples
    ///
    /// ```
    /// use binmap::HashMap;
    ///
    /// let map = HashMap::new();
    ///
    /// map.pin().insert(1, "a").unwrap();
    /// map.pin().clear().unwrap();
    /// assert!(map.pin().is_empty());
    /// ```
    pub fn clear(&self, guard: &impl Guard) -> Result<(), Error> {
        self.raw.verify(guard);
        self.raw.clear(guard)
    }

    /// Retains only the elements specified by the predicate.
    ///
    /// In other words, remove all pairs `(k, v)` for which `f(&k, &v)` returns `false`.
    /// The elements are visited in unsorted (and unspecified) order.
    ///
    /// Note the function may be called more than once for a given key if its value is
    /// concurrently modified during removal.
    ///
    /// # Examples
    ///
    /// ```
    /// use binmap::HashMap;
    ///
    /// let map: HashMap<i32, i32> = (0..8).map(|x| (x, x * 10)).collect();
    /// map.pin().retain(|&k, _| k % 2 == 0).unwrap();
    /// assert_eq!(map.len(), 4);
    /// ```
    pub fn retain<F>(&self, f: F, guard: &impl Guard) -> Result<(), Error>
    where
        F: FnMut(&K, &V) -> bool,
    {
        self.raw.verify(guard);
        self.raw.retain(f, guard)
    }

    /// Replaces every value with the result of `f(&k, &v)`.
    ///
    /// Each replacement is atomic. If a value is concurrently modified, `f` is called
    /// again with the new value.
    ///
    /// # Examples
    ///
    /// ```
    /// use binmap::HashMap;
    ///
    /// let map: HashMap<i32, i32> = (0..8).map(|x| (x, x)).collect();
    /// map.pin().replace_all(|_, v| v * 2).unwrap();
    /// assert_eq!(map.pin().get(&3), Some(&6));
    /// ```
    pub fn replace_all<F>(&self, f: F, guard: &impl Guard) -> Result<(), Error>
    where
        F: FnMut(&K, &V) -> V,
    {
        self.raw.verify(guard);
        self.raw.replace_all(f, guard)
    }
}

// Panics with the given error for trait implementations that cannot return one.
//
// Outside of compute callbacks, insertions only fail if a table cannot be allocated.
#[cold]
#[inline(never)]
fn insert_failed(err: Error) -> ! {
    panic!("{err}")
}

impl<K, V, S> PartialEq for HashMap<K, V, S>
where
    K: Hash + Eq,
    V: PartialEq,
    S: BuildHasher,
{
    fn eq(&self, other: &Self) -> bool {
        if self.len() != other.len() {
            return false;
        }

        let (guard1, guard2) = (&self.guard(), &other.guard());

        let mut iter = self.iter(guard1);
        iter.all(|(key, value)| other.get(key, guard2).map_or(false, |v| *value == *v))
    }
}

impl<K, V, S> Eq for HashMap<K, V, S>
where
    K: Hash + Eq,
    V: Eq,
    S: BuildHasher,
{
}

impl<K, V, S> fmt::Debug for HashMap<K, V, S>
where
    K: fmt::Debug,
    V: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.guard();
        f.debug_map().entries(self.iter(&guard)).finish()
    }
}

impl<K, V, S> Extend<(K, V)> for &HashMap<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    fn extend<T: IntoIterator<Item = (K, V)>>(&mut self, iter: T) {
        // from `hashbrown::HashMap::extend`:
        // Keys may be already present or show multiple times in the iterator.
        // Reserve the entire hint lower bound if the map is empty.
        // Otherwise reserve half the hint (rounded up), so the map
        // will only resize twice in the worst case.
        let iter = iter.into_iter();
        let reserve = if self.is_empty() {
            iter.size_hint().0
        } else {
            (iter.size_hint().0 + 1) / 2
        };

        let guard = self.guard();
        self.reserve(reserve, &guard);

        for (key, value) in iter {
            if let Err(err) = self.insert(key, value, &guard) {
                insert_failed(err);
            }
        }
    }
}

impl<K, V, S> Extend<(K, V)> for HashMap<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    fn extend<T: IntoIterator<Item = (K, V)>>(&mut self, iter: T) {
        let mut map: &HashMap<K, V, S> = self;
        map.extend(iter)
    }
}

impl<K, V, const N: usize> From<[(K, V); N]> for HashMap<K, V, RandomState>
where
    K: Hash + Eq,
{
    fn from(arr: [(K, V); N]) -> Self {
        HashMap::from_iter(arr)
    }
}

impl<K, V, S> FromIterator<(K, V)> for HashMap<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher + Default,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let iter = iter.into_iter();
        let (lower, _) = iter.size_hint();

        let map = HashMap::with_capacity_and_hasher(lower, S::default());

        {
            let map = map.pin();
            for (key, value) in iter {
                if let Err(err) = map.insert(key, value) {
                    insert_failed(err);
                }
            }
        }

        map
    }
}

impl<K, V, S> Clone for HashMap<K, V, S>
where
    K: Clone + Hash + Eq,
    V: Clone,
    S: BuildHasher + Clone,
{
    fn clone(&self) -> HashMap<K, V, S> {
        let mut other = HashMap::with_capacity_and_hasher(self.len(), self.raw.hasher.clone());
        if let Some(order) = self.raw.key_order() {
            other.raw = other.raw.with_key_order(order);
        }

        {
            let (guard1, guard2) = (&self.guard(), &other.guard());
            for (key, value) in self.iter(guard1) {
                if let Err(err) = other.insert(key.clone(), value.clone(), guard2) {
                    insert_failed(err);
                }
            }
        }

        other
    }
}

/// A pinned reference to a [`HashMap`].
///
/// This type is created with [`HashMap::pin`] and can be used to easily access a [`HashMap`]
/// without explicitly managing a guard. See the [crate-level documentation](crate#usage) for details.
pub struct HashMapRef<'map, K, V, S, G> {
    guard: G,
    map: &'map HashMap<K, V, S>,
}

impl<'map, K, V, S, G> HashMapRef<'map, K, V, S, G>
where
    K: Hash + Eq,
    S: BuildHasher,
    G: Guard,
{
    /// Returns a reference to the inner [`HashMap`].
    #[inline]
    pub fn map(&self) -> &'map HashMap<K, V, S> {
        self.map
    }

    /// Returns the number of entries in the map.
    ///
    /// See [`HashMap::len`] for details.
    #[inline]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns `true` if the map is empty. Otherwise returns `false`.
    ///
    /// See [`HashMap::is_empty`] for details.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of bins in the current table.
    ///
    /// See [`HashMap::capacity`] for details.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.map.raw.capacity(&self.guard)
    }

    /// Returns `true` if the map contains a value for the specified key.
    ///
    /// See [`HashMap::contains_key`] for details.
    #[inline]
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.get(key).is_some()
    }

    /// Returns `true` if any key maps to `value`.
    ///
    /// See [`HashMap::contains_value`] for details.
    #[inline]
    pub fn contains_value(&self, value: &V) -> bool
    where
        V: PartialEq,
    {
        self.map.contains_value(value, &self.guard)
    }

    /// Returns a reference to the value corresponding to the key.
    ///
    /// See [`HashMap::get`] for details.
    #[inline]
    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.map.get(key, &self.guard)
    }

    /// Returns the key-value pair corresponding to the supplied key.
    ///
    /// See [`HashMap::get_key_value`] for details.
    #[inline]
    pub fn get_key_value<Q>(&self, key: &Q) -> Option<(&K, &V)>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.map.get_key_value(key, &self.guard)
    }

    /// Returns the value corresponding to the key, or `default`.
    ///
    /// See [`HashMap::get_or_default`] for details.
    #[inline]
    pub fn get_or_default<'a, Q>(&'a self, key: &Q, default: &'a V) -> &'a V
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.map.get_or_default(key, default, &self.guard)
    }

    /// Inserts a key-value pair into the map.
    ///
    /// See [`HashMap::insert`] for details.
    #[inline]
    pub fn insert(&self, key: K, value: V) -> Result<Option<&V>, Error> {
        self.map.insert(key, value, &self.guard)
    }

    /// Inserts a key-value pair if the key is absent.
    ///
    /// See [`HashMap::insert_if_absent`] for details.
    #[inline]
    pub fn insert_if_absent(&self, key: K, value: V) -> Result<Option<&V>, Error> {
        self.map.insert_if_absent(key, value, &self.guard)
    }

    /// Removes a key from the map.
    ///
    /// See [`HashMap::remove`] for details.
    #[inline]
    pub fn remove<Q>(&self, key: &Q) -> Result<Option<&V>, Error>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.map.remove(key, &self.guard)
    }

    /// Removes a key from the map if `f` returns `true`.
    ///
    /// See [`HashMap::remove_if`] for details.
    #[inline]
    pub fn remove_if<Q, F>(&self, key: &Q, f: F) -> Result<Option<&V>, Error>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        F: FnOnce(&K, &V) -> bool,
    {
        self.map.remove_if(key, f, &self.guard)
    }

    /// Removes a key from the map if it is mapped to `value`.
    ///
    /// See [`HashMap::remove_value`] for details.
    #[inline]
    pub fn remove_value<Q>(&self, key: &Q, value: &V) -> Result<bool, Error>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: PartialEq,
    {
        self.map.remove_value(key, value, &self.guard)
    }

    /// Replaces the value of a key if it is present.
    ///
    /// See [`HashMap::replace`] for details.
    #[inline]
    pub fn replace<Q>(&self, key: &Q, value: V) -> Result<Option<&V>, Error>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.map.replace(key, value, &self.guard)
    }

    /// Replaces the value of a key if it is mapped to `old`.
    ///
    /// See [`HashMap::replace_value`] for details.
    #[inline]
    pub fn replace_value<Q>(&self, key: &Q, old: &V, new: V) -> Result<bool, Error>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: PartialEq,
    {
        self.map.replace_value(key, old, new, &self.guard)
    }

    /// Returns the value for `key`, inserting the result of `f` if absent.
    ///
    /// See [`HashMap::compute_if_absent`] for details.
    #[inline]
    pub fn compute_if_absent<F>(&self, key: K, f: F) -> Result<Option<&V>, Error>
    where
        F: FnOnce(&K) -> Option<V>,
    {
        self.map.compute_if_absent(key, f, &self.guard)
    }

    /// Computes a new value for a key if it is present.
    ///
    /// See [`HashMap::compute_if_present`] for details.
    #[inline]
    pub fn compute_if_present<Q, F>(&self, key: &Q, f: F) -> Result<Option<&V>, Error>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        F: FnOnce(&K, &V) -> Option<V>,
    {
        self.map.compute_if_present(key, f, &self.guard)
    }

    /// Computes a new mapping for a key.
    ///
    /// See [`HashMap::compute`] for details.
    #[inline]
    pub fn compute<F>(&self, key: K, f: F) -> Result<Option<&V>, Error>
    where
        F: FnOnce(&K, Option<&V>) -> Option<V>,
    {
        self.map.compute(key, f, &self.guard)
    }

    /// Merges a value into the map.
    ///
    /// See [`HashMap::merge`] for details.
    #[inline]
    pub fn merge<F>(&self, key: K, value: V, f: F) -> Result<Option<&V>, Error>
    where
        F: FnOnce(&V, V) -> Option<V>,
    {
        self.map.merge(key, value, f, &self.guard)
    }

    /// Tries to reserve capacity for `additional` more elements.
    ///
    /// See [`HashMap::try_reserve`] for details.
    #[inline]
    pub fn try_reserve(&self, additional: usize) -> Result<(), Error> {
        self.map.try_reserve(additional, &self.guard)
    }

    /// Reserves capacity for `additional` more elements.
    ///
    /// See [`HashMap::reserve`] for details.
    #[inline]
    pub fn reserve(&self, additional: usize) {
        self.map.reserve(additional, &self.guard)
    }

    /// Inserts every pair from `iter`.
    ///
    /// See [`HashMap::put_all`] for details.
    #[inline]
    pub fn put_all<T>(&self, iter: T) -> Result<(), Error>
    where
        T: IntoIterator<Item = (K, V)>,
    {
        self.map.put_all(iter, &self.guard)
    }

    /// Clears the map, removing all values.
    ///
    /// See [`HashMap::clear`] for details.
    #[inline]
    pub fn clear(&self) -> Result<(), Error> {
        self.map.clear(&self.guard)
    }

    /// Retains only the elements specified by the predicate.
    ///
    /// See [`HashMap::retain`] for details.
    #[inline]
    pub fn retain<F>(&self, f: F) -> Result<(), Error>
    where
        F: FnMut(&K, &V) -> bool,
    {
        self.map.retain(f, &self.guard)
    }

    /// Replaces every value with the result of `f`.
    ///
    /// See [`HashMap::replace_all`] for details.
    #[inline]
    pub fn replace_all<F>(&self, f: F) -> Result<(), Error>
    where
        F: FnMut(&K, &V) -> V,
    {
        self.map.replace_all(f, &self.guard)
    }

    /// An iterator visiting all key-value pairs in arbitrary order.
    ///
    /// See [`HashMap::iter`] for details.
    #[inline]
    pub fn iter(&self) -> Iter<'_, K, V, G> {
        self.map.iter(&self.guard)
    }

    /// An iterator visiting all keys in arbitrary order.
    ///
    /// See [`HashMap::keys`] for details.
    #[inline]
    pub fn keys(&self) -> Keys<'_, K, V, G> {
        self.map.keys(&self.guard)
    }

    /// An iterator visiting all values in arbitrary order.
    ///
    /// See [`HashMap::values`] for details.
    #[inline]
    pub fn values(&self) -> Values<'_, K, V, G> {
        self.map.values(&self.guard)
    }
}

impl<K, V, S, G> fmt::Debug for HashMapRef<'_, K, V, S, G>
where
    K: fmt::Debug,
    V: fmt::Debug,
    G: Guard,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.map.iter(&self.guard)).finish()
    }
}

impl<'a, K, V, S, G> IntoIterator for &'a HashMapRef<'_, K, V, S, G>
where
    G: Guard,
{
    type Item = (&'a K, &'a V);
    type IntoIter = Iter<'a, K, V, G>;

    fn into_iter(self) -> Self::IntoIter {
        self.map.iter(&self.guard)
    }
}

/// An iterator over a map's entries.
///
/// This struct is created by the [`iter`](HashMap::iter) method on [`HashMap`]. See its documentation for details.
pub struct Iter<'g, K, V, G> {
    raw: raw::Traverser<'g, K, V, G>,
    guard: &'g G,
}

impl<'g, K: 'g, V: 'g, G> Iterator for Iter<'g, K, V, G>
where
    G: Guard,
{
    type Item = (&'g K, &'g V);

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.raw.next()?;
        Some((&entry.key, entry.value(self.guard)))
    }
}

impl<K, V, G> fmt::Debug for Iter<'_, K, V, G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Iter").finish_non_exhaustive()
    }
}

/// An iterator over a map's keys.
///
/// This struct is created by the [`keys`](HashMap::keys) method on [`HashMap`]. See its documentation for details.
pub struct Keys<'g, K, V, G> {
    iter: Iter<'g, K, V, G>,
}

impl<'g, K: 'g, V: 'g, G> Iterator for Keys<'g, K, V, G>
where
    G: Guard,
{
    type Item = &'g K;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        let (key, _) = self.iter.next()?;
        Some(key)
    }
}

impl<K, V, G> fmt::Debug for Keys<'_, K, V, G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keys").finish_non_exhaustive()
    }
}

/// An iterator over a map's values.
///
/// This struct is created by the [`values`](HashMap::values) method on [`HashMap`]. See its documentation for details.
pub struct Values<'g, K, V, G> {
    iter: Iter<'g, K, V, G>,
}

impl<'g, K: 'g, V: 'g, G> Iterator for Values<'g, K, V, G>
where
    G: Guard,
{
    type Item = &'g V;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        let (_, value) = self.iter.next()?;
        Some(value)
    }
}

impl<K, V, G> fmt::Debug for Values<'_, K, V, G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Values").finish_non_exhaustive()
    }
}
