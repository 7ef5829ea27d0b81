mod bulk;
mod iter;
mod lock;
mod node;
mod resize;
mod table;
mod tree;
mod utils;

use std::borrow::Borrow;
use std::hash::{BuildHasher, Hash};
use std::ptr;
use std::sync::atomic::{AtomicIsize, AtomicPtr, Ordering};

use seize::{Collector, Guard, LocalGuard, OwnedGuard};

use self::lock::Computing;
use self::node::{reclaim_entry, reclaim_node, Chain, Entry, Node};
use self::table::{Bin, RawTable};
use self::tree::{reclaim_tree_bin, TreeBin, TREEIFY_THRESHOLD, UNTREEIFY_THRESHOLD};
use self::utils::{debug, trace, Counter};
use crate::Error;

pub use self::iter::Traverser;
pub use self::tree::KeyOrder;

/// The largest possible table length.
pub const MAXIMUM_CAPACITY: usize = 1 << 30;

/// The table length used when no capacity is configured.
pub const DEFAULT_CAPACITY: usize = 16;

// A concurrent hash map with lock-free reads and per-bin locking.
pub struct HashMap<K, V, S> {
    // The current table, lazily allocated.
    table: AtomicPtr<RawTable<K, V>>,

    // The next table, only non-null while resizing.
    next_table: AtomicPtr<RawTable<K, V>>,

    // The next table index (plus one) to claim while resizing.
    transfer_index: AtomicIsize,

    // Table initialization and resizing control.
    //
    // When negative, the table is being initialized (-1) or resized, in which case the
    // high bits hold the resize stamp of the table length and the low bits hold one
    // plus the number of active resizers. Otherwise, when the table is null this holds
    // the initial table length to use, or 0 for the default. After initialization it
    // holds the element count at which to resize next.
    size_ctl: AtomicIsize,

    // The number of entries in the map.
    count: Counter,

    // Collector for memory reclamation.
    collector: Collector,

    // Orders colliding keys in tree bins.
    key_order: Option<KeyOrder<K>>,

    pub hasher: S,
}

// Safety: Keys and values may be inserted on one thread and dropped on another,
// and are shared across threads through `&HashMap`.
unsafe impl<K: Send, V: Send, S: Send> Send for HashMap<K, V, S> {}
unsafe impl<K: Send + Sync, V: Send + Sync, S: Sync> Sync for HashMap<K, V, S> {}

// The owner of a key passed to a compute operation.
pub enum KeyRef<'a, K, Q: ?Sized> {
    // The key may be inserted if absent.
    Owned(K),

    // Only existing mappings are considered.
    Borrowed(&'a Q),
}

impl<K, Q: ?Sized> KeyRef<'_, K, Q>
where
    K: Borrow<Q>,
{
    #[inline]
    fn get(&self) -> &Q {
        match self {
            KeyRef::Owned(key) => key.borrow(),
            KeyRef::Borrowed(key) => key,
        }
    }
}

// The action chosen by a compute callback.
pub enum Action<V> {
    // Leave the mapping as is.
    Keep,

    // Insert or replace the value.
    Set(V),

    // Remove the mapping, if any.
    Remove,
}

// The result of a compute operation.
#[derive(Debug, PartialEq, Eq)]
pub enum Compute<'g, V> {
    // There is no mapping for the key.
    Absent,

    // The existing value was kept.
    Unchanged(&'g V),

    // A new mapping was inserted.
    Inserted(&'g V),

    // The value was replaced.
    Updated { old: &'g V, new: &'g V },

    // The mapping was removed.
    Removed(&'g V),
}

// The result of an insert operation.
#[derive(Debug, PartialEq, Eq)]
pub enum Insert<'g, V> {
    // A new mapping was inserted.
    Inserted,

    // The value of an existing mapping was replaced.
    Replaced(&'g V),

    // The key was present and was left unchanged.
    Present(&'g V),
}

impl<K, V, S> HashMap<K, V, S> {
    // Creates a new map.
    //
    // `size_ctl` is the initial table length, or 0 for the default.
    pub fn new(size_ctl: usize, hasher: S, collector: Collector) -> HashMap<K, V, S> {
        HashMap {
            table: AtomicPtr::new(ptr::null_mut()),
            next_table: AtomicPtr::new(ptr::null_mut()),
            transfer_index: AtomicIsize::new(0),
            size_ctl: AtomicIsize::new(size_ctl as isize),
            count: Counter::default(),
            collector,
            key_order: None,
            hasher,
        }
    }

    // Orders keys with colliding hashes by `order` once their bin is treeified.
    pub fn with_key_order(mut self, order: KeyOrder<K>) -> HashMap<K, V, S> {
        self.key_order = Some(order);
        self
    }

    #[inline]
    pub fn key_order(&self) -> Option<KeyOrder<K>> {
        self.key_order
    }

    // Returns the initial table length for a map expected to hold `capacity` entries.
    pub fn initial_size(capacity: usize, load_factor: f32, concurrency_level: usize) -> usize {
        let capacity = capacity.max(concurrency_level);
        let size = 1.0 + (capacity as f64) / (load_factor as f64);

        if size >= MAXIMUM_CAPACITY as f64 {
            MAXIMUM_CAPACITY
        } else {
            utils::table_size_for(size as usize, MAXIMUM_CAPACITY)
        }
    }

    // Returns a guard for this collector.
    #[inline]
    pub fn guard(&self) -> LocalGuard<'_> {
        self.collector.enter()
    }

    // Returns an owned guard for this collector.
    #[inline]
    pub fn owned_guard(&self) -> OwnedGuard<'_> {
        self.collector.enter_owned()
    }

    // Verify a guard is valid to use with this map.
    #[inline]
    pub fn verify(&self, guard: &impl Guard) {
        assert_eq!(
            *guard.collector(),
            self.collector,
            "Attempted to access map with incorrect guard"
        );
    }

    #[inline]
    pub fn collector(&self) -> &Collector {
        &self.collector
    }

    // Returns the number of entries in the map.
    #[inline]
    pub fn len(&self) -> usize {
        self.count.sum()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Returns the current table length, or 0 if no table has been allocated.
    #[inline]
    pub fn capacity(&self, guard: &impl Guard) -> usize {
        let table = self.root(guard);
        if table.is_null() {
            0
        } else {
            // Safety: The table was loaded through our guard.
            unsafe { (*table).len() }
        }
    }

    // Loads the root table.
    #[inline]
    fn root(&self, guard: &impl Guard) -> *mut RawTable<K, V> {
        guard.protect(&self.table, Ordering::Acquire)
    }

    // A unique identifier for this map.
    #[inline]
    fn id(&self) -> usize {
        self as *const Self as usize
    }

    // Returns a traverser over every entry in the map.
    pub fn iter<'g, G: Guard>(&self, guard: &'g G) -> Traverser<'g, K, V, G> {
        let table = self.root(guard);
        let len = if table.is_null() {
            0
        } else {
            // Safety: The table was loaded through our guard.
            unsafe { (*table).len() }
        };

        // Safety: The table was loaded through our guard.
        unsafe { Traverser::new(table, len, 0, len, guard) }
    }
}

impl<K, V, S> HashMap<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    #[inline]
    pub fn hash<Q>(&self, key: &Q) -> u64
    where
        Q: Hash + ?Sized,
    {
        self.hasher.hash_one(key)
    }

    // Returns the entry for the given key.
    #[inline]
    pub fn get<'g, Q>(&self, key: &Q, guard: &'g impl Guard) -> Option<&'g Entry<K, V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let mut table = self.root(guard);

        // The table has not been initialized yet.
        if table.is_null() {
            return None;
        }

        let hash = self.hash(key);

        loop {
            // Safety: Tables are loaded through our guard.
            let (_, slot) = unsafe { (*table).slot_for(hash) };

            match slot.load::<K, V>(guard) {
                Bin::Empty | Bin::Reserved => return None,

                // Safety: The chain was loaded through our guard.
                Bin::Chain(head) => {
                    return unsafe { Chain::new(head, guard) }
                        // Safety: Nodes reference valid entries while they are reachable.
                        .map(|node| unsafe { &*node.entry })
                        .find(|entry| entry.hash == hash && entry.key.borrow() == key)
                }

                // Safety: The tree was loaded through our guard.
                Bin::Tree(tree) => return unsafe { (*tree).find(hash, key, guard) },

                // The bin was migrated, follow it to the next table.
                Bin::Moved(next) => table = next,
            }
        }
    }

    // Inserts a key-value pair, replacing an existing value if `replace` is true.
    pub fn insert<'g>(
        &self,
        key: K,
        value: V,
        replace: bool,
        guard: &'g impl Guard,
    ) -> Result<Insert<'g, V>, Error>
    where
        K: 'g,
    {
        let hash = self.hash(&key);
        let (mut key, mut value) = (key, value);

        let mut table = self.root(guard);
        let mut treeify_at = None;

        let (result, bin_count) = loop {
            if table.is_null() {
                table = self.init_table(guard)?;
                continue;
            }

            // Safety: Tables are loaded through our guard.
            let (i, slot) = unsafe { (*table).slot_for(hash) };

            match slot.load::<K, V>(guard) {
                // Race to insert into the empty bin without locking.
                Bin::Empty => {
                    let entry = Entry::alloc(hash, key, value);
                    let node = Node::alloc(entry);

                    if slot.cas_empty(Bin::Chain(node)) {
                        break (Insert::Inserted, 0);
                    }

                    // Lost the race, take the key and value back and retry.
                    //
                    // Safety: The node and entry were never shared.
                    unsafe {
                        drop(Box::from_raw(node));
                        (key, value) = Entry::into_parts(entry);
                    }
                }

                Bin::Moved(next) => table = self.help_transfer(table, next, guard),

                _ => {
                    if slot.lock.held_by_current_thread() {
                        debug!("recursive update detected in insert");
                        return Err(Error::RecursiveUpdate);
                    }

                    let _lock = slot.lock.lock();

                    match slot.load::<K, V>(guard) {
                        Bin::Chain(head) => {
                            // Safety: We hold the bin lock.
                            let scan = unsafe { scan(head, hash, &key, guard) };

                            if let Some((node, _)) = scan.found {
                                // Safety: Nodes reference valid entries, and we hold the bin lock.
                                let entry = unsafe { &*node.entry };
                                break (unsafe { update(entry, value, replace, guard) }, scan.count);
                            }

                            let node = Node::alloc(Entry::alloc(hash, key, value));
                            // Safety: The chain is non-empty, and we hold the bin lock.
                            unsafe { (*scan.tail).next.store(node, Ordering::Release) };

                            if scan.count >= TREEIFY_THRESHOLD {
                                treeify_at = Some(i);
                            }

                            break (Insert::Inserted, scan.count);
                        }

                        Bin::Tree(tree) => {
                            // Safety: Trees are valid while we hold the bin lock.
                            let tree = unsafe { &*tree };

                            if let Some(entry) = tree.find_key(hash, &key, guard) {
                                // Safety: We hold the bin lock.
                                break (unsafe { update(entry, value, replace, guard) }, 2);
                            }

                            // Safety: We hold the bin lock and the key is not in the tree.
                            unsafe { tree.insert(Entry::alloc(hash, key, value), guard) };
                            break (Insert::Inserted, 2);
                        }

                        // The bin changed before we acquired the lock, retry.
                        _ => {}
                    }
                }
            }
        };

        // The mapping is published, failing to grow the table is still reported.
        let grown = match treeify_at {
            Some(i) => self.treeify_bin(table, i, guard),
            None => Ok(()),
        };

        if let Insert::Inserted = result {
            self.add_count(1, bin_count as isize, guard)?;
        }

        grown.map(|()| result)
    }

    // Atomically computes a new mapping for a key.
    //
    // `f` is called at most once, with the bin locked, and receives the current value if
    // the key is present. For a borrowed key with no mapping, `f` is not called. For an
    // owned key with no mapping, the bin is reserved while `f` runs so concurrent operations
    // on the key wait for the result.
    pub fn compute<'g, Q, F>(
        &self,
        hash: u64,
        key: KeyRef<'_, K, Q>,
        f: F,
        guard: &'g impl Guard,
    ) -> Result<Compute<'g, V>, Error>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
        F: FnOnce(&K, Option<&'g V>) -> Action<V>,
    {
        let mut key = key;
        let mut table = self.root(guard);
        let mut treeify_at = None;
        let mut bin_count = 0;
        let mut delta = 0;

        let result = loop {
            if table.is_null() {
                if let KeyRef::Borrowed(_) = key {
                    return Ok(Compute::Absent);
                }

                table = self.init_table(guard)?;
                continue;
            }

            // Safety: Tables are loaded through our guard.
            let (i, slot) = unsafe { (*table).slot_for(hash) };

            match slot.load::<K, V>(guard) {
                Bin::Moved(next) => table = self.help_transfer(table, next, guard),

                Bin::Empty => {
                    let owned = match key {
                        KeyRef::Borrowed(_) => break Compute::Absent,
                        KeyRef::Owned(owned) => owned,
                    };

                    let lock = slot.lock.lock();

                    // Reserve the bin while the callback runs.
                    if !slot.cas_empty(Bin::<K, V>::Reserved) {
                        drop(lock);
                        key = KeyRef::Owned(owned);
                        continue;
                    }

                    // Release the reservation if the callback panics.
                    let reservation = scopeguard::guard(slot, |slot| slot.store(Bin::<K, V>::Empty));

                    let action = {
                        let _computing = Computing::enter(self.id());
                        f(&owned, None)
                    };

                    match action {
                        Action::Set(value) => {
                            let entry = Entry::alloc(hash, owned, value);
                            let slot = scopeguard::ScopeGuard::into_inner(reservation);
                            slot.store(Bin::Chain(Node::alloc(entry)));

                            delta = 1;
                            bin_count = 1;

                            // Safety: The entry was just inserted and is protected by our guard.
                            break Compute::Inserted(unsafe { (*entry).value(guard) });
                        }
                        Action::Keep | Action::Remove => break Compute::Absent,
                    }
                }

                _ => {
                    if slot.lock.held_by_current_thread() {
                        debug!("recursive update detected in compute");
                        return Err(Error::RecursiveUpdate);
                    }

                    let _lock = slot.lock.lock();

                    match slot.load::<K, V>(guard) {
                        Bin::Chain(head) => {
                            // Safety: We hold the bin lock.
                            let scan = unsafe { scan(head, hash, key.get(), guard) };
                            bin_count = scan.count;

                            if let Some((node, prev)) = scan.found {
                                // Safety: Nodes reference valid entries.
                                let entry = unsafe { &*node.entry };
                                let current = entry.value(guard);

                                let action = {
                                    let _computing = Computing::enter(self.id());
                                    f(&entry.key, Some(current))
                                };

                                break match action {
                                    Action::Keep => Compute::Unchanged(current),
                                    Action::Set(value) => {
                                        // Safety: We hold the bin lock.
                                        let (old, new) = unsafe { entry.replace(value, guard) };
                                        Compute::Updated { old, new }
                                    }
                                    Action::Remove => {
                                        // Safety: We hold the bin lock and the node is in the chain.
                                        unsafe { unlink(slot, node, prev, guard) };
                                        delta = -1;
                                        Compute::Removed(current)
                                    }
                                };
                            }

                            let owned = match key {
                                KeyRef::Borrowed(_) => break Compute::Absent,
                                KeyRef::Owned(owned) => owned,
                            };

                            let action = {
                                let _computing = Computing::enter(self.id());
                                f(&owned, None)
                            };

                            let Action::Set(value) = action else {
                                break Compute::Absent;
                            };

                            let entry = Entry::alloc(hash, owned, value);
                            // Safety: The chain is non-empty, and we hold the bin lock.
                            unsafe { (*scan.tail).next.store(Node::alloc(entry), Ordering::Release) };
                            delta = 1;

                            if scan.count >= TREEIFY_THRESHOLD {
                                treeify_at = Some(i);
                            }

                            // Safety: The entry was just inserted and is protected by our guard.
                            break Compute::Inserted(unsafe { (*entry).value(guard) });
                        }

                        Bin::Tree(tree_ptr) => {
                            // Safety: Trees are valid while we hold the bin lock.
                            let tree = unsafe { &*tree_ptr };
                            bin_count = 2;

                            let found = match &key {
                                KeyRef::Owned(owned) => tree.find_key(hash, owned, guard),
                                KeyRef::Borrowed(key) => tree.find(hash, *key, guard),
                            };

                            if let Some(entry) = found {
                                let current = entry.value(guard);

                                let action = {
                                    let _computing = Computing::enter(self.id());
                                    f(&entry.key, Some(current))
                                };

                                break match action {
                                    Action::Keep => Compute::Unchanged(current),
                                    Action::Set(value) => {
                                        // Safety: We hold the bin lock.
                                        let (old, new) = unsafe { entry.replace(value, guard) };
                                        Compute::Updated { old, new }
                                    }
                                    Action::Remove => {
                                        // Safety: We hold the bin lock and the entry is in the tree.
                                        unsafe { remove_from_tree(slot, tree_ptr, entry, guard) };
                                        delta = -1;
                                        Compute::Removed(current)
                                    }
                                };
                            }

                            let owned = match key {
                                KeyRef::Borrowed(_) => break Compute::Absent,
                                KeyRef::Owned(owned) => owned,
                            };

                            let action = {
                                let _computing = Computing::enter(self.id());
                                f(&owned, None)
                            };

                            let Action::Set(value) = action else {
                                break Compute::Absent;
                            };

                            let entry = Entry::alloc(hash, owned, value);
                            // Safety: We hold the bin lock and the key is not in the tree.
                            unsafe { tree.insert(entry, guard) };
                            delta = 1;

                            // Safety: The entry was just inserted and is protected by our guard.
                            break Compute::Inserted(unsafe { (*entry).value(guard) });
                        }

                        // The bin changed before we acquired the lock, retry.
                        _ => {}
                    }
                }
            }
        };

        let grown = match treeify_at {
            Some(i) => self.treeify_bin(table, i, guard),
            None => Ok(()),
        };

        if delta != 0 {
            let check = if delta > 0 { bin_count as isize } else { -1 };
            self.add_count(delta, check, guard)?;
        }

        grown.map(|()| result)
    }

    // Removes every entry from the map.
    pub fn clear(&self, guard: &impl Guard) -> Result<(), Error> {
        let mut table = self.root(guard);
        let mut delta = 0;
        let mut i = 0;

        while !table.is_null() {
            // Safety: Tables are loaded through our guard.
            let t = unsafe { &*table };
            if i >= t.len() {
                break;
            }

            let slot = t.slot(i);
            match slot.load::<K, V>(guard) {
                Bin::Empty => i += 1,

                // Restart from the next table.
                Bin::Moved(next) => {
                    table = self.help_transfer(table, next, guard);
                    i = 0;
                }

                _ => {
                    if slot.lock.held_by_current_thread() {
                        debug!("recursive update detected in clear");

                        // Account for the bins that were already cleared.
                        self.add_count(delta, -1, guard)?;
                        return Err(Error::RecursiveUpdate);
                    }

                    let _lock = slot.lock.lock();

                    match slot.load::<K, V>(guard) {
                        Bin::Chain(head) => {
                            slot.store(Bin::<K, V>::Empty);

                            // Safety: The chain is unreachable from the table.
                            for node in unsafe { Chain::new(head, guard) } {
                                let node = node as *const Node<K, V> as *mut Node<K, V>;
                                unsafe {
                                    guard.defer_retire((*node).entry, reclaim_entry::<K, V>);
                                    guard.defer_retire(node, reclaim_node::<K, V>);
                                }
                                delta -= 1;
                            }

                            i += 1;
                        }

                        Bin::Tree(tree) => {
                            slot.store(Bin::<K, V>::Empty);

                            // Safety: The tree is unreachable from the table.
                            unsafe {
                                for entry in (*tree).entries(guard) {
                                    guard.defer_retire(entry, reclaim_entry::<K, V>);
                                    delta -= 1;
                                }
                                guard.defer_retire(tree, reclaim_tree_bin::<K, V>);
                            }

                            i += 1;
                        }

                        // The bin changed before we acquired the lock, retry.
                        _ => {}
                    }
                }
            }
        }

        if delta != 0 {
            self.add_count(delta, -1, guard)?;
        }

        Ok(())
    }

    // Removes every entry for which `f` returns `false`.
    //
    // Each removal is atomic and only succeeds if the value tested by `f` is still
    // current. Otherwise `f` is retried with the new value.
    pub fn retain<F>(&self, mut f: F, guard: &impl Guard) -> Result<(), Error>
    where
        F: FnMut(&K, &V) -> bool,
    {
        for entry in self.iter(guard) {
            let mut value = entry.value(guard);

            while !f(&entry.key, value) {
                let result = self.compute(
                    entry.hash,
                    KeyRef::<K, K>::Borrowed(&entry.key),
                    |_, current| match current {
                        Some(current) if ptr::eq(current, value) => Action::Remove,
                        _ => Action::Keep,
                    },
                    guard,
                )?;

                match result {
                    Compute::Unchanged(current) => value = current,
                    _ => break,
                }
            }
        }

        Ok(())
    }

    // Replaces every value with the result of `f`.
    //
    // Each replacement is atomic and only succeeds if the value passed to `f` is still
    // current. Otherwise `f` is retried with the new value.
    pub fn replace_all<F>(&self, mut f: F, guard: &impl Guard) -> Result<(), Error>
    where
        F: FnMut(&K, &V) -> V,
    {
        for entry in self.iter(guard) {
            let mut old = entry.value(guard);

            loop {
                let new = f(&entry.key, old);
                let result = self.compute(
                    entry.hash,
                    KeyRef::<K, K>::Borrowed(&entry.key),
                    |_, current| match current {
                        Some(current) if ptr::eq(current, old) => Action::Set(new),
                        _ => Action::Keep,
                    },
                    guard,
                )?;

                match result {
                    Compute::Unchanged(current) => old = current,
                    _ => break,
                }
            }
        }

        Ok(())
    }
}

// The result of scanning a chain for a key.
struct Scan<'g, K, V> {
    // The matching node and its predecessor, or null if it is the head.
    found: Option<(&'g Node<K, V>, *mut Node<K, V>)>,

    // The last node scanned.
    tail: *mut Node<K, V>,

    // The number of nodes scanned.
    count: usize,
}

// Scans a chain for the given key.
//
// # Safety
//
// The chain must have been loaded through `guard`.
unsafe fn scan<'g, K, V, Q>(
    head: *mut Node<K, V>,
    hash: u64,
    key: &Q,
    guard: &'g impl Guard,
) -> Scan<'g, K, V>
where
    K: Borrow<Q>,
    Q: Eq + ?Sized,
{
    let mut scan = Scan {
        found: None,
        tail: ptr::null_mut(),
        count: 0,
    };

    for node in unsafe { Chain::new(head, guard) } {
        scan.count += 1;

        // Safety: Nodes reference valid entries.
        let entry = unsafe { &*node.entry };
        if entry.hash == hash && entry.key.borrow() == key {
            scan.found = Some((node, scan.tail));
            break;
        }

        scan.tail = node as *const Node<K, V> as *mut Node<K, V>;
    }

    scan
}

// Unlinks a node from a chain and retires it along with its entry.
//
// # Safety
//
// The bin lock must be held, and `prev` must be the predecessor of `node`.
unsafe fn unlink<K, V>(
    slot: &table::Slot,
    node: &Node<K, V>,
    prev: *mut Node<K, V>,
    guard: &impl Guard,
) {
    let next = node.next.load(Ordering::Acquire);

    if prev.is_null() {
        slot.store(Bin::Chain(next));
    } else {
        unsafe { (*prev).next.store(next, Ordering::Release) };
    }

    let node = node as *const Node<K, V> as *mut Node<K, V>;
    unsafe {
        guard.defer_retire((*node).entry, reclaim_entry::<K, V>);
        guard.defer_retire(node, reclaim_node::<K, V>);
    }
}

// Removes an entry from a tree bin, converting the bin back to a chain if it
// becomes small enough.
//
// # Safety
//
// The bin lock must be held and `entry` must be in the tree.
unsafe fn remove_from_tree<K, V>(
    slot: &table::Slot,
    tree_ptr: *mut TreeBin<K, V>,
    entry: &Entry<K, V>,
    guard: &impl Guard,
) {
    let entry = entry as *const Entry<K, V> as *mut Entry<K, V>;
    let tree = unsafe { &*tree_ptr };

    let remaining = unsafe { tree.remove(entry, guard) };
    unsafe { guard.defer_retire(entry, reclaim_entry::<K, V>) };

    if remaining <= UNTREEIFY_THRESHOLD {
        let entries = tree.entries(guard);
        slot.store(Bin::Chain(Node::chain(entries.into_iter())));

        // Safety: The tree is no longer reachable from the table.
        unsafe { guard.defer_retire(tree_ptr, reclaim_tree_bin::<K, V>) };
        trace!("untreeified bin with {remaining} entries");
    }
}

// Updates an existing entry for an insert operation.
//
// # Safety
//
// The bin lock for the entry must be held.
unsafe fn update<'g, K, V>(
    entry: &'g Entry<K, V>,
    value: V,
    replace: bool,
    guard: &'g impl Guard,
) -> Insert<'g, V> {
    if !replace {
        return Insert::Present(entry.value(guard));
    }

    let (old, _) = unsafe { entry.replace(value, guard) };
    Insert::Replaced(old)
}

impl<K, V, S> Drop for HashMap<K, V, S> {
    fn drop(&mut self) {
        let next = *self.next_table.get_mut();
        let table = *self.table.get_mut();

        // Safety: We have unique access to the map, and bins are owned by exactly one
        // of the tables.
        unsafe {
            if !next.is_null() {
                table::drop_table(next);
            }

            if !table.is_null() {
                table::drop_table(table);
            }
        }
    }
}
