use std::borrow::Borrow;
use std::cmp::Ordering as Order;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use seize::{Collector, Guard};

use super::node::Entry;

/// The number of entries in a chain at which it is converted to a tree.
pub const TREEIFY_THRESHOLD: usize = 8;

/// The number of entries in a tree at or below which it is converted back to a chain.
pub const UNTREEIFY_THRESHOLD: usize = 6;

/// The minimum table length for which bins are treeified. Smaller tables are
/// resized instead.
pub const MIN_TREEIFY_CAPACITY: usize = 64;

/// A total order on keys, used to place entries with colliding hashes.
pub type KeyOrder<K> = fn(&K, &K) -> Order;

// A bin holding a balanced tree of entries.
//
// Trees are ordered by hash, then by key if the map has a key order, and finally by
// entry address. The address is stable for the lifetime of an entry. Without a key
// order, lookups for a given hash search every node with an equal hash.
//
// Tree nodes are immutable once published. Mutations copy the path to the modified
// node and publish a new root, so readers never observe a tree mid-rebalance.
#[repr(align(4))]
pub struct TreeBin<K, V> {
    root: AtomicPtr<TreeNode<K, V>>,

    // The number of entries in the tree, only modified under the bin lock.
    count: AtomicUsize,

    order: Option<KeyOrder<K>>,
}

struct TreeNode<K, V> {
    entry: *mut Entry<K, V>,
    hash: u64,
    left: *mut TreeNode<K, V>,
    right: *mut TreeNode<K, V>,
    height: u8,
}

// Compares two entries in tree order.
//
// # Safety
//
// Both entries must be valid.
#[inline]
unsafe fn compare<K, V>(
    order: Option<KeyOrder<K>>,
    (hash, entry): (u64, *mut Entry<K, V>),
    (other_hash, other): (u64, *mut Entry<K, V>),
) -> Order {
    hash.cmp(&other_hash)
        .then_with(|| match order {
            Some(order) if entry != other => unsafe { order(&(*entry).key, &(*other).key) },
            _ => Order::Equal,
        })
        .then_with(|| entry.addr().cmp(&other.addr()))
}

impl<K, V> TreeNode<K, V> {
    #[inline]
    fn key(&self) -> (u64, *mut Entry<K, V>) {
        (self.hash, self.entry)
    }
}

impl<K, V> TreeBin<K, V> {
    // Builds a tree from a list of entries.
    pub fn alloc(entries: &[*mut Entry<K, V>], order: Option<KeyOrder<K>>) -> *mut TreeBin<K, V> {
        let mut sorted = entries
            .iter()
            // Safety: The caller owns the entries for the duration of the build.
            .map(|&entry| (unsafe { (*entry).hash }, entry))
            .collect::<Vec<_>>();
        // Safety: See above.
        sorted.sort_unstable_by(|&a, &b| unsafe { compare(order, a, b) });

        Box::into_raw(Box::new(TreeBin {
            root: AtomicPtr::new(build(&sorted)),
            count: AtomicUsize::new(entries.len()),
            order,
        }))
    }

    // The key order this tree was built with.
    #[inline]
    pub fn order(&self) -> Option<KeyOrder<K>> {
        self.order
    }

    // Returns the number of entries in the tree.
    #[inline]
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    // Returns the entry matching the given key.
    #[inline]
    pub fn find<'g, Q>(&self, hash: u64, key: &Q, guard: &'g impl Guard) -> Option<&'g Entry<K, V>>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let root = guard.protect(&self.root, Ordering::Acquire);

        // Safety: The root was loaded through our guard and nodes reachable from it
        // are retired only after being replaced.
        unsafe { find(root, hash, key).map(|entry| &*entry) }
    }

    // Returns the entry matching an owned key.
    //
    // With a key order this descends a single path, even when every key in the tree
    // shares the same hash.
    #[inline]
    pub fn find_key<'g>(&self, hash: u64, key: &K, guard: &'g impl Guard) -> Option<&'g Entry<K, V>>
    where
        K: Eq,
    {
        let Some(order) = self.order else {
            return self.find(hash, key, guard);
        };

        let root = guard.protect(&self.root, Ordering::Acquire);

        // Safety: See `find`.
        unsafe { find_ordered(root, hash, key, order).map(|entry| &*entry) }
    }

    // Returns a snapshot of the entries in the tree, in tree order.
    pub fn entries(&self, guard: &impl Guard) -> Vec<*mut Entry<K, V>> {
        let mut entries = Vec::with_capacity(self.len());
        let root = guard.protect(&self.root, Ordering::Acquire);

        // Safety: See `find`.
        unsafe { collect(root, &mut entries) };
        entries
    }

    // Inserts an entry into the tree.
    //
    // # Safety
    //
    // The bin lock must be held, and the entry must not already be in the tree.
    pub unsafe fn insert(&self, entry: *mut Entry<K, V>, guard: &impl Guard) {
        let mut retired = Vec::new();
        let root = self.root.load(Ordering::Relaxed);

        // Safety: Guaranteed by caller.
        let root = unsafe { insert(root, (hash_of(entry), entry), self.order, &mut retired) };
        self.publish(root, retired, guard);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    // Removes an entry from the tree, returning the number of remaining entries.
    //
    // # Safety
    //
    // The bin lock must be held, and the entry must be in the tree.
    pub unsafe fn remove(&self, entry: *mut Entry<K, V>, guard: &impl Guard) -> usize {
        let mut retired = Vec::new();
        let root = self.root.load(Ordering::Relaxed);

        // Safety: Guaranteed by caller.
        let root = unsafe { remove(root, (hash_of(entry), entry), self.order, &mut retired) };
        self.publish(root, retired, guard);
        self.count.fetch_sub(1, Ordering::Relaxed) - 1
    }

    // Publishes a new root and retires the nodes it replaced.
    fn publish(
        &self,
        root: *mut TreeNode<K, V>,
        retired: Vec<*mut TreeNode<K, V>>,
        guard: &impl Guard,
    ) {
        self.root.store(root, Ordering::Release);

        for node in retired {
            // Safety: The node is unreachable from the new root, and was only
            // reachable from this bin.
            unsafe { guard.defer_retire(node, reclaim_tree_node::<K, V>) };
        }
    }
}

// Reclaims a tree bin and its nodes, leaving the entries untouched.
pub unsafe fn reclaim_tree_bin<K, V>(bin: *mut TreeBin<K, V>, _collector: &Collector) {
    unsafe { drop_tree(bin, false) }
}

unsafe fn reclaim_tree_node<K, V>(node: *mut TreeNode<K, V>, _collector: &Collector) {
    let _ = unsafe { Box::from_raw(node) };
}

// Frees a tree bin and its nodes, and optionally the entries they reference.
//
// # Safety
//
// The tree must be unreachable by other threads.
pub unsafe fn drop_tree<K, V>(bin: *mut TreeBin<K, V>, drop_entries: bool) {
    let mut bin = unsafe { Box::from_raw(bin) };
    let mut stack = vec![*bin.root.get_mut()];

    while let Some(node) = stack.pop() {
        if node.is_null() {
            continue;
        }

        let node = unsafe { Box::from_raw(node) };
        stack.push(node.left);
        stack.push(node.right);

        if drop_entries {
            let _ = unsafe { Box::from_raw(node.entry) };
        }
    }
}

// Safety: The entry must be valid.
#[inline]
unsafe fn hash_of<K, V>(entry: *mut Entry<K, V>) -> u64 {
    unsafe { (*entry).hash }
}

#[inline]
fn height<K, V>(node: *mut TreeNode<K, V>) -> u8 {
    if node.is_null() {
        0
    } else {
        // Safety: Non-null nodes are valid for the duration of any tree operation.
        unsafe { (*node).height }
    }
}

fn make<K, V>(
    entry: *mut Entry<K, V>,
    hash: u64,
    left: *mut TreeNode<K, V>,
    right: *mut TreeNode<K, V>,
) -> *mut TreeNode<K, V> {
    Box::into_raw(Box::new(TreeNode {
        entry,
        hash,
        left,
        right,
        height: height(left).max(height(right)) + 1,
    }))
}

// Builds a balanced tree from sorted entries.
fn build<K, V>(sorted: &[(u64, *mut Entry<K, V>)]) -> *mut TreeNode<K, V> {
    if sorted.is_empty() {
        return ptr::null_mut();
    }

    let mid = sorted.len() / 2;
    let (hash, entry) = sorted[mid];
    make(entry, hash, build(&sorted[..mid]), build(&sorted[mid + 1..]))
}

// Creates a node from the given parts, rotating to restore balance if needed.
//
// Nodes replaced by a rotation are pushed to `retired`.
unsafe fn balance<K, V>(
    entry: *mut Entry<K, V>,
    hash: u64,
    left: *mut TreeNode<K, V>,
    right: *mut TreeNode<K, V>,
    retired: &mut Vec<*mut TreeNode<K, V>>,
) -> *mut TreeNode<K, V> {
    let (hl, hr) = (height(left), height(right));

    if hl > hr + 1 {
        let l = unsafe { &*left };
        retired.push(left);

        if height(l.left) >= height(l.right) {
            return make(l.entry, l.hash, l.left, make(entry, hash, l.right, right));
        }

        let lr = unsafe { &*l.right };
        retired.push(l.right);
        return make(
            lr.entry,
            lr.hash,
            make(l.entry, l.hash, l.left, lr.left),
            make(entry, hash, lr.right, right),
        );
    }

    if hr > hl + 1 {
        let r = unsafe { &*right };
        retired.push(right);

        if height(r.right) >= height(r.left) {
            return make(r.entry, r.hash, make(entry, hash, left, r.left), r.right);
        }

        let rl = unsafe { &*r.left };
        retired.push(r.left);
        return make(
            rl.entry,
            rl.hash,
            make(entry, hash, left, rl.left),
            make(r.entry, r.hash, rl.right, r.right),
        );
    }

    make(entry, hash, left, right)
}

unsafe fn insert<K, V>(
    node: *mut TreeNode<K, V>,
    key: (u64, *mut Entry<K, V>),
    order: Option<KeyOrder<K>>,
    retired: &mut Vec<*mut TreeNode<K, V>>,
) -> *mut TreeNode<K, V> {
    let (hash, entry) = key;

    if node.is_null() {
        return make(entry, hash, ptr::null_mut(), ptr::null_mut());
    }

    let n = unsafe { &*node };
    retired.push(node);

    unsafe {
        if compare(order, key, n.key()) == Order::Less {
            let left = insert(n.left, key, order, retired);
            balance(n.entry, n.hash, left, n.right, retired)
        } else {
            let right = insert(n.right, key, order, retired);
            balance(n.entry, n.hash, n.left, right, retired)
        }
    }
}

unsafe fn remove<K, V>(
    node: *mut TreeNode<K, V>,
    key: (u64, *mut Entry<K, V>),
    order: Option<KeyOrder<K>>,
    retired: &mut Vec<*mut TreeNode<K, V>>,
) -> *mut TreeNode<K, V> {
    if node.is_null() {
        return node;
    }

    let n = unsafe { &*node };
    retired.push(node);

    unsafe {
        match compare(order, key, n.key()) {
            Order::Less => {
                let left = remove(n.left, key, order, retired);
                balance(n.entry, n.hash, left, n.right, retired)
            }
            Order::Greater => {
                let right = remove(n.right, key, order, retired);
                balance(n.entry, n.hash, n.left, right, retired)
            }
            Order::Equal => {
                if n.left.is_null() {
                    return n.right;
                }

                if n.right.is_null() {
                    return n.left;
                }

                // Replace the node with its successor.
                let (entry, hash, right) = remove_min(n.right, retired);
                balance(entry, hash, n.left, right, retired)
            }
        }
    }
}

// Removes the minimum node of a subtree, returning its entry and the new subtree.
unsafe fn remove_min<K, V>(
    node: *mut TreeNode<K, V>,
    retired: &mut Vec<*mut TreeNode<K, V>>,
) -> (*mut Entry<K, V>, u64, *mut TreeNode<K, V>) {
    let n = unsafe { &*node };
    retired.push(node);

    if n.left.is_null() {
        return (n.entry, n.hash, n.right);
    }

    let (entry, hash, left) = unsafe { remove_min(n.left, retired) };
    (entry, hash, unsafe { balance(n.entry, n.hash, left, n.right, retired) })
}

unsafe fn find<K, V, Q>(
    mut node: *mut TreeNode<K, V>,
    hash: u64,
    key: &Q,
) -> Option<*mut Entry<K, V>>
where
    K: Borrow<Q>,
    Q: Eq + ?Sized,
{
    while !node.is_null() {
        let n = unsafe { &*node };

        if hash < n.hash {
            node = n.left;
        } else if hash > n.hash {
            node = n.right;
        } else {
            if unsafe { (*n.entry).key.borrow() } == key {
                return Some(n.entry);
            }

            // Equal hashes may be on either side.
            if let Some(entry) = unsafe { find(n.left, hash, key) } {
                return Some(entry);
            }

            node = n.right;
        }
    }

    None
}

// Finds an owned key in a tree ordered by `order`.
unsafe fn find_ordered<K, V>(
    mut node: *mut TreeNode<K, V>,
    hash: u64,
    key: &K,
    order: KeyOrder<K>,
) -> Option<*mut Entry<K, V>>
where
    K: Eq,
{
    while !node.is_null() {
        let n = unsafe { &*node };
        let other = unsafe { &(*n.entry).key };

        match hash.cmp(&n.hash).then_with(|| order(key, other)) {
            Order::Less => node = n.left,
            Order::Greater => node = n.right,
            Order::Equal if other == key => return Some(n.entry),

            // The order disagrees with equality, fall back to a full search.
            Order::Equal => return unsafe { find(n.left, hash, key).or_else(|| find(n.right, hash, key)) },
        }
    }

    None
}

unsafe fn collect<K, V>(node: *mut TreeNode<K, V>, entries: &mut Vec<*mut Entry<K, V>>) {
    if node.is_null() {
        return;
    }

    let n = unsafe { &*node };
    unsafe { collect(n.left, entries) };
    entries.push(n.entry);
    unsafe { collect(n.right, entries) };
}

#[cfg(test)]
mod tests {
    use super::*;

    // Asserts the AVL invariants, returning the height of the subtree.
    fn check<K, V>(node: *mut TreeNode<K, V>, order: Option<KeyOrder<K>>) -> u8 {
        if node.is_null() {
            return 0;
        }

        let n = unsafe { &*node };
        let (hl, hr) = (check(n.left, order), check(n.right, order));
        assert!(hl.abs_diff(hr) <= 1, "unbalanced node");
        assert_eq!(n.height, hl.max(hr) + 1);

        if !n.left.is_null() {
            assert_eq!(unsafe { compare(order, (*n.left).key(), n.key()) }, Order::Less);
        }
        if !n.right.is_null() {
            assert_eq!(unsafe { compare(order, (*n.right).key(), n.key()) }, Order::Greater);
        }

        n.height
    }

    fn root<K, V>(tree: &TreeBin<K, V>) -> *mut TreeNode<K, V> {
        tree.root.load(Ordering::Relaxed)
    }

    #[test]
    fn colliding_hashes() {
        let collector = Collector::new();
        let guard = collector.enter();

        let entries = (0..8u64)
            .map(|i| Entry::alloc(7, i, i * 10))
            .collect::<Vec<_>>();
        let bin = TreeBin::alloc(&entries, None);
        let tree = unsafe { &*bin };

        for i in 8..200u64 {
            // A handful of distinct hashes, each with many colliding keys.
            unsafe { tree.insert(Entry::alloc(i % 5, i, i * 10), &guard) };
        }

        assert_eq!(tree.len(), 200);
        check(root(tree), None);

        for i in 8..200u64 {
            let entry = tree.find(i % 5, &i, &guard).unwrap();
            assert_eq!(*entry.value(&guard), i * 10);
        }
        assert!(tree.find(7, &1000, &guard).is_none());
        assert!(tree.find(99, &3, &guard).is_none());

        for i in (0..200u64).step_by(2) {
            let hash = if i < 8 { 7 } else { i % 5 };
            let entry = tree.find(hash, &i, &guard).unwrap() as *const _ as *mut Entry<u64, u64>;
            unsafe { tree.remove(entry, &guard) };
            unsafe { guard.defer_retire(entry, crate::raw::node::reclaim_entry::<u64, u64>) };
        }

        assert_eq!(tree.len(), 100);
        check(root(tree), None);

        for i in 0..200u64 {
            let hash = if i < 8 { 7 } else { i % 5 };
            assert_eq!(tree.find(hash, &i, &guard).is_some(), i % 2 == 1);
        }

        let snapshot = tree.entries(&guard);
        assert_eq!(snapshot.len(), 100);
        assert!(snapshot
            .windows(2)
            .all(|w| unsafe { ((*w[0]).hash, w[0].addr()) < ((*w[1]).hash, w[1].addr()) }));

        drop(guard);
        unsafe { drop_tree(bin, true) };
    }

    #[test]
    fn logarithmic_height() {
        let collector = Collector::new();
        let guard = collector.enter();

        let bin = TreeBin::<u64, u64>::alloc(&[], None);
        let tree = unsafe { &*bin };
        for i in 0..1024u64 {
            unsafe { tree.insert(Entry::alloc(i, i, i), &guard) };
        }

        let height = check(root(tree), None);
        assert!(height <= 15, "height {height} is not logarithmic");

        drop(guard);
        unsafe { drop_tree(bin, true) };
    }

    // Counts the nodes visited by an ordered lookup.
    fn visits(tree: &TreeBin<u64, u64>, key: u64) -> usize {
        let order = tree.order().unwrap();
        let (mut node, mut visited) = (root(tree), 0);

        while !node.is_null() {
            visited += 1;
            let n = unsafe { &*node };
            match order(&key, unsafe { &(*n.entry).key }) {
                Order::Less => node = n.left,
                Order::Greater => node = n.right,
                Order::Equal => break,
            }
        }

        visited
    }

    #[test]
    fn ordered_keys_under_full_collision() {
        let collector = Collector::new();
        let guard = collector.enter();

        let order: KeyOrder<u64> = u64::cmp;
        let entries = (0..8u64).rev().map(|i| Entry::alloc(0, i, i)).collect::<Vec<_>>();
        let bin = TreeBin::alloc(&entries, Some(order));
        let tree = unsafe { &*bin };

        for i in 8..4096u64 {
            unsafe { tree.insert(Entry::alloc(0, i, i), &guard) };
        }

        check(root(tree), Some(order));

        // Every hash is equal, so the tree is ordered by key alone.
        let snapshot = tree.entries(&guard);
        assert!(snapshot.iter().map(|&e| unsafe { (*e).key }).eq(0..4096));

        for i in 0..4096u64 {
            assert_eq!(tree.find_key(0, &i, &guard).map(|e| *e.value(&guard)), Some(i));
            assert!(visits(tree, i) <= 20, "lookup for {i} is not logarithmic");
        }
        assert!(tree.find_key(0, &4096, &guard).is_none());
        assert!(tree.find_key(1, &1, &guard).is_none());

        // Borrowed lookups still find every key.
        assert_eq!(tree.find(0, &100, &guard).map(|e| e.key), Some(100));

        for i in (0..4096u64).filter(|i| i % 3 == 0) {
            let entry = tree.find_key(0, &i, &guard).unwrap() as *const _ as *mut Entry<u64, u64>;
            unsafe { tree.remove(entry, &guard) };
            unsafe { guard.defer_retire(entry, crate::raw::node::reclaim_entry::<u64, u64>) };
        }

        check(root(tree), Some(order));
        for i in 0..4096u64 {
            assert_eq!(tree.find_key(0, &i, &guard).is_some(), i % 3 != 0);
        }

        drop(guard);
        unsafe { drop_tree(bin, true) };
    }
}
