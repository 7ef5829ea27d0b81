use std::mem::ManuallyDrop;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use seize::{Collector, Guard};

// A key-value pair stored in the map.
//
// The key and hash are immutable. The value is boxed separately and swapped
// atomically, so readers see either the previous or the new value in full.
pub struct Entry<K, V> {
    pub hash: u64,
    pub key: K,
    pub value: AtomicPtr<V>,
}

impl<K, V> Entry<K, V> {
    // Allocates a new entry.
    pub fn alloc(hash: u64, key: K, value: V) -> *mut Entry<K, V> {
        Box::into_raw(Box::new(Entry {
            hash,
            key,
            value: AtomicPtr::new(Box::into_raw(Box::new(value))),
        }))
    }

    // Deallocates an entry that was never shared, returning its key and value.
    //
    // # Safety
    //
    // The entry must have been allocated with `Entry::alloc` and never shared.
    pub unsafe fn into_parts(entry: *mut Entry<K, V>) -> (K, V) {
        let entry = ManuallyDrop::new(*unsafe { Box::from_raw(entry) });

        // Safety: The entry is not dropped, so the key and value are moved out exactly once.
        let key = unsafe { ptr::read(&entry.key) };
        let value = unsafe { Box::from_raw(entry.value.load(Ordering::Relaxed)) };
        (key, *value)
    }

    // Loads the current value of this entry.
    #[inline]
    pub fn value<'g>(&self, guard: &'g impl Guard) -> &'g V {
        // Safety: Values are never null and are only reclaimed through the
        // collector after being replaced, which our guard protects against.
        unsafe { &*guard.protect(&self.value, Ordering::Acquire) }
    }

    // Replaces the value of this entry, retiring the old value.
    //
    // # Safety
    //
    // The bin lock for this entry must be held.
    pub unsafe fn replace<'g>(&self, value: V, guard: &'g impl Guard) -> (&'g V, &'g V) {
        let new = Box::into_raw(Box::new(value));
        let old = self.value.swap(new, Ordering::AcqRel);

        // Safety: The old value was unlinked by the swap above, and we hold the
        // bin lock, so no one else can retire it.
        unsafe { guard.defer_retire(old, reclaim_value::<V>) };

        // Safety: Both values are protected by `guard`.
        unsafe { (&*old, &*new) }
    }
}

impl<K, V> Drop for Entry<K, V> {
    fn drop(&mut self) {
        // Safety: The entry exclusively owns its current value.
        let _ = unsafe { Box::from_raw(*self.value.get_mut()) };
    }
}

// A node in a bin's singly-linked chain.
//
// Nodes only reference entries, so migrating a chain to a new table copies
// the nodes and leaves the entries in place.
#[repr(align(4))]
pub struct Node<K, V> {
    pub entry: *mut Entry<K, V>,
    pub next: AtomicPtr<Node<K, V>>,
}

impl<K, V> Node<K, V> {
    pub fn alloc(entry: *mut Entry<K, V>) -> *mut Node<K, V> {
        Box::into_raw(Box::new(Node {
            entry,
            next: AtomicPtr::new(ptr::null_mut()),
        }))
    }

    // Links a list of entries into a new chain, returning the head.
    pub fn chain(entries: impl DoubleEndedIterator<Item = *mut Entry<K, V>>) -> *mut Node<K, V> {
        let mut head = ptr::null_mut();
        for entry in entries.rev() {
            let node = Node::alloc(entry);
            // Safety: We just allocated the node and have not shared it.
            unsafe { (*node).next = AtomicPtr::new(head) };
            head = node;
        }
        head
    }
}

// An iterator over the nodes of a chain.
pub struct Chain<'g, K, V, G> {
    node: *mut Node<K, V>,
    guard: &'g G,
}

impl<'g, K, V, G: Guard> Chain<'g, K, V, G> {
    // Iterate over the chain starting at `head`.
    //
    // # Safety
    //
    // `head` must be null or a node loaded through `guard`.
    pub unsafe fn new(head: *mut Node<K, V>, guard: &'g G) -> Chain<'g, K, V, G> {
        Chain { node: head, guard }
    }
}

impl<'g, K: 'g, V: 'g, G: Guard> Iterator for Chain<'g, K, V, G> {
    type Item = &'g Node<K, V>;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        if self.node.is_null() {
            return None;
        }

        // Safety: Nodes are protected by the guard until they are unreachable.
        let node = unsafe { &*self.node };
        self.node = self.guard.protect(&node.next, Ordering::Acquire);
        Some(node)
    }
}

// Reclaim a value that was replaced.
pub unsafe fn reclaim_value<V>(value: *mut V, _collector: &Collector) {
    let _ = unsafe { Box::from_raw(value) };
}

// Reclaim a removed entry along with its current value.
pub unsafe fn reclaim_entry<K, V>(entry: *mut Entry<K, V>, _collector: &Collector) {
    let _ = unsafe { Box::from_raw(entry) };
}

// Reclaim a chain node, leaving its entry untouched.
pub unsafe fn reclaim_node<K, V>(node: *mut Node<K, V>, _collector: &Collector) {
    let _ = unsafe { Box::from_raw(node) };
}

// Frees every node of a chain, and optionally the entries they reference.
//
// # Safety
//
// The chain must be unreachable by other threads.
pub unsafe fn drop_chain<K, V>(mut node: *mut Node<K, V>, drop_entries: bool) {
    while !node.is_null() {
        let next = unsafe { (*node).next.load(Ordering::Relaxed) };
        let node_box = unsafe { Box::from_raw(node) };
        if drop_entries {
            let _ = unsafe { Box::from_raw(node_box.entry) };
        }
        node = next;
    }
}
