use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use seize::{Collector, Guard};

use super::lock::BinLock;
use super::node::{drop_chain, Node};
use super::tree::{drop_tree, TreeBin};
use crate::Error;

// The contents of a bin slot.
//
// Slots store a tagged pointer, the low two bits selecting the variant.
pub enum Bin<K, V> {
    // An empty slot.
    Empty,

    // A chain of entries, pointing to the head node.
    Chain(*mut Node<K, V>),

    // A balanced tree of entries.
    Tree(*mut TreeBin<K, V>),

    // The bin was migrated to the given table.
    Moved(*mut RawTable<K, V>),

    // A compute operation is running on this empty bin.
    Reserved,
}

// Tags for a bin pointer.
const CHAIN: usize = 0b00;
const TREE: usize = 0b01;
const MOVED: usize = 0b10;
const RESERVED: usize = 0b11;
const TAG: usize = 0b11;

// An untyped, tagged bin pointer.
pub type RawBin = *mut ();

impl<K, V> Bin<K, V> {
    #[inline]
    pub fn unpack(raw: RawBin) -> Bin<K, V> {
        if raw.is_null() {
            return Bin::Empty;
        }

        let ptr = raw.map_addr(|addr| addr & !TAG);
        match raw.addr() & TAG {
            CHAIN => Bin::Chain(ptr.cast()),
            TREE => Bin::Tree(ptr.cast()),
            MOVED => Bin::Moved(ptr.cast()),
            _ => Bin::Reserved,
        }
    }

    #[inline]
    pub fn pack(self) -> RawBin {
        match self {
            Bin::Empty => ptr::null_mut(),
            Bin::Chain(node) => node.cast(),
            Bin::Tree(tree) => tree.cast::<()>().map_addr(|addr| addr | TREE),
            Bin::Moved(table) => table.cast::<()>().map_addr(|addr| addr | MOVED),
            Bin::Reserved => ptr::without_provenance_mut(RESERVED),
        }
    }
}

impl<K, V> Clone for Bin<K, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K, V> Copy for Bin<K, V> {}

// A slot in the table.
#[derive(Default)]
pub struct Slot {
    pub bin: AtomicPtr<()>,
    pub lock: BinLock,
}

impl Slot {
    // Loads the bin through the given guard.
    #[inline]
    pub fn load<K, V>(&self, guard: &impl Guard) -> Bin<K, V> {
        Bin::unpack(guard.protect(&self.bin, Ordering::Acquire))
    }

    #[inline]
    pub fn store<K, V>(&self, bin: Bin<K, V>) {
        self.bin.store(bin.pack(), Ordering::Release);
    }

    // Attempts to replace an empty slot with the given bin.
    #[inline]
    pub fn cas_empty<K, V>(&self, bin: Bin<K, V>) -> bool {
        self.bin
            .compare_exchange(
                ptr::null_mut(),
                bin.pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

#[cfg(test)]
thread_local! {
    // Table allocations of at least this length fail on the current thread.
    pub static FAIL_ALLOC_AT: std::cell::Cell<usize> = const { std::cell::Cell::new(usize::MAX) };
}

// A fixed-length table of bins.
#[repr(align(4))]
pub struct RawTable<K, V> {
    slots: Box<[Slot]>,
    _kv: std::marker::PhantomData<(K, V)>,
}

impl<K, V> RawTable<K, V> {
    // Allocates a table with `len` empty slots.
    //
    // `len` must be a power of two.
    pub fn alloc(len: usize) -> Result<*mut RawTable<K, V>, Error> {
        debug_assert!(len.is_power_of_two());

        #[cfg(test)]
        if len >= FAIL_ALLOC_AT.with(|limit| limit.get()) {
            return Err(Error::AllocationFailed { capacity: len });
        }

        let mut slots = Vec::new();
        slots
            .try_reserve_exact(len)
            .map_err(|_| Error::AllocationFailed { capacity: len })?;
        slots.resize_with(len, Slot::default);

        Ok(Box::into_raw(Box::new(RawTable {
            slots: slots.into_boxed_slice(),
            _kv: std::marker::PhantomData,
        })))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    // Returns the slot for the given hash.
    #[inline]
    pub fn slot_for(&self, hash: u64) -> (usize, &Slot) {
        let i = (hash as usize) & (self.slots.len() - 1);
        (i, &self.slots[i])
    }

    #[inline]
    pub fn slot(&self, i: usize) -> &Slot {
        &self.slots[i]
    }
}

// Reclaims a table whose bins have all been migrated.
pub unsafe fn reclaim_table<K, V>(table: *mut RawTable<K, V>, _collector: &Collector) {
    let _ = unsafe { Box::from_raw(table) };
}

// Frees a table along with every bin it owns.
//
// Moved bins are owned by the next table and are skipped.
//
// # Safety
//
// The table must be unreachable by other threads.
pub unsafe fn drop_table<K, V>(table: *mut RawTable<K, V>) {
    let mut table = unsafe { Box::from_raw(table) };

    for slot in table.slots.iter_mut() {
        match Bin::<K, V>::unpack(*slot.bin.get_mut()) {
            Bin::Chain(head) => unsafe { drop_chain(head, true) },
            Bin::Tree(tree) => unsafe { drop_tree(tree, true) },
            Bin::Empty | Bin::Moved(_) | Bin::Reserved => {}
        }
    }
}
