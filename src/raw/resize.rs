use std::sync::atomic::Ordering;
use std::{ptr, thread};

use seize::Guard;

use super::lock::Computing;
use super::node::{reclaim_node, Chain, Entry, Node};
use super::table::{reclaim_table, Bin, RawTable};
use super::tree::{reclaim_tree_bin, TreeBin, MIN_TREEIFY_CAPACITY, UNTREEIFY_THRESHOLD};
use super::utils::{self, trace, warn};
use super::{HashMap, MAXIMUM_CAPACITY};
use crate::Error;

/// The minimum number of bins claimed by a resizer at once.
const MIN_TRANSFER_STRIDE: usize = 16;

/// The number of bits of `size_ctl` used for the resize stamp.
const RESIZE_STAMP_BITS: u32 = 16;

/// The maximum number of threads that can help resize.
const MAX_RESIZERS: isize = (1 << (isize::BITS - RESIZE_STAMP_BITS)) - 1;

/// The shift for the resize stamp in `size_ctl`.
const RESIZE_STAMP_SHIFT: u32 = isize::BITS - RESIZE_STAMP_BITS;

// Returns the stamp for resizing a table of length `n`, shifted into the high bits
// of `size_ctl`. The result is always negative.
#[inline]
fn resize_stamp(n: usize) -> isize {
    ((n.leading_zeros() as isize) | (1 << (RESIZE_STAMP_BITS - 1))) << RESIZE_STAMP_SHIFT
}

// The resize threshold for a table of length `n`.
#[inline]
fn threshold(n: usize) -> isize {
    (n - (n >> 2)) as isize
}

impl<K, V, S> HashMap<K, V, S> {
    // Grows the table to hold `additional` more entries than it currently holds.
    //
    // Fails without allocating if no table could hold that many entries.
    pub fn reserve(&self, additional: usize, guard: &impl Guard) -> Result<(), Error> {
        let size = self
            .len()
            .checked_add(additional)
            .filter(|&size| size <= MAXIMUM_CAPACITY)
            .ok_or(Error::CapacityOverflow)?;

        self.try_presize(size, guard)
    }

    // Allocate the initial table.
    #[cold]
    #[inline(never)]
    pub(super) fn init_table(&self, guard: &impl Guard) -> Result<*mut RawTable<K, V>, Error> {
        loop {
            let table = self.root(guard);
            if !table.is_null() {
                return Ok(table);
            }

            let sc = self.size_ctl.load(Ordering::SeqCst);

            // Another thread is initializing the table.
            if sc < 0 {
                thread::yield_now();
                continue;
            }

            if self
                .size_ctl
                .compare_exchange(sc, -1, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                continue;
            }

            let table = self.table.load(Ordering::SeqCst);
            if !table.is_null() {
                self.size_ctl.store(sc, Ordering::SeqCst);
                return Ok(table);
            }

            let n = if sc > 0 {
                sc as usize
            } else {
                super::DEFAULT_CAPACITY
            };

            match RawTable::alloc(n) {
                Ok(table) => {
                    self.table.store(table, Ordering::SeqCst);
                    self.size_ctl.store(threshold(n), Ordering::SeqCst);
                    trace!("allocated initial table of length {n}");
                    return Ok(table);
                }
                Err(err) => {
                    self.size_ctl.store(sc, Ordering::SeqCst);
                    warn!("failed to allocate initial table of length {n}");
                    return Err(err);
                }
            }
        }
    }

    // Adds `delta` to the entry count, starting or helping a resize if the count
    // crossed the threshold.
    //
    // `check` is the length of the bin that was modified, or negative to skip the
    // resize check. The count is always updated, even if starting a resize fails.
    pub(super) fn add_count(
        &self,
        delta: isize,
        check: isize,
        guard: &impl Guard,
    ) -> Result<(), Error> {
        let contended = self.count.add(delta, guard);

        if check < 0 || (contended && check <= 1) {
            return Ok(());
        }

        // A thread inside a compute callback holds a bin lock and cannot resize.
        if Computing::active(self.id()) {
            return Ok(());
        }

        let mut size = self.count.sum() as isize;
        loop {
            let sc = self.size_ctl.load(Ordering::SeqCst);
            if size < sc {
                return Ok(());
            }

            let table = self.root(guard);
            if table.is_null() {
                return Ok(());
            }

            // Safety: The table was loaded through our guard.
            let n = unsafe { (*table).len() };
            if n >= MAXIMUM_CAPACITY {
                return Ok(());
            }

            let rs = resize_stamp(n);

            if sc < 0 {
                // The resize is finishing, or there are no more bins to claim.
                if sc == rs + MAX_RESIZERS
                    || sc == rs + 1
                    || self.next_table.load(Ordering::SeqCst).is_null()
                    || self.transfer_index.load(Ordering::SeqCst) <= 0
                {
                    return Ok(());
                }

                if self
                    .size_ctl
                    .compare_exchange(sc, sc + 1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    let next = self.next_table.load(Ordering::SeqCst);
                    // Safety: Both tables are protected by our guard.
                    unsafe { self.transfer(table, next, guard) };
                }
            } else if self
                .size_ctl
                .compare_exchange(sc, rs + 2, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                // The map remains valid at its current size, and the next insert
                // past the threshold retries.
                self.start_transfer(table, sc, guard)?;
            }

            size = self.count.sum() as isize;
        }
    }

    // Helps an in-progress resize, returning the next table.
    pub(super) fn help_transfer(
        &self,
        table: *mut RawTable<K, V>,
        next: *mut RawTable<K, V>,
        guard: &impl Guard,
    ) -> *mut RawTable<K, V> {
        // Threads inside a compute callback only follow the forwarding pointer.
        if Computing::active(self.id()) {
            return next;
        }

        // Safety: The table was loaded through our guard.
        let rs = resize_stamp(unsafe { (*table).len() });

        while next == self.next_table.load(Ordering::SeqCst)
            && table == self.table.load(Ordering::SeqCst)
        {
            let sc = self.size_ctl.load(Ordering::SeqCst);
            if sc >= 0
                || sc == rs + MAX_RESIZERS
                || sc == rs + 1
                || self.transfer_index.load(Ordering::SeqCst) <= 0
            {
                break;
            }

            if self
                .size_ctl
                .compare_exchange(sc, sc + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                trace!("helping resize");
                // Safety: Both tables are protected by our guard.
                unsafe { self.transfer(table, next, guard) };
                break;
            }
        }

        next
    }

    // Grows the table to hold at least `size` entries without resizing.
    pub(super) fn try_presize(&self, size: usize, guard: &impl Guard) -> Result<(), Error> {
        if Computing::active(self.id()) {
            return Ok(());
        }

        let c = if size >= (MAXIMUM_CAPACITY >> 1) {
            MAXIMUM_CAPACITY
        } else {
            utils::table_size_for(size + (size >> 1) + 1, MAXIMUM_CAPACITY)
        };

        loop {
            let sc = self.size_ctl.load(Ordering::SeqCst);
            if sc < 0 {
                return Ok(());
            }

            let table = self.root(guard);

            // The table has not been allocated yet, allocate it at the requested size.
            if table.is_null() {
                let n = (sc as usize).max(c);

                if self
                    .size_ctl
                    .compare_exchange(sc, -1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    if !self.table.load(Ordering::SeqCst).is_null() {
                        self.size_ctl.store(sc, Ordering::SeqCst);
                        continue;
                    }

                    match RawTable::alloc(n) {
                        Ok(table) => {
                            self.table.store(table, Ordering::SeqCst);
                            self.size_ctl.store(threshold(n), Ordering::SeqCst);
                            trace!("allocated initial table of length {n}");
                        }
                        Err(err) => {
                            self.size_ctl.store(sc, Ordering::SeqCst);
                            return Err(err);
                        }
                    }
                }

                continue;
            }

            // Safety: The table was loaded through our guard.
            let n = unsafe { (*table).len() };
            if c <= sc as usize || n >= MAXIMUM_CAPACITY {
                return Ok(());
            }

            if table == self.table.load(Ordering::SeqCst)
                && self
                    .size_ctl
                    .compare_exchange(sc, resize_stamp(n) + 2, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
            {
                self.start_transfer(table, sc, guard)?;
            }
        }
    }

    // Allocates the next table and starts a resize.
    //
    // `size_ctl` must have been set to the initial resize stamp by this thread, and
    // is restored to `sc` if allocation fails.
    #[cold]
    #[inline(never)]
    fn start_transfer(
        &self,
        table: *mut RawTable<K, V>,
        sc: isize,
        guard: &impl Guard,
    ) -> Result<(), Error> {
        // Safety: The table was loaded through our guard.
        let n = unsafe { (*table).len() };

        let next = match RawTable::alloc(n << 1) {
            Ok(next) => next,
            Err(err) => {
                self.size_ctl.store(sc, Ordering::SeqCst);
                warn!("{err}, table remains at length {n}");
                return Err(err);
            }
        };

        trace!("resizing table from {n} to {}", n << 1);

        self.next_table.store(next, Ordering::SeqCst);
        self.transfer_index.store(n as isize, Ordering::SeqCst);

        // Safety: Both tables are protected by our guard.
        unsafe { self.transfer(table, next, guard) };
        Ok(())
    }

    // Moves bins from `table` to `next`, claiming strides of bins until there are
    // none left. The last resizer to finish publishes the new table.
    //
    // # Safety
    //
    // Both tables must be protected by `guard`, and the caller must have registered
    // as a resizer in `size_ctl`.
    unsafe fn transfer(
        &self,
        table: *mut RawTable<K, V>,
        next: *mut RawTable<K, V>,
        guard: &impl Guard,
    ) {
        let (old, new) = unsafe { (&*table, &*next) };
        let n = old.len();

        let cpus = utils::num_cpus();
        let stride = if cpus > 1 { (n >> 3) / cpus } else { n }.max(MIN_TRANSFER_STRIDE) as isize;

        let mut advance = true;
        let mut finishing = false;
        let (mut i, mut bound): (isize, isize) = (0, 0);

        loop {
            // Claim the next bin, or a new stride of bins.
            while advance {
                i -= 1;

                if i >= bound || finishing {
                    advance = false;
                    continue;
                }

                let next_index = self.transfer_index.load(Ordering::SeqCst);
                if next_index <= 0 {
                    i = -1;
                    advance = false;
                    continue;
                }

                let next_bound = if next_index > stride {
                    next_index - stride
                } else {
                    0
                };

                if self
                    .transfer_index
                    .compare_exchange(next_index, next_bound, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    bound = next_bound;
                    i = next_index - 1;
                    advance = false;
                }
            }

            if i < 0 || i as usize >= n {
                if finishing {
                    self.next_table.store(ptr::null_mut(), Ordering::SeqCst);
                    self.table.store(next, Ordering::SeqCst);
                    self.size_ctl.store(threshold(n << 1), Ordering::SeqCst);

                    // Safety: Every bin of the old table was moved, and the table is no
                    // longer reachable from the map.
                    unsafe { guard.defer_retire(table, reclaim_table::<K, V>) };

                    trace!("finished resizing table from {n} to {}", n << 1);
                    return;
                }

                let sc = self.size_ctl.load(Ordering::SeqCst);
                if self
                    .size_ctl
                    .compare_exchange(sc, sc - 1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    // We are not the last resizer.
                    if sc - 2 != resize_stamp(n) {
                        return;
                    }

                    // Recheck every bin before committing.
                    finishing = true;
                    advance = true;
                    i = n as isize;
                }

                continue;
            }

            let i = i as usize;
            let slot = old.slot(i);

            advance = match slot.load::<K, V>(guard) {
                Bin::Empty => slot.cas_empty(Bin::Moved(next)),

                // Already processed.
                Bin::Moved(_) => true,

                _ => {
                    let _lock = slot.lock.lock();

                    match slot.load::<K, V>(guard) {
                        Bin::Chain(head) => {
                            let (mut lo, mut hi, mut nodes) = (Vec::new(), Vec::new(), Vec::new());

                            // Safety: We hold the bin lock.
                            for node in unsafe { Chain::new(head, guard) } {
                                // Safety: Nodes reference valid entries.
                                let hash = unsafe { (*node.entry).hash };
                                if hash & (n as u64) == 0 {
                                    lo.push(node.entry);
                                } else {
                                    hi.push(node.entry);
                                }

                                nodes.push(node as *const Node<K, V> as *mut Node<K, V>);
                            }

                            new.slot(i).store(Bin::Chain(Node::chain(lo.into_iter())));
                            new.slot(i + n).store(Bin::Chain(Node::chain(hi.into_iter())));
                            slot.store(Bin::Moved(next));

                            for node in nodes {
                                // Safety: The old chain is unreachable from the table.
                                unsafe { guard.defer_retire(node, reclaim_node::<K, V>) };
                            }

                            true
                        }

                        Bin::Tree(tree_ptr) => {
                            // Safety: We hold the bin lock.
                            let tree = unsafe { &*tree_ptr };

                            let (lo, hi): (Vec<_>, Vec<_>) = tree
                                .entries(guard)
                                .into_iter()
                                // Safety: Trees reference valid entries.
                                .partition(|&entry| unsafe { (*entry).hash } & (n as u64) == 0);

                            // Reuse the tree if every entry lands in the same bin.
                            let reuse = lo.is_empty() || hi.is_empty();

                            new.slot(i).store(split_bin(lo, tree_ptr, reuse));
                            new.slot(i + n).store(split_bin(hi, tree_ptr, reuse));
                            slot.store(Bin::Moved(next));

                            let reused = reuse && tree.len() > UNTREEIFY_THRESHOLD;
                            if !reused {
                                // Safety: The tree is unreachable from either table.
                                unsafe { guard.defer_retire(tree_ptr, reclaim_tree_bin::<K, V>) };
                            }

                            true
                        }

                        // A racing insert may beat us to the empty bin.
                        Bin::Empty => slot.cas_empty(Bin::Moved(next)),

                        Bin::Moved(_) => true,

                        // Reservations are only held under the bin lock.
                        Bin::Reserved => false,
                    }
                }
            };
        }
    }

    // Converts the chain at the given bin to a tree, or grows the table if it is
    // too small.
    #[cold]
    #[inline(never)]
    pub(super) fn treeify_bin(
        &self,
        table: *mut RawTable<K, V>,
        i: usize,
        guard: &impl Guard,
    ) -> Result<(), Error> {
        if Computing::active(self.id()) {
            return Ok(());
        }

        // Safety: The table was loaded through our guard.
        let table = unsafe { &*table };
        let n = table.len();

        if n < MIN_TREEIFY_CAPACITY {
            return self.try_presize(n << 1, guard);
        }

        let slot = table.slot(i);
        if !matches!(slot.load::<K, V>(guard), Bin::Chain(_)) {
            return Ok(());
        }

        let _lock = slot.lock.lock();

        // The bin may have changed before we acquired the lock.
        let Bin::Chain(head) = slot.load::<K, V>(guard) else {
            return Ok(());
        };

        let (mut entries, mut nodes) = (Vec::new(), Vec::new());
        // Safety: We hold the bin lock.
        for node in unsafe { Chain::new(head, guard) } {
            entries.push(node.entry);
            nodes.push(node as *const Node<K, V> as *mut Node<K, V>);
        }

        slot.store(Bin::Tree(TreeBin::alloc(&entries, self.key_order)));

        for node in nodes {
            // Safety: The chain is unreachable from the table.
            unsafe { guard.defer_retire(node, reclaim_node::<K, V>) };
        }

        trace!("treeified bin {i} with {} entries", entries.len());
        Ok(())
    }
}

// Builds one half of a split tree bin.
fn split_bin<K, V>(entries: Vec<*mut Entry<K, V>>, tree: *mut TreeBin<K, V>, reuse: bool) -> Bin<K, V> {
    if entries.len() <= UNTREEIFY_THRESHOLD {
        Bin::Chain(Node::chain(entries.into_iter()))
    } else if reuse {
        Bin::Tree(tree)
    } else {
        // Safety: The tree is only reclaimed after the split.
        Bin::Tree(TreeBin::alloc(&entries, unsafe { (*tree).order() }))
    }
}
