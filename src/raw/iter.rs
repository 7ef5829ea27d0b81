use seize::Guard;

use super::node::{Chain, Entry};
use super::table::{Bin, RawTable};

// A weakly consistent traversal over the entries of a range of bins.
//
// When a forwarded bin is encountered, the traversal moves to the corresponding
// bins of the next table, `i` and `i + n`, before returning to the original table.
// Every entry present for the whole traversal is yielded exactly once, even if a
// resize runs concurrently.
pub struct Traverser<'g, K, V, G> {
    // The table currently being traversed.
    table: *mut RawTable<K, V>,

    // Saved positions in the tables we were forwarded from.
    stack: Vec<Forwarded<K, V>>,

    // The current bin.
    bin: BinIter<'g, K, V, G>,

    // The index of the next bin to load in `table`.
    index: usize,

    // The index of the next bin in the base table.
    base_index: usize,

    // The end of the range of base table bins.
    base_limit: usize,

    // The length of the base table.
    base_size: usize,

    guard: &'g G,
}

struct Forwarded<K, V> {
    table: *mut RawTable<K, V>,
    len: usize,
    index: usize,
}

enum BinIter<'g, K, V, G> {
    Empty,
    Chain(Chain<'g, K, V, G>),

    // Trees are snapshotted when the bin is loaded.
    Tree(std::vec::IntoIter<*mut Entry<K, V>>),
}

impl<'g, K, V, G: Guard> Traverser<'g, K, V, G> {
    // Creates a traverser over the bins `index..limit` of a table of length `size`.
    //
    // # Safety
    //
    // The table must be null or loaded through `guard`.
    pub unsafe fn new(
        table: *mut RawTable<K, V>,
        size: usize,
        index: usize,
        limit: usize,
        guard: &'g G,
    ) -> Traverser<'g, K, V, G> {
        Traverser {
            table,
            stack: Vec::new(),
            bin: BinIter::Empty,
            index,
            base_index: index,
            base_limit: limit,
            base_size: size,
            guard,
        }
    }

    // Restores the position after finishing the bins of a forwarded table.
    fn recover(&mut self, mut n: usize) {
        while let Some(saved) = self.stack.last() {
            self.index += saved.len;
            if self.index < n {
                return;
            }

            n = saved.len;
            self.index = saved.index;
            self.table = saved.table;
            self.stack.pop();
        }

        self.index += self.base_size;
        if self.index >= n {
            self.base_index += 1;
            self.index = self.base_index;
        }
    }
}

impl<'g, K: 'g, V: 'g, G: Guard> Iterator for Traverser<'g, K, V, G> {
    type Item = &'g Entry<K, V>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match &mut self.bin {
                BinIter::Chain(chain) => {
                    if let Some(node) = chain.next() {
                        // Safety: Nodes reference entries that are retired only
                        // after being unlinked, which our guard protects against.
                        return Some(unsafe { &*node.entry });
                    }
                }
                BinIter::Tree(entries) => {
                    if let Some(entry) = entries.next() {
                        // Safety: See above.
                        return Some(unsafe { &*entry });
                    }
                }
                BinIter::Empty => {}
            }

            self.bin = BinIter::Empty;

            if self.base_index >= self.base_limit || self.table.is_null() {
                return None;
            }

            // Safety: Tables are loaded through our guard.
            let table = unsafe { &*self.table };
            let (n, i) = (table.len(), self.index);
            if i >= n {
                return None;
            }

            match table.slot(i).load::<K, V>(self.guard) {
                Bin::Moved(next) => {
                    self.stack.push(Forwarded {
                        table: self.table,
                        len: n,
                        index: i,
                    });
                    self.table = next;
                    continue;
                }

                // Safety: The chain was loaded through our guard.
                Bin::Chain(head) => self.bin = BinIter::Chain(unsafe { Chain::new(head, self.guard) }),

                // Safety: The tree was loaded through our guard.
                Bin::Tree(tree) => {
                    self.bin = BinIter::Tree(unsafe { (*tree).entries(self.guard) }.into_iter())
                }

                Bin::Empty | Bin::Reserved => {}
            }

            if self.stack.is_empty() {
                self.index = i + self.base_size;
                if self.index >= n {
                    self.base_index += 1;
                    self.index = self.base_index;
                }
            } else {
                self.recover(n);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raw::node::Node;
    use crate::raw::table::drop_table;

    use seize::Collector;

    fn keys<G: Guard>(traverser: Traverser<'_, u64, u64, G>) -> Vec<u64> {
        let mut keys: Vec<_> = traverser.map(|entry| entry.key).collect();
        keys.sort();
        keys
    }

    #[test]
    fn follows_forwarded_bins() {
        let collector = Collector::new();
        let guard = collector.enter();

        let old = RawTable::<u64, u64>::alloc(2).unwrap();
        let new = RawTable::<u64, u64>::alloc(4).unwrap();

        unsafe {
            // Bin 0 was split into bins 0 and 2 of the next table.
            (*new).slot(0).store(Bin::<u64, u64>::Chain(Node::chain([Entry::alloc(0, 0, 0), Entry::alloc(4, 4, 4)].into_iter())));
            (*new).slot(2).store(Bin::<u64, u64>::Chain(Node::alloc(Entry::alloc(2, 2, 2))));
            (*old).slot(0).store(Bin::<u64, u64>::Moved(new));

            // Bin 1 has not been migrated yet.
            (*old).slot(1).store(Bin::<u64, u64>::Chain(Node::alloc(Entry::alloc(1, 1, 1))));
        }

        assert_eq!(keys(unsafe { Traverser::new(old, 2, 0, 2, &guard) }), [0, 1, 2, 4]);

        // Splitting the base range visits each entry once.
        assert_eq!(keys(unsafe { Traverser::new(old, 2, 0, 1, &guard) }), [0, 2, 4]);
        assert_eq!(keys(unsafe { Traverser::new(old, 2, 1, 2, &guard) }), [1]);

        // Traversing the next table directly.
        assert_eq!(keys(unsafe { Traverser::new(new, 4, 0, 4, &guard) }), [0, 2, 4]);

        drop(guard);
        unsafe {
            drop_table(old);
            drop_table(new);
        }
    }

    #[test]
    fn null_table() {
        let collector = Collector::new();
        let guard = collector.enter();
        let traverser = unsafe { Traverser::<u64, u64, _>::new(std::ptr::null_mut(), 0, 0, 0, &guard) };
        assert!(keys(traverser).is_empty());
    }
}
