use super::table::RawTable;
use super::{HashMap, Traverser};

// A table shared with the workers of a bulk operation.
struct SendTable<K, V> {
    ptr: *mut RawTable<K, V>,
    len: usize,
}

// Safety: The table is only accessed through atomic loads and guards, and the
// caller of a bulk operation keeps it alive until every worker has returned.
unsafe impl<K: Send + Sync, V: Send + Sync> Send for SendTable<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for SendTable<K, V> {}

impl<K, V, S> HashMap<K, V, S>
where
    K: Send + Sync,
    V: Send + Sync,
    S: Sync,
{
    // Runs a bulk operation over every entry of the map.
    //
    // The bins are split into ranges, each passed to `leaf` as an iterator over its
    // entries. The results are merged with `combine`. With a threshold of `u64::MAX`
    // the whole map is processed by a single leaf on the current thread.
    pub fn bulk<R, L, C>(&self, threshold: u64, leaf: L, combine: C) -> R
    where
        R: Send,
        L: Fn(&mut dyn Iterator<Item = (&K, &V)>) -> R + Sync,
        C: Fn(R, R) -> R + Sync,
    {
        // Keep the base table alive for the duration of the operation. Anything retired
        // while this guard is active outlives it.
        let guard = self.guard();

        let ptr = self.root(&guard);
        let len = if ptr.is_null() {
            0
        } else {
            // Safety: The table was loaded through our guard.
            unsafe { (*ptr).len() }
        };

        let table = SendTable { ptr, len };
        let batch = self.batch_for(threshold);

        self.split(&table, 0, len, batch, &leaf, &combine)
    }

    // Returns the number of times to split a bulk operation, or 0 to run it on
    // the current thread.
    fn batch_for(&self, threshold: u64) -> usize {
        if threshold == u64::MAX {
            return 0;
        }

        let n = self.len() as u64;
        if n <= 1 || n < threshold {
            return 0;
        }

        let parallelism = rayon::current_num_threads() << 2;
        if threshold == 0 || n / threshold >= parallelism as u64 {
            parallelism
        } else {
            (n / threshold) as usize
        }
    }

    fn split<R, L, C>(
        &self,
        table: &SendTable<K, V>,
        lo: usize,
        hi: usize,
        batch: usize,
        leaf: &L,
        combine: &C,
    ) -> R
    where
        R: Send,
        L: Fn(&mut dyn Iterator<Item = (&K, &V)>) -> R + Sync,
        C: Fn(R, R) -> R + Sync,
    {
        let mid = (lo + hi) >> 1;

        if batch > 0 && mid > lo {
            let (left, right) = rayon::join(
                || self.split(table, lo, mid, batch >> 1, leaf, combine),
                || self.split(table, mid, hi, batch >> 1, leaf, combine),
            );

            return combine(left, right);
        }

        let guard = self.guard();

        // Safety: The table is kept alive by the guard of the calling thread.
        let entries = unsafe { Traverser::new(table.ptr, table.len, lo, hi, &guard) };
        let mut entries = entries.map(|entry| (&entry.key, entry.value(&guard)));

        leaf(&mut entries)
    }
}
