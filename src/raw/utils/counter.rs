use std::sync::atomic::{AtomicIsize, Ordering};

use super::CachePadded;

// A striped atomic counter.
//
// Updates first attempt a single CAS on the base counter. Under contention the
// update falls back to a cell picked by the guard's thread ID, so concurrent
// writers rarely touch the same cache line.
pub struct Counter {
    base: CachePadded<AtomicIsize>,
    cells: Box<[CachePadded<AtomicIsize>]>,
}

impl Default for Counter {
    /// Create a new `Counter`.
    fn default() -> Counter {
        // Round up to the next power-of-two for fast modulo.
        let cells = (0..super::num_cpus().next_power_of_two())
            .map(|_| Default::default())
            .collect();

        Counter {
            base: Default::default(),
            cells,
        }
    }
}

impl Counter {
    // Adds `delta` to the counter.
    //
    // Returns `true` if the update was contended and had to fall back to a
    // striped cell.
    #[inline]
    pub fn add(&self, delta: isize, guard: &impl seize::Guard) -> bool {
        let base = self.base.value.load(Ordering::Relaxed);
        if self
            .base
            .value
            .compare_exchange(base, base + delta, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            return false;
        }

        // Guard thread IDs are allocated densely, which keeps cells
        // well distributed even with as many cells as CPUs.
        let cell = guard.thread_id() & (self.cells.len() - 1);
        self.cells[cell].value.fetch_add(delta, Ordering::Relaxed);
        true
    }

    // Returns the sum of the base counter and all cells.
    #[inline]
    pub fn sum(&self) -> usize {
        let cells = self
            .cells
            .iter()
            .map(|x| x.value.load(Ordering::Relaxed))
            .sum::<isize>();

        (self.base.value.load(Ordering::Relaxed) + cells)
            .try_into()
            // Depending on the order of deletion/insertions this might be negative,
            // in which case we assume the map is empty.
            .unwrap_or(0)
    }
}
