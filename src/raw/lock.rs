use std::cell::RefCell;
use std::hint;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

// A futex-based mutex guarding a single bin.
//
// The lock remembers its owning thread so that a thread attempting to acquire a
// bin it already holds (for example, from inside a compute callback) can fail
// instead of deadlocking.
pub struct BinLock {
    // 0: unlocked, 1: locked, 2: locked with waiters.
    state: AtomicU32,

    // The token of the owning thread, or 0 if unlocked.
    owner: AtomicUsize,
}

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const CONTENDED: u32 = 2;

impl Default for BinLock {
    fn default() -> BinLock {
        BinLock::new()
    }
}

impl BinLock {
    pub const fn new() -> BinLock {
        BinLock {
            state: AtomicU32::new(UNLOCKED),
            owner: AtomicUsize::new(0),
        }
    }

    // Acquires the lock, blocking the current thread until it is available.
    #[inline]
    pub fn lock(&self) -> BinLockGuard<'_> {
        if self
            .state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            self.lock_contended();
        }

        self.owner.store(thread_token(), Ordering::Relaxed);
        BinLockGuard { lock: self }
    }

    #[cold]
    #[inline(never)]
    fn lock_contended(&self) {
        // Avoid spinning in tests, which can hide race conditions.
        const SPIN: usize = if cfg!(any(test, debug_assertions)) {
            1
        } else {
            64
        };

        for _ in 0..SPIN {
            if self.state.load(Ordering::Relaxed) == UNLOCKED
                && self
                    .state
                    .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return;
            }

            hint::spin_loop();
        }

        // Mark the lock as contended so the owner wakes us when it unlocks.
        while self.state.swap(CONTENDED, Ordering::Acquire) != UNLOCKED {
            atomic_wait::wait(&self.state, CONTENDED);
        }
    }

    // Returns `true` if the current thread holds this lock.
    #[inline]
    pub fn held_by_current_thread(&self) -> bool {
        // Only the current thread ever stores its own token, so a relaxed
        // load cannot observe it unless we wrote it.
        self.owner.load(Ordering::Relaxed) == thread_token()
    }

    #[inline]
    fn unlock(&self) {
        self.owner.store(0, Ordering::Relaxed);

        if self.state.swap(UNLOCKED, Ordering::Release) == CONTENDED {
            atomic_wait::wake_one(&self.state);
        }
    }
}

// An acquired `BinLock`, released on drop.
//
// Releasing on drop means a panicking callback never leaves a bin locked.
pub struct BinLockGuard<'a> {
    lock: &'a BinLock,
}

impl Drop for BinLockGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

// Returns a non-zero token unique to the current thread for as long as it is alive.
#[inline]
fn thread_token() -> usize {
    thread_local! {
        static TOKEN: u8 = const { 0 };
    }

    TOKEN.with(|token| token as *const u8 as usize)
}

thread_local! {
    // The maps whose compute callbacks are currently running on this thread.
    static COMPUTING: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

// Marks the current thread as running a user callback on the map at `map`.
//
// While marked, the thread never starts or helps a resize of that map, as doing
// so could require the bin lock it is already holding.
pub struct Computing {
    map: usize,
}

impl Computing {
    #[inline]
    pub fn enter(map: usize) -> Computing {
        COMPUTING.with(|maps| maps.borrow_mut().push(map));
        Computing { map }
    }

    // Returns `true` if the current thread is inside a callback for the map at `map`.
    #[inline]
    pub fn active(map: usize) -> bool {
        COMPUTING.with(|maps| maps.borrow().contains(&map))
    }
}

impl Drop for Computing {
    #[inline]
    fn drop(&mut self) {
        COMPUTING.with(|maps| {
            let mut maps = maps.borrow_mut();
            if let Some(i) = maps.iter().rposition(|&map| map == self.map) {
                maps.remove(i);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::{BinLock, Computing};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn exclusive() {
        let lock = BinLock::new();
        let count = AtomicUsize::new(0);

        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..1000 {
                        let _guard = lock.lock();
                        // Non-atomic read-modify-write, protected by the lock.
                        let value = count.load(Ordering::Relaxed);
                        count.store(value + 1, Ordering::Relaxed);
                    }
                });
            }
        });

        assert_eq!(count.load(Ordering::Relaxed), 4000);
    }

    #[test]
    fn owner() {
        let lock = BinLock::new();
        assert!(!lock.held_by_current_thread());

        let guard = lock.lock();
        assert!(lock.held_by_current_thread());
        thread::scope(|s| {
            s.spawn(|| assert!(!lock.held_by_current_thread()));
        });

        drop(guard);
        assert!(!lock.held_by_current_thread());
    }

    #[test]
    fn unlock_on_panic() {
        let lock = BinLock::new();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = lock.lock();
            panic!("callback failed");
        }));

        assert!(result.is_err());
        drop(lock.lock());
    }

    #[test]
    fn computing_nests() {
        assert!(!Computing::active(1));
        let outer = Computing::enter(1);
        let inner = Computing::enter(2);
        assert!(Computing::active(1));
        assert!(Computing::active(2));
        drop(inner);
        assert!(!Computing::active(2));
        drop(outer);
        assert!(!Computing::active(1));
    }
}
