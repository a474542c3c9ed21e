//! Allocation-free recursive mutex guarding the ledger.
//!
//! `std::sync::Mutex` may allocate, which is off-limits for anything sitting
//! on the interposed malloc path. The raw lock is a three-state futex on
//! Linux and a spin lock elsewhere; on top of it sits an owner/recursion
//! count so a thread that re-enters the ledger (the side allocator can, in
//! edge cases, come back through library code) does not deadlock on itself.

use crate::platform;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

/// 0 = unlocked, 1 = locked no waiters, 2 = locked with waiters.
struct RawMutex {
    state: AtomicI32,
}

impl RawMutex {
    const fn new() -> Self {
        Self {
            state: AtomicI32::new(0),
        }
    }

    #[inline]
    fn lock(&self) {
        if self
            .state
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
        self.lock_slow();
    }

    #[cold]
    fn lock_slow(&self) {
        loop {
            let old = self.state.swap(2, Ordering::Acquire);
            if old == 0 {
                return;
            }
            #[cfg(target_os = "linux")]
            unsafe {
                libc::syscall(
                    libc::SYS_futex,
                    &self.state as *const AtomicI32,
                    libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                    2i32,
                    core::ptr::null::<libc::timespec>(),
                );
            }
            #[cfg(not(target_os = "linux"))]
            {
                core::hint::spin_loop();
            }
        }
    }

    #[inline]
    fn unlock(&self) {
        let old = self.state.fetch_sub(1, Ordering::Release);
        if old != 1 {
            self.state.store(0, Ordering::Release);
            self.wake_one();
        }
    }

    #[cold]
    fn wake_one(&self) {
        #[cfg(target_os = "linux")]
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                &self.state as *const AtomicI32,
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                1i32,
            );
        }
    }
}

/// A reentrant mutex wrapping data. The same thread may lock it any number
/// of times; the raw lock is released when the outermost guard drops.
pub struct RecursiveMutex<T> {
    raw: RawMutex,
    /// Thread id of the current owner, 0 when unlocked.
    owner: AtomicUsize,
    /// Nesting count; touched only by the owning thread.
    recursion: UnsafeCell<u32>,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for RecursiveMutex<T> {}
unsafe impl<T: Send> Sync for RecursiveMutex<T> {}

impl<T> RecursiveMutex<T> {
    pub const fn new(data: T) -> Self {
        Self {
            raw: RawMutex::new(),
            owner: AtomicUsize::new(0),
            recursion: UnsafeCell::new(0),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> RecursiveMutexGuard<'_, T> {
        let tid = platform::thread_id();
        if self.owner.load(Ordering::Relaxed) == tid {
            // Already held by this thread; just bump the nesting count.
            unsafe { *self.recursion.get() += 1 };
        } else {
            self.raw.lock();
            self.owner.store(tid, Ordering::Relaxed);
            unsafe { *self.recursion.get() = 1 };
        }
        RecursiveMutexGuard { mutex: self }
    }
}

pub struct RecursiveMutexGuard<'a, T> {
    mutex: &'a RecursiveMutex<T>,
}

impl<T> core::ops::Deref for RecursiveMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> core::ops::DerefMut for RecursiveMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for RecursiveMutexGuard<'_, T> {
    fn drop(&mut self) {
        unsafe {
            let recursion = self.mutex.recursion.get();
            *recursion -= 1;
            if *recursion == 0 {
                self.mutex.owner.store(0, Ordering::Relaxed);
                self.mutex.raw.unlock();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    #[test]
    fn relocking_from_the_same_thread_does_not_deadlock() {
        let mutex = RecursiveMutex::new(0u32);
        let outer = mutex.lock();
        {
            let mut inner = mutex.lock();
            *inner += 1;
        }
        assert_eq!(*outer, 1);
    }

    #[test]
    fn guard_releases_only_at_outermost_drop() {
        let mutex = Arc::new(RecursiveMutex::new(0u32));
        {
            let _a = mutex.lock();
            let _b = mutex.lock();
            let _c = mutex.lock();
        }
        // If the raw lock were still held the next lock would hang.
        let guard = mutex.lock();
        assert_eq!(*guard, 0);
    }

    #[test]
    fn excludes_other_threads() {
        const THREADS: usize = 8;
        const ITERATIONS: u32 = 10_000;

        let mutex = Arc::new(RecursiveMutex::new(0u64));
        let collisions = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let mutex = Arc::clone(&mutex);
                let collisions = Arc::clone(&collisions);
                std::thread::spawn(move || {
                    for _ in 0..ITERATIONS {
                        let mut guard = mutex.lock();
                        let seen = *guard;
                        *guard = seen + 1;
                        if *guard != seen + 1 {
                            collisions.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(collisions.load(Ordering::Relaxed), 0);
        assert_eq!(*mutex.lock(), (THREADS as u64) * ITERATIONS as u64);
    }
}
