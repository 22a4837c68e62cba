//! The runtime's low-level futex lock.
//!
//! A single 32-bit word used as a 0/1 lock: acquire is a CAS 0→1 with a
//! `FUTEX_WAIT` slow path, release is a CAS 1→0 followed by waking one
//! waiter. No fairness, no recursion, no priority awareness — it exists to
//! guard the runtime's own small critical sections (descriptor pool
//! internals, per-thread owned-mutex lists, condvar and rwlock state, the
//! heap, print serialization). It is not part of the user-facing lock
//! hierarchy and is never a cancellation point.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::syscall::{self, FUTEX_PRIVATE_FLAG, FUTEX_WAIT, FUTEX_WAKE};

/// Block on `word` while it holds `expected`.
///
/// Returns `Ok(())` on a wake, `Err(EAGAIN)` if the value already changed,
/// `Err(EINTR)` if a signal interrupted the wait. Callers loop.
#[inline]
pub fn futex_wait(word: &AtomicU32, expected: u32) -> Result<(), i32> {
    // SAFETY: word is a valid, aligned u32 for the duration of the call.
    let ret = unsafe {
        syscall::sys_futex(
            word.as_ptr(),
            FUTEX_WAIT | FUTEX_PRIVATE_FLAG,
            expected,
            0,
            0,
            0,
        )
    };
    ret.map(|_| ())
}

/// Wake up to `count` waiters blocked on `word`. Returns the number woken.
#[inline]
pub fn futex_wake(word: &AtomicU32, count: u32) -> usize {
    // SAFETY: word is a valid, aligned u32 for the duration of the call.
    let ret = unsafe {
        syscall::sys_futex(
            word.as_ptr(),
            FUTEX_WAKE | FUTEX_PRIVATE_FLAG,
            count,
            0,
            0,
            0,
        )
    };
    ret.map_or(0, |n| n as usize)
}

/// Wake every waiter blocked on `word`.
#[inline]
pub fn futex_wake_all(word: &AtomicU32) -> usize {
    futex_wake(word, u32::MAX)
}

/// 0/1 futex-backed lock.
///
/// The all-zero value is the unlocked state, so a `RawFutex` embedded in a
/// zero-initialized structure is ready to use.
#[repr(transparent)]
pub struct RawFutex(AtomicU32);

impl RawFutex {
    /// New unlocked lock.
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    /// Acquire, blocking in the kernel under contention.
    pub fn lock(&self) {
        loop {
            if self
                .0
                .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return;
            }
            let _ = futex_wait(&self.0, 1);
        }
    }

    /// Acquire only if free; `Err(EBUSY)` otherwise.
    pub fn try_lock(&self) -> Result<(), i32> {
        if self
            .0
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            Ok(())
        } else {
            Err(crate::errno::EBUSY)
        }
    }

    /// Release and wake one waiter.
    pub fn unlock(&self) {
        if self
            .0
            .compare_exchange(1, 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            futex_wake(&self.0, 1);
        }
    }

    /// Force the word back to the unlocked state without waking anyone.
    /// Used when recycling a descriptor whose lock is known to be idle.
    pub(crate) fn reset(&self) {
        self.0.store(0, Ordering::SeqCst);
    }
}

impl Default for RawFutex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_unlock_cycle() {
        let lock = RawFutex::new();
        lock.lock();
        lock.unlock();
        lock.lock();
        lock.unlock();
    }

    #[test]
    fn try_lock_reports_contention() {
        let lock = RawFutex::new();
        assert_eq!(lock.try_lock(), Ok(()));
        assert_eq!(lock.try_lock(), Err(crate::errno::EBUSY));
        lock.unlock();
        assert_eq!(lock.try_lock(), Ok(()));
        lock.unlock();
    }

    #[test]
    fn wait_on_changed_value_returns_immediately() {
        let word = AtomicU32::new(7);
        // Expected value mismatch: the kernel returns EAGAIN right away.
        assert_eq!(futex_wait(&word, 3), Err(crate::errno::EAGAIN));
    }

    #[test]
    fn contended_lock_excludes_concurrently() {
        use std::sync::Arc;
        use std::sync::atomic::AtomicU64;

        let lock = Arc::new(RawFutex::new());
        let counter = Arc::new(AtomicU64::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            let counter = Arc::clone(&counter);
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    lock.lock();
                    // Non-atomic read-modify-write made safe by the lock.
                    let v = counter.load(Ordering::Relaxed);
                    counter.store(v + 1, Ordering::Relaxed);
                    lock.unlock();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 4000);
    }
}
