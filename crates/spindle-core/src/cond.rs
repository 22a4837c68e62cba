//! Condition variables.
//!
//! Wait/signal/broadcast over one sequence-counter futex word, with the
//! user mutex bound on first wait. Binding the mutex lets signal and
//! broadcast skip any requeue logic while keeping the invariant that the
//! mutex is held again when `wait` returns. Single signals are counted and
//! consumed one wake at a time; broadcasts advance a generation that every
//! parked waiter observes.
//!
//! An all-zero `Cond` is a valid fresh condition variable.

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::Result;
use crate::errno::{EINTR, EINVAL};
use crate::futex::{RawFutex, futex_wait, futex_wake, futex_wake_all};
use crate::mutex::Mutex;

/// A condition variable.
#[repr(C)]
pub struct Cond {
    /// Internal lock guarding every counter below.
    lock: RawFutex,
    /// Sequence word waiters sleep on; bumped by signal and broadcast.
    futex: AtomicU32,
    /// Threads currently parked in `wait`.
    waiters: AtomicU32,
    /// Signals sent but not yet consumed by a waking waiter.
    pending_signals: AtomicU32,
    /// Broadcast generation; a parked waiter that sees it advance wakes.
    broadcast_seq: AtomicU32,
    /// The mutex bound to this condvar while anyone waits (0 = unbound).
    mutex: AtomicUsize,
}

// SAFETY: all state is atomic and serialized by `lock`.
unsafe impl Send for Cond {}
unsafe impl Sync for Cond {}

impl Cond {
    /// A fresh condition variable; all-zero representation.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            lock: RawFutex::new(),
            futex: AtomicU32::new(0),
            waiters: AtomicU32::new(0),
            pending_signals: AtomicU32::new(0),
            broadcast_seq: AtomicU32::new(0),
            mutex: AtomicUsize::new(0),
        }
    }

    /// Atomically release `mutex`, wait to be signalled, and re-acquire
    /// `mutex` before returning.
    ///
    /// Every concurrent waiter must pass the same mutex; a mismatch is
    /// `Err(EINVAL)`. The mutex must be held by the caller (a failing
    /// unlock is reported as-is).
    pub fn wait(&self, mutex: &Mutex) -> Result<()> {
        self.lock.lock();

        let mutex_addr = mutex as *const Mutex as usize;
        if self.mutex.load(Ordering::SeqCst) == 0 {
            self.mutex.store(mutex_addr, Ordering::SeqCst);
        }
        if self.mutex.load(Ordering::SeqCst) != mutex_addr {
            self.unbind_if_idle();
            self.lock.unlock();
            return Err(EINVAL);
        }

        if let Err(e) = mutex.unlock() {
            self.unbind_if_idle();
            self.lock.unlock();
            return Err(e);
        }

        self.waiters.fetch_add(1, Ordering::SeqCst);
        let bseq = self.broadcast_seq.load(Ordering::SeqCst);
        let seq = self.futex.load(Ordering::SeqCst);
        self.lock.unlock();

        // Not a cancellation point: the waiter count and the mutex binding
        // below must be unwound by this function, and the mutex must be
        // held again when it returns.
        loop {
            if let Err(EINTR) = futex_wait(&self.futex, seq) {
                continue;
            }

            self.lock.lock();
            if self.pending_signals.load(Ordering::SeqCst) > 0 {
                self.pending_signals.fetch_sub(1, Ordering::SeqCst);
                break;
            }
            if bseq != self.broadcast_seq.load(Ordering::SeqCst) {
                break;
            }
            self.lock.unlock();
        }

        self.waiters.fetch_sub(1, Ordering::SeqCst);
        self.unbind_if_idle();
        self.lock.unlock();

        mutex.lock()
    }

    /// Wake one waiter. A signal sent with every waiter already due to wake
    /// is dropped, so signals never accumulate beyond the waiting crowd.
    pub fn signal(&self) -> Result<()> {
        self.lock.lock();
        if self.waiters.load(Ordering::SeqCst) != self.pending_signals.load(Ordering::SeqCst) {
            self.futex.fetch_add(1, Ordering::SeqCst);
            self.pending_signals.fetch_add(1, Ordering::SeqCst);
            futex_wake(&self.futex, 1);
        }
        self.lock.unlock();
        Ok(())
    }

    /// Wake every waiter currently parked.
    pub fn broadcast(&self) -> Result<()> {
        self.lock.lock();
        if self.waiters.load(Ordering::SeqCst) != 0 {
            self.futex.fetch_add(1, Ordering::SeqCst);
            self.broadcast_seq.fetch_add(1, Ordering::SeqCst);
            futex_wake_all(&self.futex);
        }
        self.lock.unlock();
        Ok(())
    }

    /// Clear the mutex binding once the last waiter has left. Caller holds
    /// the internal lock.
    fn unbind_if_idle(&self) {
        if self.waiters.load(Ordering::SeqCst) == 0 {
            self.mutex.store(0, Ordering::SeqCst);
        }
    }
}

impl Default for Cond {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime;
    use crate::thread::{self, Attr};
    use core::time::Duration;

    #[test]
    fn signal_and_broadcast_without_waiters_are_noops() {
        runtime::init().unwrap();
        let cond = Cond::new();
        cond.signal().unwrap();
        cond.broadcast().unwrap();
        assert_eq!(cond.pending_signals.load(Ordering::SeqCst), 0);
        assert_eq!(cond.futex.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn zeroed_bytes_are_a_fresh_condvar() {
        runtime::init().unwrap();
        // SAFETY: Cond is repr(C) over atomics; zero is valid for all.
        let cond: Cond = unsafe { core::mem::zeroed() };
        cond.signal().unwrap();
        assert_eq!(cond.mutex.load(Ordering::SeqCst), 0);
    }

    struct Shared {
        mutex: Mutex,
        cond: Cond,
        value: AtomicU32,
    }

    extern "C" fn waiter(arg: usize) -> usize {
        // SAFETY: arg is a pointer to a Shared that outlives the thread.
        let shared = unsafe { &*(arg as *const Shared) };
        shared.mutex.lock().unwrap();
        while shared.value.load(Ordering::SeqCst) == 0 {
            shared.cond.wait(&shared.mutex).unwrap();
        }
        let seen = shared.value.load(Ordering::SeqCst);
        shared.mutex.unlock().unwrap();
        seen as usize
    }

    #[test]
    fn wait_observes_signalled_predicate() {
        runtime::init().unwrap();
        let shared = Box::leak(Box::new(Shared {
            mutex: Mutex::new(),
            cond: Cond::new(),
            value: AtomicU32::new(0),
        }));

        let t = thread::create(&Attr::new(), waiter, shared as *const Shared as usize).unwrap();

        // Let the waiter park, then publish under the mutex and signal.
        thread::sleep(Duration::from_millis(20));
        shared.mutex.lock().unwrap();
        shared.value.store(33, Ordering::SeqCst);
        shared.mutex.unlock().unwrap();
        shared.cond.signal().unwrap();

        assert_eq!(thread::join(t), Ok(33));
        // Last waiter gone: the binding is released.
        assert_eq!(shared.mutex_addr_for_test(), 0);
    }

    impl Shared {
        fn mutex_addr_for_test(&self) -> usize {
            self.cond.mutex.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn mismatched_mutex_is_rejected() {
        runtime::init().unwrap();
        let shared = Box::leak(Box::new(Shared {
            mutex: Mutex::new(),
            cond: Cond::new(),
            value: AtomicU32::new(0),
        }));
        let other = Mutex::new();

        let t = thread::create(&Attr::new(), waiter, shared as *const Shared as usize).unwrap();
        thread::sleep(Duration::from_millis(20));

        // A second waiter carrying a different mutex must be turned away.
        other.lock().unwrap();
        assert_eq!(shared.cond.wait(&other), Err(EINVAL));
        other.unlock().unwrap();

        shared.mutex.lock().unwrap();
        shared.value.store(1, Ordering::SeqCst);
        shared.mutex.unlock().unwrap();
        shared.cond.broadcast().unwrap();
        assert_eq!(thread::join(t), Ok(1));
    }
}
