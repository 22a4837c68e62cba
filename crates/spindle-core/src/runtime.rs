//! Runtime lifecycle and process-wide state.
//!
//! One explicit `init`/`finit` pair brackets everything: `init` records the
//! process id, installs the cancellation signal handler, and registers the
//! calling thread with the descriptor pool; `finit` undoes the caller's
//! registration and restores the thread-pointer base that was saved at
//! adoption.
//!
//! Threads the runtime did not create (the main thread, host test-harness
//! threads) become usable by calling [`init`] or [`ensure_thread`] — both
//! are idempotent per thread.

use core::sync::atomic::{AtomicI32, AtomicU32, AtomicUsize, Ordering};

use crate::syscall::{self, ARCH_GET_GS, ARCH_SET_GS};
use crate::thread::descriptor::{self, Descriptor, Thread};
use crate::{Result, cancel, signal};

/// The cancellation signal: the first realtime signal not reserved by the
/// host libc.
pub const SIGCANCEL: i32 = 34;

const INIT_NEW: u32 = 0;
const INIT_IN_PROGRESS: u32 = 1;
const INIT_DONE: u32 = 2;

static PROCESS_INIT: AtomicU32 = AtomicU32::new(INIT_NEW);
static PID: AtomicI32 = AtomicI32::new(0);
/// GS base observed before the first adoption, restored by `finit`.
static SAVED_GS: AtomicUsize = AtomicUsize::new(0);
/// Descriptor of the first adopted thread, freed by `finit`.
static FIRST_ADOPTED: AtomicUsize = AtomicUsize::new(0);

/// This process's id, as recorded at [`init`].
#[inline]
#[must_use]
pub fn pid() -> i32 {
    PID.load(Ordering::SeqCst)
}

/// Initialize the runtime and register the calling thread.
///
/// Idempotent: later calls (from any thread) only perform the per-thread
/// registration. Must complete on some thread before any other runtime API
/// is used.
pub fn init() -> Result<()> {
    match PROCESS_INIT.compare_exchange(
        INIT_NEW,
        INIT_IN_PROGRESS,
        Ordering::SeqCst,
        Ordering::SeqCst,
    ) {
        Ok(_) => {
            PID.store(syscall::sys_getpid(), Ordering::SeqCst);
            if let Err(e) =
                signal::install_siginfo_handler(SIGCANCEL, cancel::cancel_signal_handler)
            {
                PROCESS_INIT.store(INIT_NEW, Ordering::SeqCst);
                return Err(e);
            }
            PROCESS_INIT.store(INIT_DONE, Ordering::SeqCst);
        }
        Err(_) => {
            while PROCESS_INIT.load(Ordering::SeqCst) == INIT_IN_PROGRESS {
                core::hint::spin_loop();
            }
        }
    }
    ensure_thread();
    Ok(())
}

/// Register the calling thread with the runtime if it is not registered
/// yet, returning its handle.
///
/// Threads created by [`crate::thread::create`] are registered by their
/// trampoline; this is for threads that entered the process some other way.
pub fn ensure_thread() -> Thread {
    let mut gs_base: usize = 0;
    // SAFETY: ARCH_GET_GS writes the current GS base to the given address.
    let _ = unsafe {
        syscall::sys_arch_prctl(ARCH_GET_GS, &mut gs_base as *mut usize as usize)
    };
    if gs_base != 0 {
        return Thread(gs_base as *mut Descriptor);
    }

    let thread = descriptor::adopt_current();
    if FIRST_ADOPTED
        .compare_exchange(0, thread.as_usize(), Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
    {
        SAVED_GS.store(gs_base, Ordering::SeqCst);
    }
    thread
}

/// Tear down the calling thread's registration and restore the saved
/// thread-pointer base.
///
/// Must be called by the thread that first initialized the runtime, after
/// every runtime thread has been joined or has exited. No runtime API may
/// be used by this thread afterwards.
pub fn finit() {
    let raw = FIRST_ADOPTED.swap(0, Ordering::SeqCst);
    if raw == 0 {
        return;
    }
    let desc = raw as *mut Descriptor;

    descriptor::pool_lock();
    // SAFETY: pool mutex held. The descriptor leaves the pool entirely —
    // it is about to be deallocated, so it must not reach the free list.
    unsafe {
        let pool = descriptor::pool();
        if let Some(idx) = pool.used.iter().position(|&d| d == desc) {
            pool.used.swap_remove(idx);
        }
    }
    descriptor::pool_unlock();

    // SAFETY: restoring the base recorded before adoption; after this the
    // thread is no longer a runtime thread.
    let _ = unsafe { syscall::sys_arch_prctl(ARCH_SET_GS, SAVED_GS.load(Ordering::SeqCst)) };
    // SAFETY: the descriptor came from Box::leak at adoption and is now
    // unreachable from the pool.
    unsafe { drop(Box::from_raw(desc)) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init().unwrap();
        init().unwrap();
        assert!(pid() > 0);
        assert_eq!(pid(), syscall::sys_getpid());
    }

    #[test]
    fn ensure_thread_returns_stable_handle() {
        init().unwrap();
        let a = ensure_thread();
        let b = ensure_thread();
        assert_eq!(a, b);
        assert_eq!(crate::thread::descriptor::current(), a);
    }
}
