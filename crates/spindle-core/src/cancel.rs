//! Thread cancellation: state machine, signal pathway, cleanup handlers.
//!
//! Four bits in the descriptor's atomic `cancel_status` drive everything:
//!
//! - `ENABLED` / `DEFERRED` are independent switches the thread flips on
//!   itself.
//! - `CANCELING` is set (once) by `cancel()`; if the target is enabled and
//!   asynchronous, the cancellation signal is delivered via `tgkill` and the
//!   handler acts the moment it lands.
//! - `CANCELED` is set by `testcancel()` when it decides to act; the thread
//!   then exits with the cancellation sentinel, running cleanup handlers and
//!   TLS destructors on the way out.
//!
//! Deferred cancellation is only observed at cancellation points: explicit
//! `testcancel`, `thread::sleep`, and the retry loops of blocking
//! primitives that hold no accounting state across the sleep (NONE-protocol
//! mutex acquisition, the rwlock read side). Condvar wait, a queued writer,
//! and a boosting INHERIT waiter park with state that must be unwound on
//! the normal path, so those sleeps do not act on a pending cancel.

use core::sync::atomic::Ordering;

use crate::Result;
use crate::errno::{EAGAIN, ESRCH};
use crate::signal::SigInfo;
use crate::syscall;
use crate::thread::descriptor::{current, pool_contains_used, pool_lock, pool_unlock, Thread};
use crate::{runtime, thread};

/// Cancellation is enabled (acted upon at all).
pub(crate) const CANCEL_ENABLED: u8 = 1 << 0;
/// Cancellation is deferred to cancellation points (vs. asynchronous).
pub(crate) const CANCEL_DEFERRED: u8 = 1 << 1;
/// A cancel request is pending.
pub(crate) const CANCEL_CANCELING: u8 = 1 << 2;
/// The thread has committed to cancellation and is (or will be) gone.
pub(crate) const CANCEL_CANCELED: u8 = 1 << 3;

/// Return value of a thread that was cancelled.
pub const CANCELED_RETVAL: usize = usize::MAX;

/// Cancellation enable switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelState {
    Enable,
    Disable,
}

/// Cancellation delivery mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelType {
    Deferred,
    Asynchronous,
}

/// Flip one status bit on the calling thread; returns the previous setting.
fn set_status_bit(mask: u8, value: bool) -> bool {
    // SAFETY: the calling thread's descriptor is live.
    let status = unsafe { &(*current().descriptor()).cancel_status };
    loop {
        let old = status.load(Ordering::SeqCst);
        let new = if value { old | mask } else { old & !mask };
        if status
            .compare_exchange(old, new, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return old & mask != 0;
        }
    }
}

/// Enable or disable cancellation for the calling thread; returns the old
/// state. Enabling immediately observes a pending cancel.
pub fn setcancelstate(state: CancelState) -> Result<CancelState> {
    let was_enabled = set_status_bit(CANCEL_ENABLED, state == CancelState::Enable);
    if state == CancelState::Enable {
        testcancel();
    }
    Ok(if was_enabled {
        CancelState::Enable
    } else {
        CancelState::Disable
    })
}

/// Switch between deferred and asynchronous cancellation; returns the old
/// type. A pending cancel is observed immediately (switching to
/// asynchronous with a cancel pending exits here).
pub fn setcanceltype(ctype: CancelType) -> Result<CancelType> {
    let was_deferred = set_status_bit(CANCEL_DEFERRED, ctype == CancelType::Deferred);
    testcancel();
    Ok(if was_deferred {
        CancelType::Deferred
    } else {
        CancelType::Asynchronous
    })
}

/// Request cancellation of `thread`.
///
/// Idempotent: a thread that is already being cancelled is left alone. The
/// cancellation signal is only sent to enabled, asynchronous targets — a
/// deferred target discovers the request at its next cancellation point.
pub fn cancel(thread: Thread) -> Result<()> {
    let desc = thread.descriptor();
    pool_lock();
    // SAFETY: pool mutex held.
    if !unsafe { pool_contains_used(desc) } {
        pool_unlock();
        return Err(ESRCH);
    }

    // SAFETY: on the used list, so the descriptor belongs to a live thread.
    let (observed, tid) = unsafe {
        let status = &(*desc).cancel_status;
        let mut old;
        loop {
            old = status.load(Ordering::SeqCst);
            if old & CANCEL_CANCELING != 0 {
                pool_unlock();
                return Ok(());
            }
            if status
                .compare_exchange(old, old | CANCEL_CANCELING, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break;
            }
        }
        (old, (*desc).tid())
    };
    pool_unlock();

    // The signal is sent after the pool mutex is dropped: if the target is
    // the calling thread itself, the handler exits right here and the exit
    // path needs that mutex.
    if observed & CANCEL_ENABLED != 0 && observed & CANCEL_DEFERRED == 0 {
        let _ = syscall::sys_tgkill(runtime::pid(), tid, runtime::SIGCANCEL);
    }
    Ok(())
}

/// Act on a pending cancellation request, if any.
///
/// When the calling thread is enabled, canceling, and not yet canceled,
/// this marks it canceled and exits it with [`CANCELED_RETVAL`]; otherwise
/// it returns.
pub fn testcancel() {
    // SAFETY: the calling thread's descriptor is live.
    let status = unsafe { &(*current().descriptor()).cancel_status };
    loop {
        let old = status.load(Ordering::SeqCst);
        if old & CANCEL_ENABLED == 0
            || old & CANCEL_CANCELING == 0
            || old & CANCEL_CANCELED != 0
        {
            return;
        }
        if status
            .compare_exchange(
                old,
                old | CANCEL_CANCELED,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
        {
            break;
        }
    }
    thread::exit(CANCELED_RETVAL);
}

/// Disable cancellation without the immediate-test semantics of
/// [`setcancelstate`]; used by the exit path and `once` transitions.
pub(crate) fn disable_quietly() -> bool {
    set_status_bit(CANCEL_ENABLED, false)
}

/// Re-enable cancellation (without testing).
pub(crate) fn enable_quietly() {
    set_status_bit(CANCEL_ENABLED, true);
}

// -------------------------------------------------------------------------
// Cleanup handlers
// -------------------------------------------------------------------------

/// Push a cleanup handler onto the calling thread's LIFO stack.
///
/// Handlers run on cancellation and on normal exit, most recent first.
/// `Err(EAGAIN)` when the fixed-capacity stack is full.
pub fn cleanup_push(func: extern "C" fn(usize), arg: usize) -> Result<()> {
    // SAFETY: the cleanup stack is only ever touched by its owning thread.
    unsafe {
        let stack = &mut *(*current().descriptor()).cleanup.get();
        if stack.depth == stack.entries.len() {
            return Err(EAGAIN);
        }
        stack.entries[stack.depth] =
            Some(crate::thread::descriptor::CleanupEntry { func, arg });
        stack.depth += 1;
    }
    Ok(())
}

/// Pop the most recent cleanup handler, running it if `execute` is true.
/// Popping an empty stack is a no-op.
pub fn cleanup_pop(execute: bool) {
    // SAFETY: owner-thread only, as above.
    let entry = unsafe {
        let stack = &mut *(*current().descriptor()).cleanup.get();
        if stack.depth == 0 {
            return;
        }
        stack.depth -= 1;
        stack.entries[stack.depth].take()
    };
    if let Some(e) = entry {
        if execute {
            (e.func)(e.arg);
        }
    }
}

/// Drain the cleanup stack, executing every handler in LIFO order.
pub(crate) fn run_cleanup_handlers() {
    loop {
        // SAFETY: owner-thread only.
        let entry = unsafe {
            let stack = &mut *(*current().descriptor()).cleanup.get();
            if stack.depth == 0 {
                return;
            }
            stack.depth -= 1;
            stack.entries[stack.depth].take()
        };
        if let Some(e) = entry {
            (e.func)(e.arg);
        }
    }
}

// -------------------------------------------------------------------------
// Signal handler
// -------------------------------------------------------------------------

/// `si_code` for signals sent with tgkill.
const SI_TKILL: i32 = -6;

/// The SIGCANCEL handler.
///
/// Accepts only the cancellation signal, sent by this process, via tgkill.
/// If the thread is currently in deferred mode the handler does nothing:
/// the signal is only ever sent to asynchronous targets, but the mode may
/// have changed between send and delivery, and a deferred thread must not
/// be torn down at an arbitrary instruction.
pub(crate) extern "C" fn cancel_signal_handler(
    sig: i32,
    info: *mut SigInfo,
    _ctx: *mut core::ffi::c_void,
) {
    if sig != runtime::SIGCANCEL || info.is_null() {
        return;
    }
    // SAFETY: the kernel hands us a valid siginfo for the delivered signal.
    let (si_pid, si_code) = unsafe { ((*info).si_pid, (*info).si_code) };
    if si_pid != runtime::pid() || si_code != SI_TKILL {
        return;
    }

    // SAFETY: the signal was addressed to a runtime thread, so gs:[0] holds
    // its descriptor.
    let status = unsafe { &(*current().descriptor()).cancel_status };
    if status.load(Ordering::SeqCst) & CANCEL_DEFERRED != 0 {
        return;
    }
    testcancel();
}
