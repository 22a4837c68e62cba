//! Thread descriptors and the process-wide descriptor pool.
//!
//! Every runtime thread owns one [`Descriptor`]: identity, stack, status
//! bits, owned-mutex lists, cleanup stack, and TLS slots. Descriptors are
//! heap-allocated once and recycled through a used/free pool guarded by a
//! single NORMAL mutex; storage is never returned to the allocator.
//!
//! The calling thread finds its own descriptor through the GS segment base:
//! the descriptor's first field is its own address, and the base is pointed
//! at the descriptor when the thread enters the runtime (clone trampoline or
//! adoption), so [`current`] is a single `mov reg, gs:[0]`.
//!
//! ## Recycling
//!
//! The kernel's `CLONE_CHILD_CLEARTID` clears the descriptor's exit-futex
//! word and wakes waiters when the thread truly exits. A descriptor popped
//! from the free list is handed out only after that word reads zero, so a
//! recycled descriptor can never alias a live kernel task.

use core::arch::asm;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU8, AtomicU16, AtomicU32, AtomicUsize, Ordering};

use crate::cell::RacyCell;
use crate::futex::{RawFutex, futex_wait};
use crate::mutex::Mutex;
use crate::syscall;
use crate::tls::MAX_KEYS;

/// Cleanup-handler stack capacity per thread.
pub const CLEANUP_MAX: usize = 32;

// Join status values.
pub const JOIN_DETACHED: u8 = 0;
pub const JOIN_JOINABLE: u8 = 1;
/// Joinable and the status can no longer change (claimed or exiting).
pub const JOIN_FIXED: u8 = 2;

// Start gate values, observed by the clone trampoline.
pub const START_OK: u32 = 0;
pub const START_WAIT: u32 = 1;
pub const START_EXIT: u32 = 2;

/// Pre-clone value of the exit-futex word. The kernel overwrites it with
/// the TID before the child runs and clears it to zero on exit; it is never
/// a valid TID of ours (TID 1 is init).
pub(crate) const TID_PRESEED: u32 = 1;

/// A user thread entry point.
pub type StartFn = extern "C" fn(usize) -> usize;

/// One per-thread TLS slot: `{generation, value}`.
#[derive(Clone, Copy)]
pub(crate) struct TlsSlot {
    pub(crate) seq: u64,
    pub(crate) value: usize,
}

impl TlsSlot {
    pub(crate) const EMPTY: Self = Self { seq: 0, value: 0 };
}

/// One pushed cleanup handler.
#[derive(Clone, Copy)]
pub(crate) struct CleanupEntry {
    pub(crate) func: extern "C" fn(usize),
    pub(crate) arg: usize,
}

/// LIFO cleanup-handler stack with fixed capacity.
pub(crate) struct CleanupStack {
    pub(crate) entries: [Option<CleanupEntry>; CLEANUP_MAX],
    pub(crate) depth: usize,
}

impl CleanupStack {
    const fn new() -> Self {
        Self {
            entries: [None; CLEANUP_MAX],
            depth: 0,
        }
    }
}

/// Per-thread control block.
#[repr(C)]
pub struct Descriptor {
    /// This descriptor's own address; must stay the first field so that
    /// `current()` can load it from `gs:[0]`.
    pub(crate) self_ptr: usize,
    /// Base of the mmap'd stack (including the guard page), 0 for adopted
    /// threads whose stack the runtime does not own.
    pub(crate) stack: usize,
    /// Total size of the mmap'd stack region.
    pub(crate) stack_size: usize,
    /// Kernel TID while the thread runs; cleared to 0 (with a futex wake) by
    /// the kernel on exit. Joiners and the recycler block on this word.
    pub(crate) exit_futex: AtomicU32,
    /// User entry point, stored as usize (0 = none).
    pub(crate) start_fn: usize,
    /// Argument for the entry point.
    pub(crate) arg: usize,
    /// Return value, written by the exiting thread before tear-down.
    pub(crate) retval: AtomicUsize,
    /// `JOIN_*` state, guarded by the descriptor-pool mutex.
    pub(crate) join_status: AtomicU8,
    /// Descriptor of the thread joining this one (0 = none), guarded by the
    /// descriptor-pool mutex.
    pub(crate) joiner: AtomicUsize,
    /// Cancellation status bits (`cancel::CANCEL_*`).
    pub(crate) cancel_status: AtomicU8,
    /// Start gate: the trampoline parks while this reads `START_WAIT`.
    pub(crate) start_status: AtomicU32,
    /// Effective packed scheduling (policy, priority).
    pub(crate) sched_info: AtomicU16,
    /// Last explicitly requested packed scheduling.
    pub(crate) user_sched_info: AtomicU16,
    /// Internal lock guarding the owned-mutex lists and scheduling
    /// recomputation. Cross-thread writers (a waiter boosting this thread)
    /// take it too.
    pub(crate) lock: RawFutex,
    /// PROTECT mutexes owned, ordered by ceiling, highest first.
    pub(crate) protect_mutexes: UnsafeCell<Vec<*const Mutex>>,
    /// INHERIT mutexes owned, unordered.
    pub(crate) inherit_mutexes: UnsafeCell<Vec<*const Mutex>>,
    /// Cleanup-handler stack; only the owning thread touches it.
    pub(crate) cleanup: UnsafeCell<CleanupStack>,
    /// TLS value slots; only the owning thread touches them.
    pub(crate) tls: UnsafeCell<[TlsSlot; MAX_KEYS]>,
}

// SAFETY: shared fields are atomics; the UnsafeCell fields are confined to
// the owning thread or guarded by `lock` / the pool mutex as documented.
unsafe impl Send for Descriptor {}
unsafe impl Sync for Descriptor {}

impl Descriptor {
    fn new_boxed() -> *mut Descriptor {
        let desc = Box::leak(Box::new(Descriptor {
            self_ptr: 0,
            stack: 0,
            stack_size: 0,
            exit_futex: AtomicU32::new(0),
            start_fn: 0,
            arg: 0,
            retval: AtomicUsize::new(0),
            join_status: AtomicU8::new(JOIN_DETACHED),
            joiner: AtomicUsize::new(0),
            cancel_status: AtomicU8::new(0),
            start_status: AtomicU32::new(START_OK),
            sched_info: AtomicU16::new(0),
            user_sched_info: AtomicU16::new(0),
            lock: RawFutex::new(),
            protect_mutexes: UnsafeCell::new(Vec::with_capacity(8)),
            inherit_mutexes: UnsafeCell::new(Vec::with_capacity(8)),
            cleanup: UnsafeCell::new(CleanupStack::new()),
            tls: UnsafeCell::new([TlsSlot::EMPTY; MAX_KEYS]),
        }));
        desc.self_ptr = desc as *mut Descriptor as usize;
        desc
    }

    /// Return a recycled descriptor to its pristine state. The caller has
    /// exclusive ownership (the descriptor is off both pool lists).
    pub(crate) fn reset(&mut self) {
        self.stack = 0;
        self.stack_size = 0;
        self.exit_futex.store(0, Ordering::SeqCst);
        self.start_fn = 0;
        self.arg = 0;
        self.retval.store(0, Ordering::SeqCst);
        self.join_status.store(JOIN_DETACHED, Ordering::SeqCst);
        self.joiner.store(0, Ordering::SeqCst);
        self.cancel_status.store(0, Ordering::SeqCst);
        self.start_status.store(START_OK, Ordering::SeqCst);
        self.sched_info.store(0, Ordering::SeqCst);
        self.user_sched_info.store(0, Ordering::SeqCst);
        self.lock.reset();
        self.protect_mutexes.get_mut().clear();
        self.inherit_mutexes.get_mut().clear();
        let cleanup = self.cleanup.get_mut();
        cleanup.depth = 0;
        cleanup.entries = [None; CLEANUP_MAX];
        *self.tls.get_mut() = [TlsSlot::EMPTY; MAX_KEYS];
    }

    /// Kernel TID as currently published by the exit-futex word.
    pub(crate) fn tid(&self) -> i32 {
        self.exit_futex.load(Ordering::SeqCst) as i32
    }
}

/// Opaque thread handle: the address of the thread's descriptor.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Thread(pub(crate) *mut Descriptor);

// SAFETY: a Thread is an address; all dereferences go through runtime calls
// that validate it against the pool.
unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}

impl Thread {
    /// The handle as a plain integer, e.g. for smuggling through a thread
    /// argument.
    #[must_use]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Rebuild a handle from [`Thread::as_usize`].
    ///
    /// # Safety
    ///
    /// `raw` must have come from `as_usize` on a handle that is still
    /// meaningful to the caller.
    #[must_use]
    pub unsafe fn from_usize(raw: usize) -> Self {
        Self(raw as *mut Descriptor)
    }

    #[inline]
    pub(crate) fn descriptor(self) -> *mut Descriptor {
        self.0
    }
}

/// The calling thread's handle.
///
/// Single-load lookup through the thread-pointer base. The calling thread
/// must have been registered with the runtime (created by
/// [`crate::thread::create`] or adopted via [`crate::runtime::init`]).
#[inline]
#[must_use]
pub fn current() -> Thread {
    let d: usize;
    // SAFETY: gs:[0] holds the descriptor self-pointer for every registered
    // thread; the load has no other effects.
    unsafe {
        asm!(
            "mov {}, qword ptr gs:[0]",
            out(reg) d,
            options(nostack, preserves_flags, readonly),
        );
    }
    Thread(d as *mut Descriptor)
}

// -------------------------------------------------------------------------
// Descriptor pool
// -------------------------------------------------------------------------

pub(crate) struct Pool {
    pub(crate) used: Vec<*mut Descriptor>,
    pub(crate) free: Vec<*mut Descriptor>,
}

static DESC_MUTEX: Mutex = Mutex::new();
static POOL: RacyCell<Pool> = RacyCell::new(Pool {
    used: Vec::new(),
    free: Vec::new(),
});

/// Take the descriptor-pool mutex.
pub(crate) fn pool_lock() {
    // The pool mutex is NORMAL/NONE; lock cannot fail.
    let _ = DESC_MUTEX.lock();
}

/// Release the descriptor-pool mutex.
pub(crate) fn pool_unlock() {
    let _ = DESC_MUTEX.unlock();
}

/// Access the pool lists.
///
/// # Safety
///
/// The caller must hold the pool mutex.
pub(crate) unsafe fn pool() -> &'static mut Pool {
    // SAFETY: exclusivity delegated to the pool mutex per the contract.
    unsafe { POOL.get_mut() }
}

/// Whether `desc` is on the used list. Caller must hold the pool mutex.
pub(crate) unsafe fn pool_contains_used(desc: *mut Descriptor) -> bool {
    // SAFETY: lock held per contract.
    unsafe { pool().used.iter().any(|&d| d == desc) }
}

/// Block until the kernel clears `desc`'s exit-futex word.
pub(crate) fn wait_for_exit(desc: *mut Descriptor) {
    // SAFETY: descriptors are never deallocated, so the word stays readable
    // even while the thread winds down.
    let word = unsafe { &(*desc).exit_futex };
    loop {
        let tid = word.load(Ordering::SeqCst);
        if tid == 0 {
            return;
        }
        let _ = futex_wait(word, tid);
    }
}

/// Acquire a descriptor: recycle from the free list (waiting out the old
/// owner's exit if needed) or allocate fresh. The descriptor is on the used
/// list when this returns.
pub(crate) fn acquire() -> *mut Descriptor {
    pool_lock();
    // SAFETY: pool mutex held.
    let recycled = unsafe { pool().free.pop() };
    pool_unlock();

    let desc = match recycled {
        Some(d) => {
            wait_for_exit(d);
            d
        }
        None => Descriptor::new_boxed(),
    };

    pool_lock();
    // SAFETY: pool mutex held. Reserving free-list capacity for every live
    // descriptor up front keeps `release` allocation-free, which matters on
    // the exit path of a thread that is about to unmap its own stack.
    unsafe {
        let p = pool();
        p.used.push(desc);
        let live = p.used.len();
        if p.free.capacity() < live {
            p.free.reserve(live - p.free.len());
        }
    }
    pool_unlock();
    desc
}

/// Move a descriptor from used to free. Takes and releases the pool mutex.
///
/// Releasing a descriptor that is not on the used list means the caller
/// handed us a corrupted handle; the process state is unaccountable and the
/// runtime aborts.
pub(crate) fn release(desc: *mut Descriptor) {
    pool_lock();
    // SAFETY: pool mutex held.
    unsafe {
        release_locked(desc);
    }
    pool_unlock();
}

/// Same as [`release`] with the pool mutex already held.
pub(crate) unsafe fn release_locked(desc: *mut Descriptor) {
    // SAFETY: pool mutex held per contract.
    unsafe {
        let p = pool();
        match p.used.iter().position(|&d| d == desc) {
            Some(idx) => {
                p.used.swap_remove(idx);
                p.free.push(desc);
            }
            None => {
                crate::raw_println!("spindle: releasing unknown descriptor {:#x}", desc as usize);
                syscall::sys_exit_group(1);
            }
        }
    }
}

/// Register an externally created thread: allocate a descriptor, point the
/// GS base at it, and put it on the used list. Returns the new handle.
pub(crate) fn adopt_current() -> Thread {
    let desc = Descriptor::new_boxed();
    // SAFETY: desc is exclusively ours until published.
    unsafe {
        (*desc)
            .exit_futex
            .store(syscall::sys_gettid() as u32, Ordering::SeqCst);
        (*desc).join_status.store(JOIN_DETACHED, Ordering::SeqCst);
        (*desc).cancel_status.store(
            crate::cancel::CANCEL_ENABLED | crate::cancel::CANCEL_DEFERRED,
            Ordering::SeqCst,
        );
        // The GS base must point at the descriptor before we take any
        // runtime lock: locking reads `current()`.
        let _ = syscall::sys_arch_prctl(syscall::ARCH_SET_GS, desc as usize);
    }
    pool_lock();
    // SAFETY: pool mutex held.
    unsafe {
        let p = pool();
        p.used.push(desc);
        let live = p.used.len();
        if p.free.capacity() < live {
            p.free.reserve(live - p.free.len());
        }
    }
    pool_unlock();
    Thread(desc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_handle_roundtrips_through_usize() {
        let t = Thread(0x1000 as *mut Descriptor);
        // SAFETY: synthetic handle, only compared.
        let back = unsafe { Thread::from_usize(t.as_usize()) };
        assert_eq!(t, back);
    }

    #[test]
    fn self_pointer_is_first_field() {
        // `current()` loads gs:[0]; the self pointer must sit at offset 0.
        assert_eq!(core::mem::offset_of!(Descriptor, self_ptr), 0);
    }

    #[test]
    fn fresh_descriptor_invariants() {
        let d = Descriptor::new_boxed();
        // SAFETY: d was just leaked; we have exclusive access.
        unsafe {
            assert_eq!((*d).self_ptr, d as usize);
            assert_eq!((*d).exit_futex.load(Ordering::SeqCst), 0);
            assert_eq!((*d).join_status.load(Ordering::SeqCst), JOIN_DETACHED);
            (*d).retval.store(99, Ordering::SeqCst);
            (*d).reset();
            assert_eq!((*d).retval.load(Ordering::SeqCst), 0);
            drop(Box::from_raw(d));
        }
    }
}
