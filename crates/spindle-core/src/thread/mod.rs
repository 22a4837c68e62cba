//! Thread lifecycle: create, exit, join, detach, once, sleep.
//!
//! Threads are cloned kernel tasks sharing the address space, file table,
//! and signal handlers, each with a runtime-owned guarded stack and a
//! [`descriptor::Descriptor`] recycled through the descriptor pool. Join
//! synchronization rides entirely on the kernel's `CLONE_CHILD_CLEARTID`
//! futex wake — there is no userspace exit notification to race with.

pub(crate) mod descriptor;
mod once;

use core::sync::atomic::Ordering;
use core::time::Duration;

use crate::errno::{EDEADLK, EINVAL, ESRCH};
use crate::futex::futex_wake;
use crate::sched::{self, Policy, SchedInfo};
use crate::syscall::{
    self, MAP_ANONYMOUS, MAP_PRIVATE, PAGE_SIZE, PROT_NONE, PROT_READ, PROT_WRITE, Timespec,
};
use crate::{Result, cancel, tls};

pub use descriptor::{Descriptor, StartFn, Thread, current};
pub use once::{Once, once};

use descriptor::{
    JOIN_DETACHED, JOIN_FIXED, JOIN_JOINABLE, START_EXIT, START_OK, START_WAIT, TID_PRESEED,
};

/// Default stack size for new threads: 8 MiB including the guard page.
pub const DEFAULT_STACK_SIZE: usize = 8 * 1024 * 1024;

/// Clone flags for a runtime thread: shared VM, filesystem info, file
/// table, SysV semaphore undo, signal handlers; same thread group; the
/// kernel publishes the TID to the exit-futex word at start and clears it
/// (with a futex wake) at exit.
const CLONE_THREAD_FLAGS: usize = {
    const CLONE_VM: usize = 0x0000_0100;
    const CLONE_FS: usize = 0x0000_0200;
    const CLONE_FILES: usize = 0x0000_0400;
    const CLONE_SIGHAND: usize = 0x0000_0800;
    const CLONE_THREAD: usize = 0x0001_0000;
    const CLONE_SYSVSEM: usize = 0x0004_0000;
    const CLONE_CHILD_CLEARTID: usize = 0x0020_0000;
    const CLONE_CHILD_SETTID: usize = 0x0100_0000;
    CLONE_VM
        | CLONE_FS
        | CLONE_FILES
        | CLONE_SIGHAND
        | CLONE_THREAD
        | CLONE_SYSVSEM
        | CLONE_CHILD_CLEARTID
        | CLONE_CHILD_SETTID
};

/// Whether a new thread starts joinable or detached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DetachState {
    #[default]
    Joinable,
    Detached,
}

/// Whether a new thread inherits the creator's scheduling or applies the
/// attribute's explicit policy/priority before its first user instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InheritSched {
    #[default]
    Inherit,
    Explicit,
}

/// Thread creation attributes.
#[derive(Debug, Clone, Copy)]
pub struct Attr {
    stack_size: usize,
    detach_state: DetachState,
    sched_policy: Policy,
    sched_priority: i32,
    inherit_sched: InheritSched,
}

impl Attr {
    /// Defaults: 8 MiB stack, joinable, inherited NORMAL scheduling.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            detach_state: DetachState::Joinable,
            sched_policy: Policy::Normal,
            sched_priority: 0,
            inherit_sched: InheritSched::Inherit,
        }
    }

    /// Stack size including the guard page; at least two pages and a
    /// multiple of the page size (the trampoline frame sits at the top).
    pub fn set_stack_size(&mut self, size: usize) -> Result<()> {
        if size < 2 * PAGE_SIZE || size % PAGE_SIZE != 0 {
            return Err(EINVAL);
        }
        self.stack_size = size;
        Ok(())
    }

    pub fn set_detach_state(&mut self, state: DetachState) -> Result<()> {
        self.detach_state = state;
        Ok(())
    }

    pub fn set_sched_policy(&mut self, policy: Policy) -> Result<()> {
        self.sched_policy = policy;
        Ok(())
    }

    /// Scheduling priority, 0..=99.
    pub fn set_sched_priority(&mut self, priority: i32) -> Result<()> {
        sched::check_priority(priority)?;
        self.sched_priority = priority;
        Ok(())
    }

    pub fn set_inherit_sched(&mut self, inherit: InheritSched) -> Result<()> {
        self.inherit_sched = inherit;
        Ok(())
    }
}

impl Default for Attr {
    fn default() -> Self {
        Self::new()
    }
}

// -------------------------------------------------------------------------
// Trampoline (runs on the child)
// -------------------------------------------------------------------------

/// First code the cloned task runs. Points the thread-pointer base at the
/// descriptor, honors the start gate, then runs the user function and tails
/// into [`exit`].
unsafe extern "C" fn thread_trampoline(desc_raw: usize) -> usize {
    let desc = desc_raw as *mut Descriptor;
    // SAFETY: desc is this thread's descriptor, fully populated by the
    // creator before clone.
    unsafe {
        let _ = syscall::sys_arch_prctl(syscall::ARCH_SET_GS, desc_raw);

        loop {
            match (*desc).start_status.load(Ordering::SeqCst) {
                START_OK => break,
                START_EXIT => syscall::sys_exit_thread(0),
                s => {
                    let _ = crate::futex::futex_wait(&(*desc).start_status, s);
                }
            }
        }

        let f: StartFn = core::mem::transmute((*desc).start_fn);
        let retval = f((*desc).arg);
        exit(retval)
    }
}

// -------------------------------------------------------------------------
// Lifecycle operations
// -------------------------------------------------------------------------

/// Create a new thread running `f(arg)`.
///
/// The stack is an anonymous mapping with its lowest page made unreadable
/// as an overflow guard. With [`InheritSched::Explicit`] the child parks
/// until the creator has applied the attribute's scheduling to it; if that
/// fails the child is told to exit, its resources are reclaimed, and the
/// error is returned with no thread left behind.
pub fn create(attr: &Attr, f: StartFn, arg: usize) -> Result<Thread> {
    // SAFETY: fresh anonymous mapping, then a guard page at the low end.
    let stack = unsafe {
        syscall::sys_mmap(
            core::ptr::null_mut(),
            attr.stack_size,
            PROT_READ | PROT_WRITE,
            MAP_PRIVATE | MAP_ANONYMOUS,
            -1,
            0,
        )?
    };
    // SAFETY: stack is the mapping above; the guard page covers its base.
    if let Err(e) = unsafe { syscall::sys_mprotect(stack, PAGE_SIZE, PROT_NONE) } {
        // SAFETY: unmapping the region just created.
        let _ = unsafe { syscall::sys_munmap(stack, attr.stack_size) };
        return Err(e);
    }

    let desc = descriptor::acquire();
    let explicit = attr.inherit_sched == InheritSched::Explicit;

    // SAFETY: the descriptor came off the pool; nobody else holds a handle
    // to it until `create` returns.
    unsafe {
        (*desc).reset();
        (*desc).stack = stack as usize;
        (*desc).stack_size = attr.stack_size;
        (*desc).start_fn = f as usize;
        (*desc).arg = arg;
        (*desc).join_status.store(
            match attr.detach_state {
                DetachState::Joinable => JOIN_JOINABLE,
                DetachState::Detached => JOIN_DETACHED,
            },
            Ordering::SeqCst,
        );
        (*desc).cancel_status.store(
            cancel::CANCEL_ENABLED | cancel::CANCEL_DEFERRED,
            Ordering::SeqCst,
        );
        if explicit {
            (*desc).start_status.store(START_WAIT, Ordering::SeqCst);
        } else {
            // The kernel task inherits the creator's scheduling across
            // clone; mirror it in the descriptor.
            let si = (*current().descriptor())
                .user_sched_info
                .load(Ordering::SeqCst);
            (*desc).user_sched_info.store(si, Ordering::SeqCst);
            (*desc).sched_info.store(si, Ordering::SeqCst);
        }
        // Pre-seed the exit-futex word so that a join racing thread start
        // never mistakes "not yet running" for "already exited". The kernel
        // overwrites this with the real TID.
        (*desc).exit_futex.store(TID_PRESEED, Ordering::SeqCst);

        // Trampoline frame at the stack top: [fn_ptr][arg].
        let top = stack as usize + attr.stack_size;
        let frame = top - 16;
        core::ptr::write(frame as *mut usize, thread_trampoline as usize);
        core::ptr::write((frame + 8) as *mut usize, desc as usize);

        let ctid = (*desc).exit_futex.as_ptr() as usize;
        let raw = syscall::clone_thread(CLONE_THREAD_FLAGS, frame, 0, ctid, 0);
        let signed = raw as isize;
        if signed < 0 {
            (*desc).exit_futex.store(0, Ordering::SeqCst);
            descriptor::release(desc);
            let _ = syscall::sys_munmap(stack, attr.stack_size);
            return Err((-signed) as i32);
        }
        let tid = signed as i32;
        // Publish the TID without racing the kernel's own writes: only the
        // pre-seed value may be replaced.
        let _ = (*desc).exit_futex.compare_exchange(
            TID_PRESEED,
            tid as u32,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );

        if explicit {
            let si = SchedInfo::pack(attr.sched_policy, attr.sched_priority);
            (*desc).user_sched_info.store(si.raw(), Ordering::SeqCst);
            match sched::set_sched(desc, si) {
                Ok(()) => {
                    (*desc).start_status.store(START_OK, Ordering::SeqCst);
                    futex_wake(&(*desc).start_status, 1);
                }
                Err(e) => {
                    (*desc).start_status.store(START_EXIT, Ordering::SeqCst);
                    futex_wake(&(*desc).start_status, 1);
                    descriptor::wait_for_exit(desc);
                    descriptor::release(desc);
                    let _ = syscall::sys_munmap(stack, attr.stack_size);
                    return Err(e);
                }
            }
        }
    }

    Ok(Thread(desc))
}

/// Terminate the calling thread with `retval`.
///
/// Runs the cleanup handlers (LIFO) and the TLS destructors, publishes the
/// return value, fixes the join status, and — for a detached thread —
/// releases the descriptor. The final step unmaps the thread's own stack
/// and exits in one stackless asm sequence.
pub fn exit(retval: usize) -> ! {
    // A pending deferred cancel must not re-enter the exit path from the
    // cancellation points inside the pool mutex below.
    cancel::disable_quietly();
    cancel::run_cleanup_handlers();
    tls::run_destructors();

    let desc = current().descriptor();
    // SAFETY: desc is the calling thread's live descriptor.
    unsafe {
        (*desc).retval.store(retval, Ordering::SeqCst);

        descriptor::pool_lock();
        let detached = (*desc).join_status.load(Ordering::SeqCst) == JOIN_DETACHED;
        if detached {
            descriptor::release_locked(desc);
        } else {
            (*desc).join_status.store(JOIN_FIXED, Ordering::SeqCst);
        }
        descriptor::pool_unlock();

        let stack = (*desc).stack;
        let size = (*desc).stack_size;
        if stack == 0 {
            // Adopted thread: the runtime does not own this stack.
            syscall::sys_exit_thread(0);
        }
        syscall::exit_and_unmap(stack, size)
    }
}

/// Wait for `thread` to exit and collect its return value.
///
/// At most one thread may join a given target. The target's descriptor is
/// recycled once the join completes.
pub fn join(thread: Thread) -> Result<usize> {
    let target = thread.descriptor();
    let me = current().descriptor();
    if target == me {
        return Err(EDEADLK);
    }

    descriptor::pool_lock();
    // SAFETY: pool mutex held.
    if !unsafe { descriptor::pool_contains_used(target) } {
        descriptor::pool_unlock();
        return Err(ESRCH);
    }
    // SAFETY: on the used list, so the descriptor is live; join bookkeeping
    // is guarded by the pool mutex.
    unsafe {
        if (*target).join_status.load(Ordering::SeqCst) == JOIN_DETACHED {
            descriptor::pool_unlock();
            return Err(EINVAL);
        }
        if (*target).joiner.load(Ordering::SeqCst) != 0 {
            descriptor::pool_unlock();
            return Err(EINVAL);
        }
        if (*me).joiner.load(Ordering::SeqCst) == target as usize {
            // The target is already joining us.
            descriptor::pool_unlock();
            return Err(EDEADLK);
        }
        (*target).join_status.store(JOIN_FIXED, Ordering::SeqCst);
        (*target).joiner.store(me as usize, Ordering::SeqCst);
    }
    descriptor::pool_unlock();

    descriptor::wait_for_exit(target);
    // SAFETY: the thread is gone; retval was published before its exit.
    let retval = unsafe { (*target).retval.load(Ordering::SeqCst) };
    descriptor::release(target);
    Ok(retval)
}

/// Make `thread` detached: its resources are reclaimed automatically when
/// it exits and it can no longer be joined.
pub fn detach(thread: Thread) -> Result<()> {
    let target = thread.descriptor();
    descriptor::pool_lock();
    // SAFETY: pool mutex held.
    if !unsafe { descriptor::pool_contains_used(target) } {
        descriptor::pool_unlock();
        return Err(ESRCH);
    }
    // SAFETY: on the used list; join bookkeeping guarded by the pool mutex.
    let result = unsafe {
        if (*target).join_status.load(Ordering::SeqCst) == JOIN_JOINABLE {
            (*target).join_status.store(JOIN_DETACHED, Ordering::SeqCst);
            Ok(())
        } else {
            Err(EINVAL)
        }
    };
    descriptor::pool_unlock();
    result
}

/// Whether two handles name the same thread.
#[must_use]
pub fn equal(a: Thread, b: Thread) -> bool {
    a == b
}

/// Sleep for `duration`. A cancellation point: a pending deferred cancel is
/// observed when the sleep starts and whenever a signal interrupts it.
pub fn sleep(duration: Duration) {
    cancel::testcancel();
    let mut req = Timespec {
        sec: duration.as_secs() as i64,
        nsec: i64::from(duration.subsec_nanos()),
    };
    loop {
        let mut rem = Timespec::default();
        match syscall::sys_nanosleep(&req, &mut rem) {
            Err(crate::errno::EINTR) => {
                cancel::testcancel();
                req = rem;
            }
            _ => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime;

    extern "C" fn echo(arg: usize) -> usize {
        arg
    }

    extern "C" fn bump(arg: usize) -> usize {
        // SAFETY: arg points to an AtomicUsize owned by the test.
        let counter = unsafe { &*(arg as *const core::sync::atomic::AtomicUsize) };
        counter.fetch_add(1, Ordering::SeqCst);
        0
    }

    #[test]
    fn create_join_returns_value() {
        runtime::init().unwrap();
        let t = create(&Attr::new(), echo, 0xfeed).unwrap();
        assert_eq!(join(t), Ok(0xfeed));
    }

    #[test]
    fn many_threads_round_trip_through_the_pool() {
        runtime::init().unwrap();
        // Two batches so the second batch exercises descriptor recycling.
        for _ in 0..2 {
            let threads: Vec<Thread> = (0..8)
                .map(|i| create(&Attr::new(), echo, i).unwrap())
                .collect();
            for (i, t) in threads.into_iter().enumerate() {
                assert_eq!(join(t), Ok(i));
            }
        }
    }

    #[test]
    fn child_writes_shared_memory() {
        runtime::init().unwrap();
        let counter = Box::new(core::sync::atomic::AtomicUsize::new(0));
        let t = create(&Attr::new(), bump, &*counter as *const _ as usize).unwrap();
        join(t).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn self_join_is_deadlock() {
        runtime::init().unwrap();
        assert_eq!(join(current()), Err(EDEADLK));
    }

    #[test]
    fn join_unknown_handle_is_esrch() {
        runtime::init().unwrap();
        // SAFETY: deliberately bogus handle; the used-list check rejects it.
        let bogus = unsafe { Thread::from_usize(0x4000) };
        assert_eq!(join(bogus), Err(ESRCH));
        assert_eq!(detach(bogus), Err(ESRCH));
    }

    #[test]
    fn equal_compares_identity() {
        runtime::init().unwrap();
        let me = current();
        assert!(equal(me, me));
        let t = create(&Attr::new(), echo, 1).unwrap();
        assert!(!equal(me, t));
        join(t).unwrap();
    }

    #[test]
    fn attr_validation() {
        let mut attr = Attr::new();
        assert_eq!(attr.set_stack_size(PAGE_SIZE), Err(EINVAL));
        assert_eq!(attr.set_stack_size(64 * PAGE_SIZE), Ok(()));
        assert_eq!(attr.set_sched_priority(100), Err(EINVAL));
        assert_eq!(attr.set_sched_priority(99), Ok(()));
    }

    #[test]
    fn sleep_returns_after_interval() {
        runtime::init().unwrap();
        sleep(Duration::from_millis(1));
    }
}
