//! Priority-aware scheduling.
//!
//! Two halves: a validated passthrough to `sched_setscheduler`, and the
//! recomputation of a thread's *effective* scheduling from the set of
//! priority-protocol mutexes it currently owns.
//!
//! Every thread carries two packed (policy, priority) words: what the user
//! last asked for, and what the thread is effectively running at. The
//! effective value is the user value upgraded by the head of the thread's
//! ceiling-ordered PROTECT list and by every INHERIT mutex's cached
//! max-waiter value. List mutation and recomputation happen under the
//! owning thread's internal futex lock; a blocked waiter crosses threads to
//! boost the owner under that same lock.
//!
//! On hosts without realtime privilege the kernel refuses FIFO/RR with
//! EPERM; the packed fields are kept authoritative in that case so that
//! priority logic (and its observers) keep working unprivileged.

use core::sync::atomic::Ordering;

use crate::Result;
use crate::errno::{EINVAL, EPERM, ESRCH};
use crate::mutex::Mutex;
use crate::syscall;
use crate::thread::descriptor::{
    Descriptor, Thread, current, pool_contains_used, pool_lock, pool_unlock,
};

/// Scheduling policy, kernel encoding.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Policy {
    /// SCHED_OTHER / SCHED_NORMAL.
    #[default]
    Normal = 0,
    /// SCHED_FIFO.
    Fifo = 1,
    /// SCHED_RR.
    Rr = 2,
}

impl Policy {
    const fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Fifo,
            2 => Self::Rr,
            _ => Self::Normal,
        }
    }

    /// Upgrade order at equal priority: FIFO > RR > NORMAL.
    const fn rank(self) -> u8 {
        match self {
            Self::Normal => 0,
            Self::Rr => 1,
            Self::Fifo => 2,
        }
    }
}

/// Packed (policy, priority) pair: policy in the high byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SchedInfo(u16);

impl SchedInfo {
    #[must_use]
    pub const fn pack(policy: Policy, priority: i32) -> Self {
        Self(((policy as u16) << 8) | (priority as u16 & 0xff))
    }

    #[must_use]
    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u16 {
        self.0
    }

    #[must_use]
    pub const fn policy(self) -> Policy {
        Policy::from_raw((self.0 >> 8) as u8)
    }

    #[must_use]
    pub const fn priority(self) -> i32 {
        (self.0 & 0xff) as i32
    }

    /// The upgrade rule: a candidate with higher priority wins; at equal
    /// priority the higher-ranked policy wins; otherwise keep self.
    #[must_use]
    pub const fn upgraded_by(self, candidate: Self) -> Self {
        if candidate.priority() > self.priority() {
            candidate
        } else if candidate.priority() == self.priority()
            && candidate.policy().rank() > self.policy().rank()
        {
            candidate
        } else {
            self
        }
    }
}

/// Validate a priority request: the runtime accepts 0..=99 for any policy.
const fn valid_priority(priority: i32) -> bool {
    priority >= 0 && priority <= 99
}

/// Apply `si` to the thread's kernel task and record it as effective.
///
/// EPERM from the kernel (no realtime privilege) is tolerated: the packed
/// value still becomes the thread's effective info. Any other kernel error
/// is surfaced and nothing is recorded.
pub(crate) fn set_sched(desc: *mut Descriptor, si: SchedInfo) -> Result<()> {
    // SAFETY: descriptors are never deallocated.
    let tid = unsafe { (*desc).tid() };
    match syscall::sys_sched_setscheduler(tid, si.policy() as i32, si.priority()) {
        Ok(()) | Err(EPERM) => {
            // SAFETY: as above.
            unsafe { (*desc).sched_info.store(si.raw(), Ordering::SeqCst) };
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Recompute the effective scheduling of `desc` from its user request and
/// owned-mutex lists, then apply it. Caller holds `desc.lock`.
pub(crate) unsafe fn recompute_locked(desc: *mut Descriptor) -> Result<()> {
    // SAFETY: desc.lock is held per the contract; list contents are stable.
    unsafe {
        let mut si = SchedInfo::from_raw((*desc).user_sched_info.load(Ordering::SeqCst));
        let protect = &*(*desc).protect_mutexes.get();
        if let Some(&head) = protect.first() {
            si = si.upgraded_by(SchedInfo::from_raw((*head).sched_info.load(Ordering::SeqCst)));
        }
        let inherit = &*(*desc).inherit_mutexes.get();
        for &m in inherit.iter() {
            si = si.upgraded_by(SchedInfo::from_raw((*m).sched_info.load(Ordering::SeqCst)));
        }
        set_sched(desc, si)
    }
}

// -------------------------------------------------------------------------
// Public passthrough
// -------------------------------------------------------------------------

/// Set a thread's scheduling policy and priority.
///
/// The request becomes the thread's user-level scheduling; the effective
/// value is recomputed in case the thread currently holds priority-protocol
/// mutexes.
pub fn setschedparam(thread: Thread, policy: Policy, priority: i32) -> Result<()> {
    if !valid_priority(priority) {
        return Err(EINVAL);
    }
    let desc = thread.descriptor();
    pool_lock();
    // SAFETY: pool mutex held.
    if !unsafe { pool_contains_used(desc) } {
        pool_unlock();
        return Err(ESRCH);
    }
    let si = SchedInfo::pack(policy, priority);
    // SAFETY: descriptors are never deallocated; the used-list check above
    // pins identity while we hold the pool mutex.
    let result = unsafe {
        (*desc).user_sched_info.store(si.raw(), Ordering::SeqCst);
        (*desc).lock.lock();
        let r = recompute_locked(desc);
        (*desc).lock.unlock();
        r
    };
    pool_unlock();
    result
}

/// Read a thread's effective scheduling policy and priority.
pub fn getschedparam(thread: Thread) -> Result<(Policy, i32)> {
    let desc = thread.descriptor();
    pool_lock();
    // SAFETY: pool mutex held.
    if !unsafe { pool_contains_used(desc) } {
        pool_unlock();
        return Err(ESRCH);
    }
    // SAFETY: on the used list, so the descriptor is live.
    let si = SchedInfo::from_raw(unsafe { (*desc).sched_info.load(Ordering::SeqCst) });
    pool_unlock();
    Ok((si.policy(), si.priority()))
}

/// Validate an attribute-level priority request.
pub(crate) fn check_priority(priority: i32) -> Result<()> {
    if valid_priority(priority) {
        Ok(())
    } else {
        Err(EINVAL)
    }
}

// -------------------------------------------------------------------------
// Owned-mutex list maintenance (called from the mutex protocol layer)
// -------------------------------------------------------------------------

/// Record a freshly acquired INHERIT mutex on the caller's inherit list.
/// No recomputation: the mutex starts with no observed waiters.
/// Called with the mutex's internal lock held; the caller is the new owner.
pub(crate) fn inherit_register(mutex: &Mutex) {
    let desc = current().descriptor();
    // SAFETY: desc is the calling thread's live descriptor.
    unsafe {
        (*desc).lock.lock();
        (*(*desc).inherit_mutexes.get()).push(mutex as *const Mutex);
        (*desc).lock.unlock();
    }
}

/// Raise an INHERIT mutex's cached waiter info (and its owner) to the
/// calling waiter's effective scheduling. Called with the mutex's internal
/// lock held, so the owner cannot release concurrently.
pub(crate) fn inherit_boost(mutex: &Mutex) {
    let waiter = current().descriptor();
    // SAFETY: waiter is the calling thread's live descriptor.
    let waiter_si = SchedInfo::from_raw(unsafe { (*waiter).sched_info.load(Ordering::SeqCst) });
    let owner = mutex.owner.load(Ordering::SeqCst) as *mut Descriptor;
    if owner.is_null() {
        return;
    }
    // SAFETY: the owner descriptor is live (descriptors are never freed) and
    // its identity is pinned by the mutex internal lock.
    unsafe {
        (*owner).lock.lock();
        let cached = SchedInfo::from_raw(mutex.sched_info.load(Ordering::SeqCst));
        let merged = cached.upgraded_by(waiter_si);
        if merged != cached {
            mutex.sched_info.store(merged.raw(), Ordering::SeqCst);
            let _ = recompute_locked(owner);
        }
        (*owner).lock.unlock();
    }
}

/// Drop an INHERIT mutex from the caller's inherit list on release. If the
/// mutex's cached waiter info was what the owner is currently running at,
/// the owner's effective scheduling is recomputed. The cache is cleared for
/// the next acquisition.
pub(crate) fn inherit_unregister(mutex: &Mutex) {
    let desc = current().descriptor();
    // SAFETY: desc is the calling thread's live descriptor.
    unsafe {
        (*desc).lock.lock();
        let list = &mut *(*desc).inherit_mutexes.get();
        if let Some(idx) = list.iter().position(|&m| m == mutex as *const Mutex) {
            list.swap_remove(idx);
        }
        let cached = mutex.sched_info.swap(0, Ordering::SeqCst);
        if cached == (*desc).sched_info.load(Ordering::SeqCst) {
            let _ = recompute_locked(desc);
        }
        (*desc).lock.unlock();
    }
}

/// Record a freshly acquired PROTECT mutex on the caller's ceiling-ordered
/// list, highest ceiling first, recomputing if it became the new head.
pub(crate) fn protect_register(mutex: &Mutex) {
    let desc = current().descriptor();
    let ceiling = SchedInfo::from_raw(mutex.sched_info.load(Ordering::SeqCst));
    // SAFETY: desc is the calling thread's live descriptor.
    unsafe {
        (*desc).lock.lock();
        let list = &mut *(*desc).protect_mutexes.get();
        let pos = list
            .iter()
            .position(|&m| {
                SchedInfo::from_raw((*m).sched_info.load(Ordering::SeqCst)).priority()
                    < ceiling.priority()
            })
            .unwrap_or(list.len());
        list.insert(pos, mutex as *const Mutex);
        if pos == 0 {
            let _ = recompute_locked(desc);
        }
        (*desc).lock.unlock();
    }
}

/// Drop a PROTECT mutex from the caller's list on release, recomputing if
/// the head changed.
pub(crate) fn protect_unregister(mutex: &Mutex) {
    let desc = current().descriptor();
    // SAFETY: desc is the calling thread's live descriptor.
    unsafe {
        (*desc).lock.lock();
        let list = &mut *(*desc).protect_mutexes.get();
        if let Some(idx) = list.iter().position(|&m| m == mutex as *const Mutex) {
            list.remove(idx);
            if idx == 0 {
                let _ = recompute_locked(desc);
            }
        }
        (*desc).lock.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime;

    #[test]
    fn pack_unpack_roundtrip() {
        let si = SchedInfo::pack(Policy::Rr, 37);
        assert_eq!(si.policy(), Policy::Rr);
        assert_eq!(si.priority(), 37);
        assert_eq!(SchedInfo::from_raw(si.raw()), si);
    }

    #[test]
    fn upgrade_prefers_priority_then_policy_rank() {
        let base = SchedInfo::pack(Policy::Normal, 0);
        let rr7 = SchedInfo::pack(Policy::Rr, 7);
        let fifo7 = SchedInfo::pack(Policy::Fifo, 7);
        let fifo5 = SchedInfo::pack(Policy::Fifo, 5);

        assert_eq!(base.upgraded_by(rr7), rr7);
        assert_eq!(rr7.upgraded_by(fifo5), rr7); // lower priority loses
        assert_eq!(rr7.upgraded_by(fifo7), fifo7); // equal priority: FIFO > RR
        assert_eq!(fifo7.upgraded_by(rr7), fifo7); // and not the reverse
        assert_eq!(fifo7.upgraded_by(base), fifo7);
    }

    #[test]
    fn setschedparam_validates_priority() {
        runtime::init().unwrap();
        let me = current();
        assert_eq!(setschedparam(me, Policy::Normal, 100), Err(EINVAL));
        assert_eq!(setschedparam(me, Policy::Normal, -1), Err(EINVAL));
    }

    #[test]
    fn getschedparam_unknown_thread_is_esrch() {
        runtime::init().unwrap();
        // SAFETY: deliberately bogus handle; the used-list check rejects it.
        let bogus = unsafe { Thread::from_usize(0xdead_0000) };
        assert_eq!(getschedparam(bogus), Err(ESRCH));
        assert_eq!(setschedparam(bogus, Policy::Normal, 0), Err(ESRCH));
    }

    #[test]
    fn setschedparam_rr_is_observable_unprivileged() {
        runtime::init().unwrap();
        let me = current();
        setschedparam(me, Policy::Rr, 12).unwrap();
        assert_eq!(getschedparam(me), Ok((Policy::Rr, 12)));
        setschedparam(me, Policy::Normal, 0).unwrap();
        assert_eq!(getschedparam(me), Ok((Policy::Normal, 0)));
    }
}
