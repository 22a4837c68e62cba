//! Mutexes: three behavioral types composed with three locking protocols.
//!
//! The type layer (NORMAL / ERRORCHECK / RECURSIVE) owns the bookkeeping —
//! owner identity, recursion counter, deadlock and permission errors — and
//! delegates the actual acquire/release to the protocol layer
//! (NONE / INHERIT / PROTECT) exactly once. The protocol layer owns the
//! futex word and the scheduler interaction.
//!
//! An all-zero `Mutex` is a valid NORMAL/NONE mutex, so `Mutex::new()` is
//! `const` and a `static` mutex needs no initialization call.

use core::sync::atomic::{AtomicU8, AtomicU16, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crate::errno::{EAGAIN, EBUSY, EDEADLK, EINVAL, EPERM};
use crate::futex::{RawFutex, futex_wait, futex_wake};
use crate::sched::{self, Policy, SchedInfo};
use crate::thread::descriptor::current;
use crate::{Result, cancel};

/// Mutex behavioral type.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MutexType {
    /// No checking; re-lock by the owner deadlocks.
    #[default]
    Normal = 0,
    /// Re-lock by the owner and foreign unlock are reported as errors.
    Errorcheck = 1,
    /// The owner may re-lock; a counter tracks the depth.
    Recursive = 2,
}

impl MutexType {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Errorcheck,
            2 => Self::Recursive,
            _ => Self::Normal,
        }
    }
}

/// Mutex locking protocol.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    /// Plain futex lock.
    #[default]
    None = 0,
    /// Priority inheritance: the owner adopts the maximum waiter priority.
    Inherit = 1,
    /// Priority ceiling: the owner runs at the mutex ceiling while holding.
    Protect = 2,
}

impl Protocol {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Inherit,
            2 => Self::Protect,
            _ => Self::None,
        }
    }
}

/// Mutex creation attributes.
#[derive(Debug, Clone, Copy)]
pub struct MutexAttr {
    mtype: MutexType,
    protocol: Protocol,
    prioceiling: u8,
}

impl MutexAttr {
    /// Defaults: NORMAL type, NONE protocol, ceiling 0.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            mtype: MutexType::Normal,
            protocol: Protocol::None,
            prioceiling: 0,
        }
    }

    /// Destroy: a validating no-op — attributes hold no resources.
    pub fn destroy(&mut self) -> Result<()> {
        Ok(())
    }

    pub fn set_type(&mut self, mtype: MutexType) -> Result<()> {
        self.mtype = mtype;
        Ok(())
    }

    #[must_use]
    pub fn get_type(&self) -> MutexType {
        self.mtype
    }

    pub fn set_protocol(&mut self, protocol: Protocol) -> Result<()> {
        self.protocol = protocol;
        Ok(())
    }

    #[must_use]
    pub fn get_protocol(&self) -> Protocol {
        self.protocol
    }

    /// Ceiling priority for PROTECT mutexes; valid range 0..=99.
    pub fn set_prioceiling(&mut self, ceiling: i32) -> Result<()> {
        if !(0..=99).contains(&ceiling) {
            return Err(EINVAL);
        }
        self.prioceiling = ceiling as u8;
        Ok(())
    }

    #[must_use]
    pub fn get_prioceiling(&self) -> i32 {
        i32::from(self.prioceiling)
    }
}

impl Default for MutexAttr {
    fn default() -> Self {
        Self::new()
    }
}

/// A runtime mutex.
#[repr(C)]
pub struct Mutex {
    /// User-visible busy word: 0 free, 1 held. Waiters sleep here.
    pub(crate) futex: AtomicU32,
    /// Internal lock serializing INHERIT state transitions.
    pub(crate) internal: RawFutex,
    mtype: AtomicU8,
    protocol: AtomicU8,
    /// Owning thread's descriptor address, 0 when free.
    pub(crate) owner: AtomicUsize,
    /// Recursion depth for RECURSIVE mutexes.
    counter: AtomicU64,
    /// Packed scheduling attached to this mutex: the ceiling for PROTECT,
    /// the maximum observed waiter for INHERIT.
    pub(crate) sched_info: AtomicU16,
}

// SAFETY: all state is atomic or guarded by `internal`.
unsafe impl Send for Mutex {}
unsafe impl Sync for Mutex {}

impl Mutex {
    /// A fresh NORMAL/NONE mutex; all-zero representation.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            futex: AtomicU32::new(0),
            internal: RawFutex::new(),
            mtype: AtomicU8::new(MutexType::Normal as u8),
            protocol: AtomicU8::new(Protocol::None as u8),
            owner: AtomicUsize::new(0),
            counter: AtomicU64::new(0),
            sched_info: AtomicU16::new(0),
        }
    }

    /// A fresh mutex configured from `attr`.
    #[must_use]
    pub const fn with_attr(attr: &MutexAttr) -> Self {
        let sched_info = match attr.protocol {
            Protocol::Protect => {
                if attr.prioceiling != 0 {
                    SchedInfo::pack(Policy::Fifo, attr.prioceiling as i32).raw()
                } else {
                    0
                }
            }
            _ => 0,
        };
        Self {
            futex: AtomicU32::new(0),
            internal: RawFutex::new(),
            mtype: AtomicU8::new(attr.mtype as u8),
            protocol: AtomicU8::new(attr.protocol as u8),
            owner: AtomicUsize::new(0),
            counter: AtomicU64::new(0),
            sched_info: AtomicU16::new(sched_info),
        }
    }

    /// Reinitialize in place. The mutex must not be locked.
    pub fn init(&self, attr: Option<&MutexAttr>) -> Result<()> {
        let attr = attr.copied().unwrap_or_default();
        self.futex.store(0, Ordering::SeqCst);
        self.internal.reset();
        self.mtype.store(attr.mtype as u8, Ordering::SeqCst);
        self.protocol.store(attr.protocol as u8, Ordering::SeqCst);
        self.owner.store(0, Ordering::SeqCst);
        self.counter.store(0, Ordering::SeqCst);
        let sched_info = match attr.protocol {
            Protocol::Protect if attr.prioceiling != 0 => {
                SchedInfo::pack(Policy::Fifo, i32::from(attr.prioceiling)).raw()
            }
            _ => 0,
        };
        self.sched_info.store(sched_info, Ordering::SeqCst);
        Ok(())
    }

    /// Destroy: a validating no-op — the mutex owns no external resources.
    pub fn destroy(&self) -> Result<()> {
        Ok(())
    }

    #[inline]
    fn mutex_type(&self) -> MutexType {
        MutexType::from_raw(self.mtype.load(Ordering::SeqCst))
    }

    #[inline]
    pub(crate) fn protocol(&self) -> Protocol {
        Protocol::from_raw(self.protocol.load(Ordering::SeqCst))
    }

    #[inline]
    fn owned_by_current(&self) -> bool {
        self.owner.load(Ordering::SeqCst) == current().as_usize()
    }

    // ---------------------------------------------------------------------
    // Type layer
    // ---------------------------------------------------------------------

    /// Acquire, blocking until the mutex is available.
    pub fn lock(&self) -> Result<()> {
        match self.mutex_type() {
            MutexType::Normal => self.protocol_lock(),
            MutexType::Errorcheck => {
                if self.owned_by_current() {
                    return Err(EDEADLK);
                }
                self.protocol_lock()
            }
            MutexType::Recursive => {
                if !self.owned_by_current() {
                    self.protocol_lock()?;
                }
                if self.counter.load(Ordering::SeqCst) == u64::MAX {
                    return Err(EAGAIN);
                }
                self.counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
    }

    /// Acquire only if immediately available.
    pub fn trylock(&self) -> Result<()> {
        match self.mutex_type() {
            MutexType::Normal | MutexType::Errorcheck => self.protocol_trylock(),
            MutexType::Recursive => {
                if !self.owned_by_current() {
                    self.protocol_trylock()?;
                    self.counter.store(1, Ordering::SeqCst);
                    return Ok(());
                }
                if self.counter.load(Ordering::SeqCst) == u64::MAX {
                    return Err(EAGAIN);
                }
                self.counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
    }

    /// Release.
    pub fn unlock(&self) -> Result<()> {
        match self.mutex_type() {
            MutexType::Normal => self.protocol_unlock(),
            MutexType::Errorcheck => {
                if !self.owned_by_current() || self.futex.load(Ordering::SeqCst) == 0 {
                    return Err(EPERM);
                }
                self.protocol_unlock()
            }
            MutexType::Recursive => {
                if !self.owned_by_current() {
                    return Err(EPERM);
                }
                let left = self.counter.fetch_sub(1, Ordering::SeqCst) - 1;
                if left == 0 {
                    return self.protocol_unlock();
                }
                Ok(())
            }
        }
    }

    // ---------------------------------------------------------------------
    // Protocol layer
    // ---------------------------------------------------------------------

    fn protocol_lock(&self) -> Result<()> {
        match self.protocol() {
            Protocol::None => {
                self.lock_prio_none();
                Ok(())
            }
            Protocol::Inherit => {
                self.lock_prio_inherit();
                Ok(())
            }
            Protocol::Protect => {
                self.lock_prio_none();
                sched::protect_register(self);
                Ok(())
            }
        }
    }

    fn protocol_trylock(&self) -> Result<()> {
        match self.protocol() {
            Protocol::None => self.trylock_prio_none(),
            Protocol::Inherit => self.trylock_prio_inherit(),
            Protocol::Protect => {
                self.trylock_prio_none()?;
                sched::protect_register(self);
                Ok(())
            }
        }
    }

    fn protocol_unlock(&self) -> Result<()> {
        match self.protocol() {
            Protocol::None => {
                self.unlock_prio_none();
                Ok(())
            }
            Protocol::Inherit => {
                self.unlock_prio_inherit();
                Ok(())
            }
            Protocol::Protect => {
                sched::protect_unregister(self);
                self.unlock_prio_none();
                Ok(())
            }
        }
    }

    // NONE: the busy word is the whole story.

    fn lock_prio_none(&self) {
        loop {
            if self
                .futex
                .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                self.owner.store(current().as_usize(), Ordering::SeqCst);
                return;
            }
            let _ = futex_wait(&self.futex, 1);
            cancel::testcancel();
        }
    }

    fn trylock_prio_none(&self) -> Result<()> {
        if self
            .futex
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.owner.store(current().as_usize(), Ordering::SeqCst);
            Ok(())
        } else {
            Err(EBUSY)
        }
    }

    fn unlock_prio_none(&self) {
        self.owner.store(0, Ordering::SeqCst);
        if self
            .futex
            .compare_exchange(1, 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            futex_wake(&self.futex, 1);
        }
    }

    // INHERIT: state transitions happen under the internal lock so that a
    // blocked waiter can observe a stable owner to boost.

    fn lock_prio_inherit(&self) {
        let me = current();
        loop {
            let mut locked = false;
            self.internal.lock();
            if self.futex.load(Ordering::SeqCst) == 0 {
                self.futex.store(1, Ordering::SeqCst);
                self.owner.store(me.as_usize(), Ordering::SeqCst);
                sched::inherit_register(self);
                locked = true;
            } else {
                sched::inherit_boost(self);
            }
            self.internal.unlock();
            if locked {
                return;
            }
            // Not a cancellation point: the boost recorded for this waiter
            // stands until the owner releases, so the waiter must come back
            // and either take the mutex or boost again.
            let _ = futex_wait(&self.futex, 1);
        }
    }

    fn trylock_prio_inherit(&self) -> Result<()> {
        let me = current();
        let mut locked = false;
        self.internal.lock();
        if self.futex.load(Ordering::SeqCst) == 0 {
            self.futex.store(1, Ordering::SeqCst);
            self.owner.store(me.as_usize(), Ordering::SeqCst);
            sched::inherit_register(self);
            locked = true;
        }
        self.internal.unlock();
        if locked { Ok(()) } else { Err(EBUSY) }
    }

    fn unlock_prio_inherit(&self) {
        self.internal.lock();
        sched::inherit_unregister(self);
        self.owner.store(0, Ordering::SeqCst);
        self.futex.store(0, Ordering::SeqCst);
        futex_wake(&self.futex, 1);
        self.internal.unlock();
    }

    // ---------------------------------------------------------------------
    // Priority ceiling access
    // ---------------------------------------------------------------------

    /// Current ceiling priority of a PROTECT mutex.
    pub fn getprioceiling(&self) -> Result<i32> {
        Ok(SchedInfo::from_raw(self.sched_info.load(Ordering::SeqCst)).priority())
    }

    /// Swap the ceiling of a PROTECT mutex, returning the old one.
    ///
    /// If the caller does not already hold the mutex it is acquired for the
    /// duration of the swap, serializing against active holders.
    pub fn setprioceiling(&self, ceiling: i32) -> Result<i32> {
        if self.protocol() != Protocol::Protect {
            return Err(EINVAL);
        }
        if !(0..=99).contains(&ceiling) {
            return Err(EINVAL);
        }

        let locked_here = if self.owned_by_current() {
            false
        } else {
            self.lock()?;
            true
        };

        let old = SchedInfo::from_raw(self.sched_info.load(Ordering::SeqCst)).priority();
        self.sched_info
            .store(SchedInfo::pack(Policy::Fifo, ceiling).raw(), Ordering::SeqCst);

        if locked_here {
            self.unlock()?;
        }
        Ok(old)
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime;

    #[test]
    fn zeroed_bytes_are_a_valid_normal_none_mutex() {
        runtime::init().unwrap();
        // The static-initializer contract: all-zero memory is an unlocked
        // NORMAL/NONE mutex.
        // SAFETY: Mutex is repr(C) over atomics; zero is a valid bit
        // pattern for every field.
        let m: Mutex = unsafe { core::mem::zeroed() };
        assert_eq!(m.trylock(), Ok(()));
        assert_eq!(m.trylock(), Err(EBUSY));
        assert_eq!(m.unlock(), Ok(()));
    }

    #[test]
    fn attr_type_roundtrip() {
        let mut attr = MutexAttr::new();
        assert_eq!(attr.get_type(), MutexType::Normal);
        attr.set_type(MutexType::Recursive).unwrap();
        assert_eq!(attr.get_type(), MutexType::Recursive);
        attr.set_type(MutexType::Errorcheck).unwrap();
        assert_eq!(attr.get_type(), MutexType::Errorcheck);
    }

    #[test]
    fn attr_ceiling_range_checked() {
        let mut attr = MutexAttr::new();
        assert_eq!(attr.set_prioceiling(100), Err(EINVAL));
        assert_eq!(attr.set_prioceiling(-1), Err(EINVAL));
        assert_eq!(attr.set_prioceiling(99), Ok(()));
        assert_eq!(attr.get_prioceiling(), 99);
    }

    #[test]
    fn errorcheck_relock_and_foreign_unlock() {
        runtime::init().unwrap();
        let mut attr = MutexAttr::new();
        attr.set_type(MutexType::Errorcheck).unwrap();
        let m = Mutex::with_attr(&attr);

        assert_eq!(m.unlock(), Err(EPERM)); // unlocked
        assert_eq!(m.lock(), Ok(()));
        assert_eq!(m.lock(), Err(EDEADLK)); // relock by owner
        assert_eq!(m.unlock(), Ok(()));
    }

    #[test]
    fn recursive_depth_counting() {
        runtime::init().unwrap();
        let mut attr = MutexAttr::new();
        attr.set_type(MutexType::Recursive).unwrap();
        let m = Mutex::with_attr(&attr);

        for _ in 0..3 {
            assert_eq!(m.lock(), Ok(()));
        }
        assert_eq!(m.trylock(), Ok(()));
        for _ in 0..4 {
            assert_eq!(m.unlock(), Ok(()));
        }
        // Fully released: a fresh trylock works.
        assert_eq!(m.trylock(), Ok(()));
        assert_eq!(m.unlock(), Ok(()));
        // And a further unlock is a permission error.
        assert_eq!(m.unlock(), Err(EPERM));
    }

    #[test]
    fn prioceiling_requires_protect() {
        runtime::init().unwrap();
        let m = Mutex::new();
        assert_eq!(m.setprioceiling(10), Err(EINVAL));

        let mut attr = MutexAttr::new();
        attr.set_protocol(Protocol::Protect).unwrap();
        attr.set_prioceiling(20).unwrap();
        let p = Mutex::with_attr(&attr);
        assert_eq!(p.getprioceiling(), Ok(20));
        assert_eq!(p.setprioceiling(30), Ok(20));
        assert_eq!(p.getprioceiling(), Ok(30));
        assert_eq!(p.setprioceiling(101), Err(EINVAL));
    }
}
