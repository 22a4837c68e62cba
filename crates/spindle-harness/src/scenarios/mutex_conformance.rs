//! Mutex type conformance: ERRORCHECK and RECURSIVE semantics, including
//! cross-thread permission errors.

use spindle_core::errno::{EDEADLK, EPERM};
use spindle_core::thread::{self, Attr};
use spindle_core::{Mutex, MutexAttr, MutexType};

use crate::check;
use crate::error::{ScenarioError, rt};
use crate::report::ScenarioReport;

struct ForeignUnlock {
    mutex: Mutex,
}

/// Attempts to unlock a mutex some other thread holds; returns the errno.
extern "C" fn foreign_unlocker(arg: usize) -> usize {
    // SAFETY: arg points to a leaked ForeignUnlock.
    let s = unsafe { &*(arg as *const ForeignUnlock) };
    match s.mutex.unlock() {
        Ok(()) => 0,
        Err(e) => e as usize,
    }
}

fn expect_foreign_unlock_eperm(
    attr: &MutexAttr,
    label: &str,
    report: &mut ScenarioReport,
) -> Result<(), ScenarioError> {
    let s = Box::leak(Box::new(ForeignUnlock {
        mutex: Mutex::with_attr(attr),
    }));
    rt("mutex_lock", s.mutex.lock())?;

    let t = rt(
        "create",
        thread::create(&Attr::new(), foreign_unlocker, s as *const ForeignUnlock as usize),
    )?;
    let errno = rt("join", thread::join(t))?;
    check!(
        errno == EPERM as usize,
        "{label}: foreign unlock returned {errno}, want EPERM"
    );
    rt("mutex_unlock", s.mutex.unlock())?;
    report.note(format!("{label}: foreign unlock rejected with EPERM"));
    Ok(())
}

/// ERRORCHECK and RECURSIVE conformance checks.
pub fn run() -> Result<ScenarioReport, ScenarioError> {
    let mut report = ScenarioReport::new("mutex-conformance");

    // ERRORCHECK: double lock by the same thread is EDEADLK.
    let mut attr = MutexAttr::new();
    rt("mutexattr_settype", attr.set_type(MutexType::Errorcheck))?;
    let m = Mutex::with_attr(&attr);
    rt("mutex_lock", m.lock())?;
    check!(
        m.lock() == Err(EDEADLK),
        "errorcheck relock must return EDEADLK"
    );
    rt("mutex_unlock", m.unlock())?;
    check!(
        m.unlock() == Err(EPERM),
        "errorcheck unlock of unlocked mutex must return EPERM"
    );
    report.note("errorcheck: relock EDEADLK, over-unlock EPERM");

    expect_foreign_unlock_eperm(&attr, "errorcheck", &mut report)?;

    // RECURSIVE: three locks, three unlocks, by the same thread.
    let mut attr = MutexAttr::new();
    rt("mutexattr_settype", attr.set_type(MutexType::Recursive))?;
    let m = Mutex::with_attr(&attr);
    for depth in 1..=3 {
        rt("mutex_lock", m.lock())?;
        log::trace!("recursive depth {depth}");
    }
    for _ in 0..3 {
        rt("mutex_unlock", m.unlock())?;
    }
    check!(
        m.trylock() == Ok(()),
        "recursive mutex must be free after balanced unlocks"
    );
    rt("mutex_unlock", m.unlock())?;
    report.note("recursive: 3x lock + 3x unlock balances");

    expect_foreign_unlock_eperm(&attr, "recursive", &mut report)?;

    Ok(report)
}
