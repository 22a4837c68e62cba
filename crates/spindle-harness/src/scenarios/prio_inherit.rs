//! Priority inheritance: a NORMAL-policy holder of three INHERIT mutexes
//! is boosted to the maximum waiter scheduling and restored after release.

use core::sync::atomic::{AtomicU32, Ordering};
use core::time::Duration;

use spindle_core::sched::{self, Policy};
use spindle_core::thread::{self, Attr, current};
use spindle_core::{Mutex, MutexAttr, Protocol};

use crate::check;
use crate::error::{ScenarioError, rt};
use crate::report::ScenarioReport;
use crate::scenarios::wait_until;

struct Shared {
    m: [Mutex; 3],
    holder_ready: AtomicU32,
    release: AtomicU32,
    waiters_done: AtomicU32,
}

fn inherit_mutex() -> Mutex {
    let mut attr = MutexAttr::new();
    attr.set_protocol(Protocol::Inherit).unwrap();
    Mutex::with_attr(&attr)
}

/// T0: takes all three mutexes, parks until told to release, then releases
/// in LIFO order.
extern "C" fn holder(arg: usize) -> usize {
    // SAFETY: arg points to the leaked Shared.
    let s = unsafe { &*(arg as *const Shared) };
    for m in &s.m {
        m.lock().unwrap();
    }
    s.holder_ready.store(1, Ordering::SeqCst);
    while s.release.load(Ordering::SeqCst) == 0 {
        thread::sleep(Duration::from_millis(1));
    }
    // LIFO: the acquisition order was m0, m1, m2.
    s.m[2].unlock().unwrap();
    s.m[1].unlock().unwrap();
    s.m[0].unlock().unwrap();
    while s.waiters_done.load(Ordering::SeqCst) != 4 {
        thread::sleep(Duration::from_millis(1));
    }
    0
}

/// Waiter: applies its own scheduling, then blocks on one of the mutexes.
/// The argument packs mutex index, policy, and priority.
extern "C" fn waiter(arg: usize) -> usize {
    let mutex_idx = arg & 0xf;
    let policy = match (arg >> 4) & 0xf {
        1 => Policy::Fifo,
        2 => Policy::Rr,
        _ => Policy::Normal,
    };
    let priority = (arg >> 8) as i32;
    sched::setschedparam(current(), policy, priority).unwrap();

    // SAFETY: the shared block address was published before any waiter ran.
    let s = unsafe { &*(shared_addr() as *const Shared) };
    s.m[mutex_idx].lock().unwrap();
    s.m[mutex_idx].unlock().unwrap();
    s.waiters_done.fetch_add(1, Ordering::SeqCst);
    0
}

use core::sync::atomic::AtomicUsize;
static SHARED_ADDR: AtomicUsize = AtomicUsize::new(0);

fn shared_addr() -> usize {
    SHARED_ADDR.load(Ordering::SeqCst)
}

const fn waiter_arg(mutex_idx: usize, policy: Policy, priority: i32) -> usize {
    mutex_idx | ((policy as usize) << 4) | ((priority as usize) << 8)
}

pub fn run() -> Result<ScenarioReport, ScenarioError> {
    let mut report = ScenarioReport::new("prio-inherit");

    let s = Box::leak(Box::new(Shared {
        m: [inherit_mutex(), inherit_mutex(), inherit_mutex()],
        holder_ready: AtomicU32::new(0),
        release: AtomicU32::new(0),
        waiters_done: AtomicU32::new(0),
    }));
    SHARED_ADDR.store(s as *const Shared as usize, Ordering::SeqCst);

    let attr = Attr::new();
    let t0 = rt("create", thread::create(&attr, holder, s as *const Shared as usize))?;
    wait_until("holder to own all mutexes", || {
        s.holder_ready.load(Ordering::SeqCst) == 1
    })?;

    let (policy0, prio0) = rt("getschedparam", sched::getschedparam(t0))?;
    check!(
        policy0 == Policy::Normal && prio0 == 0,
        "holder must start at (NORMAL, 0), saw ({policy0:?}, {prio0})"
    );

    // T1 (NORMAL,0) on m2; T2 (FIFO,5) on m0; T3 (RR,6) and T4 (RR,7) on m1.
    let waiters = [
        rt("create", thread::create(&attr, waiter, waiter_arg(2, Policy::Normal, 0)))?,
        rt("create", thread::create(&attr, waiter, waiter_arg(0, Policy::Fifo, 5)))?,
        rt("create", thread::create(&attr, waiter, waiter_arg(1, Policy::Rr, 6)))?,
        rt("create", thread::create(&attr, waiter, waiter_arg(1, Policy::Rr, 7)))?,
    ];

    // With every waiter pending, the holder must run at least at (RR, 7).
    wait_until("holder boosted to the maximum waiter", || {
        matches!(sched::getschedparam(t0), Ok((Policy::Rr, p)) if p >= 7)
    })?;
    report.note("holder boosted to (RR, 7) while waiters pend");

    s.release.store(1, Ordering::SeqCst);
    for t in waiters {
        rt("join", thread::join(t))?;
    }

    // All mutexes released: back to the user-requested scheduling.
    wait_until("holder restored to (NORMAL, 0)", || {
        sched::getschedparam(t0) == Ok((Policy::Normal, 0))
    })?;
    report.note("holder restored to (NORMAL, 0) after LIFO release");

    rt("join", thread::join(t0))?;
    Ok(report)
}
