//! Condition-variable wakeups: five parked waiters, five single signals
//! plus a broadcast, no lost wakeup, no spurious survivor.

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use spindle_core::thread::{self, Attr, Thread};
use spindle_core::{Cond, Mutex};

use crate::check;
use crate::error::{ScenarioError, rt};
use crate::report::ScenarioReport;
use crate::scenarios::wait_until;

const WAITERS: usize = 5;

struct Shared {
    mutex: Mutex,
    cond: Cond,
    go: AtomicU32,
    parked: AtomicU32,
    counter: AtomicUsize,
}

extern "C" fn waiter(arg: usize) -> usize {
    // SAFETY: arg points to the leaked Shared.
    let s = unsafe { &*(arg as *const Shared) };
    s.mutex.lock().unwrap();
    s.parked.fetch_add(1, Ordering::SeqCst);
    while s.go.load(Ordering::SeqCst) == 0 {
        s.cond.wait(&s.mutex).unwrap();
    }
    // Holding the mutex: bump the shared counter.
    let seen = s.counter.fetch_add(1, Ordering::SeqCst) + 1;
    s.mutex.unlock().unwrap();
    seen
}

pub fn run() -> Result<ScenarioReport, ScenarioError> {
    let mut report = ScenarioReport::new("condvar-broadcast");

    let s = Box::leak(Box::new(Shared {
        mutex: Mutex::new(),
        cond: Cond::new(),
        go: AtomicU32::new(0),
        parked: AtomicU32::new(0),
        counter: AtomicUsize::new(0),
    }));

    let attr = Attr::new();
    let threads: Vec<Thread> = (0..WAITERS)
        .map(|_| rt("create", thread::create(&attr, waiter, s as *const Shared as usize)))
        .collect::<Result<_, _>>()?;

    wait_until("waiters to take the mutex", || {
        s.parked.load(Ordering::SeqCst) as usize == WAITERS
    })?;
    // The counter went up inside the mutex; by the time we can take it,
    // every waiter is inside `wait` having released it.
    rt("mutex_lock", s.mutex.lock())?;
    s.go.store(1, Ordering::SeqCst);
    rt("mutex_unlock", s.mutex.unlock())?;

    for _ in 0..WAITERS {
        rt("cond_signal", s.cond.signal())?;
    }
    rt("cond_broadcast", s.cond.broadcast())?;

    for t in threads {
        let ret = rt("join", thread::join(t))?;
        check!(
            (1..=WAITERS).contains(&ret),
            "waiter returned counter value {ret}"
        );
    }
    let total = s.counter.load(Ordering::SeqCst);
    check!(total == WAITERS, "counter reached {total}, want {WAITERS}");
    report.note("five signals + broadcast woke exactly the five waiters");

    // A second broadcast finds no waiters and does nothing.
    rt("cond_broadcast", s.cond.broadcast())?;
    check!(
        s.counter.load(Ordering::SeqCst) == WAITERS,
        "broadcast with no waiters must not change anything"
    );
    report.note("second broadcast is a no-op");

    Ok(report)
}
