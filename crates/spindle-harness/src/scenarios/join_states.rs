//! Join-state matrix: ordered joins, detached threads, self-join, mutual
//! join.

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use core::time::Duration;

use spindle_core::errno::{EDEADLK, EINVAL, ESRCH};
use spindle_core::thread::{self, Attr, DetachState, Thread, current};

use crate::check;
use crate::error::{ScenarioError, rt};
use crate::report::ScenarioReport;
use crate::scenarios::wait_until;

extern "C" fn return_index(arg: usize) -> usize {
    arg
}

static DETACHED_DONE: AtomicU32 = AtomicU32::new(0);

extern "C" fn detached_worker(_arg: usize) -> usize {
    thread::sleep(Duration::from_millis(50));
    DETACHED_DONE.fetch_add(1, Ordering::SeqCst);
    0
}

static MUTUAL_PARTNER: AtomicUsize = AtomicUsize::new(0);
static PARTNER_SET: AtomicU32 = AtomicU32::new(0);

/// Second half of the mutual join: waits to be claimed, then tries to join
/// its own joiner and reports the errno.
extern "C" fn mutual_b(_arg: usize) -> usize {
    while PARTNER_SET.load(Ordering::SeqCst) == 0 {
        thread::sleep(Duration::from_millis(1));
    }
    // Give the partner time to register its join on us.
    thread::sleep(Duration::from_millis(100));
    // SAFETY: the handle stays valid — the partner cannot exit before our
    // own exit lets its join return.
    let partner = unsafe { Thread::from_usize(MUTUAL_PARTNER.load(Ordering::SeqCst)) };
    match thread::join(partner) {
        Err(e) => e as usize,
        Ok(_) => 0,
    }
}

/// First half: joins B and passes B's return value through.
extern "C" fn mutual_a(arg: usize) -> usize {
    // SAFETY: arg carries B's handle from the scenario body.
    let b = unsafe { Thread::from_usize(arg) };
    MUTUAL_PARTNER.store(current().as_usize(), Ordering::SeqCst);
    PARTNER_SET.store(1, Ordering::SeqCst);
    match thread::join(b) {
        Ok(v) => v,
        Err(e) => 10_000 + e as usize,
    }
}

pub fn run() -> Result<ScenarioReport, ScenarioError> {
    let mut report = ScenarioReport::new("join-states");
    let attr = Attr::new();

    // Five joinable threads, joined in creation order.
    let threads: Vec<Thread> = (0..5)
        .map(|i| rt("create", thread::create(&attr, return_index, i)))
        .collect::<Result<_, _>>()?;
    for (i, t) in threads.into_iter().enumerate() {
        let ret = rt("join", thread::join(t))?;
        check!(ret == i, "joinable thread {i} returned {ret}");
    }
    report.note("five joinable threads returned their indices in order");

    // Detached threads: join is EINVAL while they run, ESRCH once gone.
    DETACHED_DONE.store(0, Ordering::SeqCst);
    let mut detached_attr = Attr::new();
    rt(
        "attr_setdetachstate",
        detached_attr.set_detach_state(DetachState::Detached),
    )?;
    let detached: Vec<Thread> = (0..5)
        .map(|i| rt("create", thread::create(&detached_attr, detached_worker, i)))
        .collect::<Result<_, _>>()?;
    for (i, &t) in detached.iter().enumerate() {
        check!(
            thread::join(t) == Err(EINVAL),
            "joining running detached thread {i} must be EINVAL"
        );
    }
    wait_until("detached threads to finish", || {
        DETACHED_DONE.load(Ordering::SeqCst) == 5
    })?;
    // Their descriptors leave the used list on exit; give the last exiting
    // thread a moment to clear the pool.
    thread::sleep(Duration::from_millis(50));
    for (i, &t) in detached.iter().enumerate() {
        check!(
            thread::join(t) == Err(ESRCH),
            "joining exited detached thread {i} must be ESRCH"
        );
    }
    report.note("detached threads: EINVAL while running, ESRCH after exit");

    // Self-join.
    check!(
        thread::join(current()) == Err(EDEADLK),
        "self-join must be EDEADLK"
    );
    report.note("self-join rejected with EDEADLK");

    // Mutual join: A joins B, then B's join of A must report EDEADLK.
    PARTNER_SET.store(0, Ordering::SeqCst);
    let b = rt("create", thread::create(&attr, mutual_b, 0))?;
    let a = rt("create", thread::create(&attr, mutual_a, b.as_usize()))?;
    let b_result = rt("join", thread::join(a))?;
    check!(
        b_result == EDEADLK as usize,
        "mutual join: B observed {b_result}, want EDEADLK"
    );
    report.note("mutual join rejected with EDEADLK on the second joiner");

    Ok(report)
}
