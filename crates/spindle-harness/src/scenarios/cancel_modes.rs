//! Cancellation modes: disabled, deferred, asynchronous — plus cleanup
//! handler ordering.

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use core::time::Duration;

use spindle_core::cancel::{
    self, CANCELED_RETVAL, CancelState, CancelType, cleanup_pop, cleanup_push,
};
use spindle_core::thread::{self, Attr, Thread};

use crate::check;
use crate::error::{ScenarioError, rt};
use crate::report::ScenarioReport;
use crate::scenarios::wait_until;

const WORKERS: usize = 5;
const NORMAL_RETVAL: usize = 42;

static STARTED: AtomicU32 = AtomicU32::new(0);
static STOP: AtomicU32 = AtomicU32::new(0);

/// Runs with cancellation disabled; terminates normally when told to stop.
extern "C" fn disabled_worker(_arg: usize) -> usize {
    cancel::setcancelstate(CancelState::Disable).unwrap();
    STARTED.fetch_add(1, Ordering::SeqCst);
    while STOP.load(Ordering::SeqCst) == 0 {
        cancel::testcancel(); // no-op while disabled
        thread::sleep(Duration::from_millis(1));
    }
    NORMAL_RETVAL
}

/// Spins at explicit cancellation points until cancelled.
extern "C" fn deferred_worker(_arg: usize) -> usize {
    STARTED.fetch_add(1, Ordering::SeqCst);
    loop {
        cancel::testcancel();
        core::hint::spin_loop();
    }
}

/// Switches to asynchronous cancellation and runs with no explicit points;
/// the signal handler tears it down wherever it happens to be.
extern "C" fn async_worker(_arg: usize) -> usize {
    cancel::setcanceltype(CancelType::Asynchronous).unwrap();
    STARTED.fetch_add(1, Ordering::SeqCst);
    loop {
        thread::sleep(Duration::from_millis(1));
    }
}

fn run_mode(
    label: &str,
    worker: thread::StartFn,
    expect_canceled: bool,
    report: &mut ScenarioReport,
) -> Result<(), ScenarioError> {
    STARTED.store(0, Ordering::SeqCst);
    STOP.store(0, Ordering::SeqCst);

    let attr = Attr::new();
    let threads: Vec<Thread> = (0..WORKERS)
        .map(|i| rt("create", thread::create(&attr, worker, i)))
        .collect::<Result<_, _>>()?;

    wait_until("workers to start", || {
        STARTED.load(Ordering::SeqCst) as usize == WORKERS
    })?;

    for &t in &threads {
        rt("cancel", cancel::cancel(t))?;
    }
    // Disabled workers must survive the cancel and exit normally.
    STOP.store(1, Ordering::SeqCst);

    for (i, t) in threads.into_iter().enumerate() {
        let ret = rt("join", thread::join(t))?;
        let want = if expect_canceled {
            CANCELED_RETVAL
        } else {
            NORMAL_RETVAL
        };
        check!(
            ret == want,
            "{label} worker {i} returned {ret:#x}, want {want:#x}"
        );
    }
    report.note(format!(
        "{label}: all {WORKERS} workers {}",
        if expect_canceled {
            "joined with the cancellation sentinel"
        } else {
            "completed normally despite cancel"
        }
    ));
    Ok(())
}

// Cleanup ordering: three handlers pushed 1, 2, 3 run 3, 2, 1.

static CLEANUP_ORDER: AtomicUsize = AtomicUsize::new(0);

extern "C" fn record_cleanup(arg: usize) {
    CLEANUP_ORDER.store(
        CLEANUP_ORDER.load(Ordering::SeqCst) * 10 + arg,
        Ordering::SeqCst,
    );
}

extern "C" fn cleanup_worker(_arg: usize) -> usize {
    cleanup_push(record_cleanup, 1).unwrap();
    cleanup_push(record_cleanup, 2).unwrap();
    cleanup_push(record_cleanup, 3).unwrap();
    STARTED.fetch_add(1, Ordering::SeqCst);
    loop {
        cancel::testcancel();
        core::hint::spin_loop();
    }
    // Unreachable; the handlers run on the cancellation path.
    #[allow(unreachable_code)]
    {
        cleanup_pop(false);
        cleanup_pop(false);
        cleanup_pop(false);
        0
    }
}

pub fn run() -> Result<ScenarioReport, ScenarioError> {
    let mut report = ScenarioReport::new("cancel-modes");

    run_mode("disabled", disabled_worker, false, &mut report)?;
    run_mode("deferred", deferred_worker, true, &mut report)?;
    run_mode("async", async_worker, true, &mut report)?;

    STARTED.store(0, Ordering::SeqCst);
    CLEANUP_ORDER.store(0, Ordering::SeqCst);
    let t = rt("create", thread::create(&Attr::new(), cleanup_worker, 0))?;
    wait_until("cleanup worker to start", || {
        STARTED.load(Ordering::SeqCst) == 1
    })?;
    rt("cancel", cancel::cancel(t))?;
    let ret = rt("join", thread::join(t))?;
    check!(ret == CANCELED_RETVAL, "cleanup worker was not cancelled");
    let order = CLEANUP_ORDER.load(Ordering::SeqCst);
    check!(order == 321, "cleanup handlers ran in order {order}, want 321");
    report.note("cleanup handlers pushed 1,2,3 ran 3,2,1 on cancellation");

    Ok(report)
}
