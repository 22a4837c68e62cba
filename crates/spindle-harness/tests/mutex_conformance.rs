//! Mutex conformance scenario plus static-initializer and contention
//! checks that need real second threads.

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use spindle_core::errno::EBUSY;
use spindle_core::thread::{self, Attr, Thread};
use spindle_core::{Mutex, MutexAttr, MutexType, Protocol};
use spindle_harness::{ensure_runtime, scenarios};

#[test]
fn type_conformance_scenario() {
    ensure_runtime();
    let report = scenarios::mutex_conformance::run().expect("mutex conformance");
    assert!(report.passed);
}

static COUNTER_MUTEX: Mutex = Mutex::new();
static COUNTER: AtomicUsize = AtomicUsize::new(0);

extern "C" fn contender(rounds: usize) -> usize {
    for _ in 0..rounds {
        COUNTER_MUTEX.lock().unwrap();
        // Read-modify-write made atomic only by the mutex.
        let v = COUNTER.load(Ordering::Relaxed);
        COUNTER.store(v + 1, Ordering::Relaxed);
        COUNTER_MUTEX.unlock().unwrap();
    }
    0
}

#[test]
fn statically_initialized_mutex_excludes_under_contention() {
    ensure_runtime();
    const ROUNDS: usize = 5_000;
    const THREADS: usize = 4;

    let attr = Attr::new();
    let threads: Vec<Thread> = (0..THREADS)
        .map(|_| thread::create(&attr, contender, ROUNDS).unwrap())
        .collect();
    for t in threads {
        thread::join(t).unwrap();
    }
    assert_eq!(COUNTER.load(Ordering::SeqCst), ROUNDS * THREADS);
}

struct TrylockProbe {
    mutex: Mutex,
    observed: AtomicU32,
}

extern "C" fn trylock_prober(arg: usize) -> usize {
    // SAFETY: arg points to a leaked TrylockProbe.
    let p = unsafe { &*(arg as *const TrylockProbe) };
    let e = p.mutex.trylock().expect_err("mutex is held elsewhere");
    p.observed.store(e as u32, Ordering::SeqCst);
    0
}

#[test]
fn trylock_reports_busy_across_threads() {
    ensure_runtime();
    let p = Box::leak(Box::new(TrylockProbe {
        mutex: Mutex::new(),
        observed: AtomicU32::new(0),
    }));
    p.mutex.lock().unwrap();
    let t = thread::create(&Attr::new(), trylock_prober, p as *const TrylockProbe as usize)
        .unwrap();
    thread::join(t).unwrap();
    p.mutex.unlock().unwrap();
    assert_eq!(p.observed.load(Ordering::SeqCst) as i32, EBUSY);
}

#[test]
fn mutexattr_roundtrips() {
    let mut attr = MutexAttr::new();
    attr.set_type(MutexType::Recursive).unwrap();
    attr.set_protocol(Protocol::Protect).unwrap();
    attr.set_prioceiling(44).unwrap();
    assert_eq!(attr.get_type(), MutexType::Recursive);
    assert_eq!(attr.get_protocol(), Protocol::Protect);
    assert_eq!(attr.get_prioceiling(), 44);
}

#[test]
fn init_and_destroy_reconfigure_in_place() {
    ensure_runtime();
    let m = Mutex::new();
    let mut attr = MutexAttr::new();
    attr.set_type(MutexType::Errorcheck).unwrap();
    m.init(Some(&attr)).unwrap();
    m.lock().unwrap();
    assert_eq!(m.lock(), Err(spindle_core::errno::EDEADLK));
    m.unlock().unwrap();
    m.destroy().unwrap();
}
