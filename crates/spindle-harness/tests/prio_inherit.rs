//! Priority protocols: inheritance scenario and ceiling protection.

use spindle_core::sched::{self, Policy};
use spindle_core::thread::current;
use spindle_core::{Mutex, MutexAttr, Protocol};
use spindle_harness::{ensure_runtime, scenarios};

#[test]
fn inheritance_boosts_and_restores_holder() {
    ensure_runtime();
    let report = scenarios::prio_inherit::run().expect("prio inherit");
    assert!(report.passed);
}

#[test]
fn protect_ceiling_applies_while_held() {
    ensure_runtime();
    let me = current();
    sched::setschedparam(me, Policy::Normal, 0).unwrap();

    let mut attr = MutexAttr::new();
    attr.set_protocol(Protocol::Protect).unwrap();
    attr.set_prioceiling(12).unwrap();
    let m = Mutex::with_attr(&attr);

    m.lock().unwrap();
    let (policy, priority) = sched::getschedparam(me).unwrap();
    assert!(
        priority >= 12,
        "effective priority {priority} below the ceiling while holding"
    );
    assert_eq!(policy, Policy::Fifo);
    m.unlock().unwrap();

    assert_eq!(sched::getschedparam(me), Ok((Policy::Normal, 0)));
}

#[test]
fn nested_protect_ceilings_track_the_highest() {
    ensure_runtime();
    let me = current();
    sched::setschedparam(me, Policy::Normal, 0).unwrap();

    let make = |ceiling: i32| {
        let mut attr = MutexAttr::new();
        attr.set_protocol(Protocol::Protect).unwrap();
        attr.set_prioceiling(ceiling).unwrap();
        Mutex::with_attr(&attr)
    };
    let low = make(5);
    let high = make(20);

    low.lock().unwrap();
    assert_eq!(sched::getschedparam(me).unwrap().1, 5);
    high.lock().unwrap();
    assert_eq!(sched::getschedparam(me).unwrap().1, 20);
    // Releasing the high ceiling falls back to the low one, not to zero.
    high.unlock().unwrap();
    assert_eq!(sched::getschedparam(me).unwrap().1, 5);
    low.unlock().unwrap();
    assert_eq!(sched::getschedparam(me), Ok((Policy::Normal, 0)));
}
