//! The explicit-scheduling creation handshake: the child parks until the
//! creator has applied the attribute's policy, and a rejected policy tears
//! the child down before it ever runs user code.

use core::sync::atomic::{AtomicU32, Ordering};

use spindle_core::errno::EINVAL;
use spindle_core::sched::{self, Policy};
use spindle_core::thread::{self, Attr, InheritSched};
use spindle_harness::ensure_runtime;

static RAN: AtomicU32 = AtomicU32::new(0);

extern "C" fn observe_sched(_arg: usize) -> usize {
    let (policy, priority) = sched::getschedparam(thread::current()).unwrap();
    ((policy as usize) << 8) | priority as usize
}

extern "C" fn never_runs(_arg: usize) -> usize {
    RAN.fetch_add(1, Ordering::SeqCst);
    0
}

#[test]
fn explicit_attributes_apply_before_first_instruction() {
    ensure_runtime();
    let mut attr = Attr::new();
    attr.set_inherit_sched(InheritSched::Explicit).unwrap();
    attr.set_sched_policy(Policy::Rr).unwrap();
    attr.set_sched_priority(3).unwrap();

    let t = thread::create(&attr, observe_sched, 0).unwrap();
    let packed = thread::join(t).unwrap();
    assert_eq!(packed >> 8, Policy::Rr as usize);
    assert_eq!(packed & 0xff, 3);
}

#[test]
fn rejected_explicit_policy_fails_create_and_leaves_no_thread() {
    ensure_runtime();

    // FIFO with priority 0 is invalid at the kernel regardless of
    // privilege, so the handshake must fail deterministically.
    let mut attr = Attr::new();
    attr.set_inherit_sched(InheritSched::Explicit).unwrap();
    attr.set_sched_policy(Policy::Fifo).unwrap();
    attr.set_sched_priority(0).unwrap();

    assert_eq!(thread::create(&attr, never_runs, 0), Err(EINVAL));
    // The parked child was told to exit without running user code.
    std::thread::sleep(std::time::Duration::from_millis(50));
    assert_eq!(RAN.load(Ordering::SeqCst), 0);
}
