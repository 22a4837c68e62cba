//! Once under cancellation: the gate reopens when its executor is
//! cancelled mid-initializer, and exactly one execution ever completes.

use core::sync::atomic::{AtomicU32, Ordering};
use core::time::Duration;

use spindle_core::cancel::{self, CANCELED_RETVAL};
use spindle_core::thread::{self, Attr, Once, once};
use spindle_harness::ensure_runtime;

static GATE: Once = Once::new();
static ATTEMPTS: AtomicU32 = AtomicU32::new(0);
static COMPLETIONS: AtomicU32 = AtomicU32::new(0);

extern "C" fn initializer() {
    let attempt = ATTEMPTS.fetch_add(1, Ordering::SeqCst);
    if attempt == 0 {
        // First executor hangs at cancellation points until cancelled.
        loop {
            thread::sleep(Duration::from_millis(2));
            cancel::testcancel();
        }
    }
    COMPLETIONS.fetch_add(1, Ordering::SeqCst);
}

extern "C" fn run_once(_arg: usize) -> usize {
    once(&GATE, initializer).unwrap();
    0
}

#[test]
fn cancelled_executor_reopens_the_gate() {
    ensure_runtime();
    let attr = Attr::new();

    let first = thread::create(&attr, run_once, 0).unwrap();
    // Wait for the first executor to be inside the initializer.
    while ATTEMPTS.load(Ordering::SeqCst) == 0 {
        thread::sleep(Duration::from_millis(1));
    }
    cancel::cancel(first).unwrap();
    assert_eq!(thread::join(first), Ok(CANCELED_RETVAL));
    assert_eq!(COMPLETIONS.load(Ordering::SeqCst), 0);

    // The reset gate admits a second executor, which completes.
    let second = thread::create(&attr, run_once, 0).unwrap();
    assert_eq!(thread::join(second), Ok(0));
    assert_eq!(COMPLETIONS.load(Ordering::SeqCst), 1);

    // The gate is done: further callers return without executing.
    once(&GATE, initializer).unwrap();
    assert_eq!(ATTEMPTS.load(Ordering::SeqCst), 2);
    assert_eq!(COMPLETIONS.load(Ordering::SeqCst), 1);
}
