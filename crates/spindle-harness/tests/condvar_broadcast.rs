//! Condvar wakeup accounting.

use spindle_harness::{ensure_runtime, scenarios};

#[test]
fn signals_then_broadcast_wake_every_waiter() {
    ensure_runtime();
    // Repeat to shake out lost-wakeup windows; each run builds fresh state.
    for round in 0..5 {
        let report = scenarios::condvar_broadcast::run()
            .unwrap_or_else(|e| panic!("round {round}: {e}"));
        assert!(report.passed);
    }
}
