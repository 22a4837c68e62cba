//! Cancellation modes and cleanup ordering.

use spindle_harness::{ensure_runtime, scenarios};

#[test]
fn disabled_deferred_async_and_cleanup_order() {
    ensure_runtime();
    let report = scenarios::cancel_modes::run().expect("cancel modes");
    assert!(report.passed);
}
