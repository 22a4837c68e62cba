//! Heap torture scenario (own process: the arena accounting is global).

use spindle_harness::{ensure_runtime, scenarios};

#[test]
fn heap_survives_realloc_churn() {
    ensure_runtime();
    let report = scenarios::heap_fuzz::run(10_000, 0x5eed_1234).expect("heap fuzz");
    assert!(report.passed);
}

#[test]
fn heap_fuzz_is_seed_deterministic_for_accounting() {
    ensure_runtime();
    // A second independent run on the same arena must also end balanced.
    let report = scenarios::heap_fuzz::run(200, 42).expect("heap fuzz");
    assert!(report.passed);
}
