//! Benchmark support for the spindle runtime.
//!
//! The crate exists for its `benches/`; the library just re-exports the
//! runtime bring-up helper the benches share.

/// Initialize the runtime for the benchmarking thread.
pub fn bench_runtime() {
    spindle_core::runtime::init().expect("runtime initialization failed");
}
