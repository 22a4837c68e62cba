//! The end-to-end scenarios.
//!
//! Every module exposes `run(..) -> Result<ScenarioReport, ScenarioError>`.
//! Scenarios assume [`crate::ensure_runtime`] has been called on the
//! invoking thread.

pub mod cancel_modes;
pub mod condvar_broadcast;
pub mod heap_fuzz;
pub mod join_states;
pub mod mutex_conformance;
pub mod prio_inherit;

use core::time::Duration;

use crate::error::ScenarioError;

/// Poll `predicate` until it holds or roughly two seconds pass.
pub(crate) fn wait_until(
    what: &'static str,
    mut predicate: impl FnMut() -> bool,
) -> Result<(), ScenarioError> {
    for _ in 0..2000 {
        if predicate() {
            return Ok(());
        }
        spindle_core::thread::sleep(Duration::from_millis(1));
    }
    Err(ScenarioError::Timeout(what))
}
