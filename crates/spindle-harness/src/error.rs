//! Scenario failure types.

use thiserror::Error;

/// Why a scenario failed.
#[derive(Debug, Error)]
pub enum ScenarioError {
    /// A runtime call returned an errno.
    #[error("{op} failed: {} (errno {errno})", spindle_core::errno::strerror(*errno))]
    Runtime { op: &'static str, errno: i32 },

    /// An observable-behavior check did not hold.
    #[error("check failed: {0}")]
    Check(String),

    /// A scenario gave up waiting for a state that should have been reached.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
}

/// Tag a runtime `Result` with the operation name.
pub fn rt<T>(op: &'static str, result: Result<T, i32>) -> Result<T, ScenarioError> {
    result.map_err(|errno| ScenarioError::Runtime { op, errno })
}

/// Fail the scenario unless `cond` holds.
#[macro_export]
macro_rules! check {
    ($cond:expr, $($msg:tt)+) => {
        if !$cond {
            return Err($crate::error::ScenarioError::Check(format!($($msg)+)));
        }
    };
}
