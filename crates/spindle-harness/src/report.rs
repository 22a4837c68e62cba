//! Structured scenario results.

use serde::Serialize;

/// Outcome of one scenario run.
#[derive(Debug, Serialize)]
pub struct ScenarioReport {
    /// Scenario identifier.
    pub name: &'static str,
    /// Whether every check held.
    pub passed: bool,
    /// Human-readable observations, in order.
    pub details: Vec<String>,
}

impl ScenarioReport {
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            passed: true,
            details: Vec::new(),
        }
    }

    pub fn note(&mut self, detail: impl Into<String>) {
        self.details.push(detail.into());
    }
}
