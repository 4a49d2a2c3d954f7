use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Suffix appended to a step name in `compensations_run` when its
/// compensation returned an error.
pub const COMPENSATION_FAILED_SUFFIX: &str = " (FAILED)";

/// Persisted record of one saga run.
///
/// Exactly one log exists per `(saga_name, request_id)`; re-running the same
/// request overwrites it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaLog {
    pub saga_name: String,
    pub request_id: String,
    /// Names of steps whose action completed, in execution order.
    #[serde(default)]
    pub steps_completed: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at_step: Option<String>,
    /// Compensations in the order they ran (reverse step order).
    #[serde(default)]
    pub compensations_run: Vec<String>,
    /// Set only when every step completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl SagaLog {
    #[must_use]
    pub fn new(saga_name: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self {
            saga_name: saga_name.into(),
            request_id: request_id.into(),
            steps_completed: Vec::new(),
            failed_at_step: None,
            compensations_run: Vec::new(),
            completed_at: None,
        }
    }

    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.failed_at_step.is_none() && self.completed_at.is_some()
    }

    pub(crate) fn record_completed(&mut self, step: &str) {
        self.steps_completed.push(step.to_string());
    }

    pub(crate) fn record_failed(&mut self, step: &str) {
        self.failed_at_step = Some(step.to_string());
    }

    pub(crate) fn record_compensated(&mut self, step: &str) {
        self.compensations_run.push(step.to_string());
    }

    pub(crate) fn record_compensation_failed(&mut self, step: &str) {
        self.compensations_run
            .push(format!("{step}{COMPENSATION_FAILED_SUFFIX}"));
    }

    /// Steps whose compensation errored.
    pub fn failed_compensations(&self) -> impl Iterator<Item = &str> {
        self.compensations_run
            .iter()
            .filter_map(|entry| entry.strip_suffix(COMPENSATION_FAILED_SUFFIX))
    }

    /// One line per step for display.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut lines = Vec::new();
        for step in &self.steps_completed {
            let status = if self.compensations_run.iter().any(|c| c == step) {
                "↩"
            } else if self.failed_compensations().any(|c| c == step) {
                "⚠"
            } else {
                "✓"
            };
            lines.push(format!("{status} {step}"));
        }
        if let Some(failed) = &self.failed_at_step {
            lines.push(format!("✗ {failed}"));
        }
        lines.join("\n")
    }
}
