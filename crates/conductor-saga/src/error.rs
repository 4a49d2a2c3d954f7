use std::fmt::Debug;

use conductor_core::CoreError;
use thiserror::Error;

/// Error from saga execution.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SagaError<E: Debug> {
    /// A step's action failed. Completed steps have been compensated and the
    /// run log persisted; `source` is the action's original error.
    #[error("step '{step}' failed")]
    StepFailed {
        /// Name of the step that failed.
        step: String,
        /// The error returned by the step's action.
        #[source]
        source: E,
    },

    /// The run log could not be written, or the saga/request ids are not
    /// valid storage keys.
    #[error("saga log error")]
    Log(#[source] CoreError),
}

impl<E: Debug> SagaError<E> {
    /// Name of the step whose action failed, if any.
    #[must_use]
    pub fn failed_step(&self) -> Option<&str> {
        match self {
            Self::StepFailed { step, .. } => Some(step),
            Self::Log(_) => None,
        }
    }

    /// The original action error, if a step failed.
    #[must_use]
    pub fn step_error(&self) -> Option<&E> {
        match self {
            Self::StepFailed { source, .. } => Some(source),
            Self::Log(_) => None,
        }
    }

    /// Consume the error, returning the original action error if a step failed.
    #[must_use]
    pub fn into_step_error(self) -> Option<E> {
        match self {
            Self::StepFailed { source, .. } => Some(source),
            Self::Log(_) => None,
        }
    }
}
