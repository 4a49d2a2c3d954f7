use conductor_core::CoreError;
use thiserror::Error;

/// A call was refused because the dependency's breaker is open.
///
/// Distinct from a failure of the dependency itself: nothing was invoked.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("circuit for '{dependency}' is open")]
pub struct CircuitOpenError {
    pub dependency: String,
}

/// Outcome of a call made through a breaker.
#[derive(Debug, Error)]
pub enum CallError<E> {
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    #[error("dependency call failed")]
    Dependency(#[source] E),
}

#[derive(Debug, Error)]
pub enum DlqError {
    #[error(transparent)]
    Storage(#[from] CoreError),
}

/// Error a redelivery handler may return.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
