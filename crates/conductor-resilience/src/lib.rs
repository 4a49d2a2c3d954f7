//! Failure isolation for pipeline dependencies.
//!
//! [`CircuitBreaker`] stops calls to a dependency after consecutive failures
//! and probes it again after a cooldown. [`DeadLetterQueue`] holds failed
//! units of work and redelivers them with exponential backoff until they
//! succeed or run out of retries.
//!
//! Both take their timers from a [`conductor_core::Clock`], so tests drive
//! cooldowns and backoff with a manual clock instead of sleeping.

mod circuit_breaker;
mod dlq;
mod dlq_store;
mod error;
mod registry;

pub use circuit_breaker::{
    BreakerState, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerState, HealthProbe,
};
pub use dlq::{
    DLQ_STREAM, DeadLetterQueue, DlqConfig, DlqEntry, DrainReport, Redeliver, backoff_delay,
};
pub use dlq_store::{DlqStore, FileDlqStore, MemoryDlqStore};
pub use error::{BoxError, CallError, CircuitOpenError, DlqError};
pub use registry::CircuitBreakerRegistry;
