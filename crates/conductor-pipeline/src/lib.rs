//! Pipeline runs on top of the saga engine.
//!
//! [`PipelineRunner`] executes a [`conductor_saga::Saga`] per request,
//! publishes the run's lifecycle events, and dead-letters failed requests.
//! [`Guarded`] puts a step behind a circuit breaker, and [`Replay`] lets the
//! dead-letter queue retry a request by running its saga again.

mod guarded;
mod runner;

pub use guarded::Guarded;
pub use runner::{PipelineRunner, Replay};
