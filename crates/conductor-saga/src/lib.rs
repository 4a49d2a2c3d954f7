//! Saga engine for multi-step pipeline runs.
//!
//! A saga executes named steps in order against a shared, mutable context.
//! When a step fails, every step that already completed is compensated in
//! reverse order and a [`SagaLog`] of the run is persisted, one record per
//! `(saga_name, request_id)`.

mod builder;
mod error;
mod log;
mod saga;
mod step;
mod store;

pub use async_trait::async_trait;
pub use builder::SagaBuilder;
pub use error::SagaError;
pub use log::{COMPENSATION_FAILED_SUFFIX, SagaLog};
pub use saga::Saga;
pub use step::{FnAction, Step, StepAction};
pub use store::{FileSagaLogStore, MemorySagaLogStore, SagaLogStore};
