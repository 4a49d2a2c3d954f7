//! Shared types and ports for the review-conductor engine.
//!
//! The engine crates talk to the outside world through three ports defined
//! here: [`Clock`] for time and timers, [`AppendLog`] for durable append-only
//! storage, and [`EventSink`] for publishing [`PipelineEvent`]s.

mod clock;
mod error;
mod event;
mod id;
mod sink;
mod storage;

#[cfg(any(test, feature = "testing"))]
pub use clock::ManualClock;
pub use clock::{
    Clock, MIN_PERIOD, RepeatingTask, TimerFuture, TimerHandle, TimerTask, TokioClock,
    deadline_after,
};
pub use error::CoreError;
pub use event::{PipelineEvent, event_types};
pub use id::validate_id;
pub use sink::{EventSink, NullSink};
pub use storage::{AppendLog, FileAppendLog, MemoryAppendLog};

pub type Result<T> = std::result::Result<T, CoreError>;
