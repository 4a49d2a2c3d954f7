use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Well-known `event_type` values published by the engine.
pub mod event_types {
    pub const PIPELINE_STARTED: &str = "pipeline.started";
    pub const PIPELINE_COMPLETED: &str = "pipeline.completed";
    pub const PIPELINE_FAILED: &str = "pipeline.failed";

    pub const CIRCUIT_OPENED: &str = "circuit.opened";
    pub const CIRCUIT_HALF_OPEN: &str = "circuit.half_open";
    pub const CIRCUIT_CLOSED: &str = "circuit.closed";

    pub const DLQ_ENQUEUED: &str = "dlq.enqueued";
    pub const DLQ_REDELIVERED: &str = "dlq.redelivered";
    pub const DLQ_RESCHEDULED: &str = "dlq.rescheduled";
    pub const DLQ_EXHAUSTED: &str = "dlq.exhausted";

    pub const DIRECTOR_ACTIVATED: &str = "director.activated";
    pub const DIRECTOR_INTEGRATED: &str = "director.integrated";
    pub const DIRECTOR_INTEGRATION_FAILED: &str = "director.integration_failed";
    pub const DIRECTOR_CYCLE_COMPLETED: &str = "director.cycle_completed";
    pub const DIRECTOR_CYCLE_FAILED: &str = "director.cycle_failed";
}

/// A single entry in a request's event stream.
///
/// Events are immutable once published. Within one `request_id` the stream
/// order is the publish order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub event_type: String,
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: Value,
}

impl PipelineEvent {
    /// Create an event stamped with the current wall-clock time.
    #[must_use]
    pub fn new(event_type: impl Into<String>, request_id: impl Into<String>, data: Value) -> Self {
        Self::at(event_type, request_id, Utc::now(), data)
    }

    /// Create an event with an explicit timestamp, typically taken from a
    /// [`Clock`](crate::Clock).
    #[must_use]
    pub fn at(
        event_type: impl Into<String>,
        request_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        data: Value,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            request_id: request_id.into(),
            timestamp,
            data,
        }
    }
}
