use crate::error::CoreError;
use crate::event::PipelineEvent;

/// Destination for engine events.
///
/// Components that only need to publish (breakers, the DLQ, the director)
/// depend on this port rather than on a concrete event log.
pub trait EventSink: Send + Sync {
    /// Publish `event` durably.
    ///
    /// # Errors
    ///
    /// Returns an error if the event could not be persisted.
    fn publish(&self, event: PipelineEvent) -> Result<(), CoreError>;
}

/// Sink that drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _event: PipelineEvent) -> Result<(), CoreError> {
        Ok(())
    }
}
