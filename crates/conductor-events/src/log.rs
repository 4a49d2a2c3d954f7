use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use conductor_core::{
    AppendLog, CoreError, EventSink, MemoryAppendLog, PipelineEvent, validate_id,
};
use tracing::{debug, warn};

use crate::bus::{EventBus, SubscriptionId};

/// Durable, per-request event log with live fan-out.
///
/// `publish` appends the event to its request's stream and then notifies the
/// subscribers of the embedded [`EventBus`]. Publishes to the same request id
/// are serialized so storage order, subscriber order and publish order agree;
/// different request ids do not contend.
///
/// Handlers run while the request's stream is locked and must not publish to
/// that same request id synchronously.
pub struct EventLog {
    storage: Arc<dyn AppendLog>,
    bus: EventBus,
    stream_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog")
            .field("bus", &self.bus)
            .finish_non_exhaustive()
    }
}

impl EventLog {
    #[must_use]
    pub fn new(storage: Arc<dyn AppendLog>) -> Self {
        Self {
            storage,
            bus: EventBus::new(),
            stream_locks: Mutex::new(HashMap::new()),
        }
    }

    /// An event log backed by a fresh in-memory store.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryAppendLog::new()))
    }

    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&PipelineEvent) + Send + Sync + 'static,
    {
        self.bus.subscribe(handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.bus.unsubscribe(id)
    }

    /// Append `event` to its request stream, then notify subscribers.
    ///
    /// # Errors
    ///
    /// Returns an error if the request id is invalid, the event cannot be
    /// encoded, or the append fails. Subscribers are not notified of events
    /// that failed to persist.
    pub fn publish(&self, event: PipelineEvent) -> Result<(), CoreError> {
        validate_id("request id", &event.request_id)?;
        let record = serde_json::to_string(&event).map_err(|source| CoreError::Encode {
            stream: event.request_id.clone(),
            source,
        })?;

        let stream_lock = self.stream_lock(&event.request_id);
        let result = {
            let _guard = stream_lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.append_and_notify(&event, &record)
        };
        self.release_stream_lock(&event.request_id, stream_lock);
        result
    }

    fn append_and_notify(&self, event: &PipelineEvent, record: &str) -> Result<(), CoreError> {
        self.storage.append(&event.request_id, record)?;
        debug!(
            request_id = %event.request_id,
            event_type = %event.event_type,
            "published event"
        );
        self.bus.notify(event);
        Ok(())
    }

    /// Every persisted event of `request_id` in publish order.
    ///
    /// A final line that does not decode is treated as an interrupted append
    /// and skipped. File-backed storage cuts such a line before its next
    /// append.
    ///
    /// # Errors
    ///
    /// Returns an error if the request id is invalid, the read fails, or a
    /// line other than the last one is malformed.
    pub fn get_events(&self, request_id: &str) -> Result<Vec<PipelineEvent>, CoreError> {
        let lines = self.storage.read_all(request_id)?;
        let last = lines.len().saturating_sub(1);
        let mut events = Vec::with_capacity(lines.len());

        for (index, line) in lines.iter().enumerate() {
            match serde_json::from_str::<PipelineEvent>(line) {
                Ok(event) => events.push(event),
                Err(source) if index == last => {
                    warn!(request_id, line = index + 1, error = %source, "skipping torn trailing event");
                }
                Err(source) => {
                    return Err(CoreError::Decode {
                        stream: request_id.to_string(),
                        line: index + 1,
                        source,
                    });
                }
            }
        }

        Ok(events)
    }

    fn stream_lock(&self, request_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .stream_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(request_id.to_string()).or_default())
    }

    /// Forget the stream's lock once no other publisher holds a reference.
    fn release_stream_lock(&self, request_id: &str, stream_lock: Arc<Mutex<()>>) {
        let mut locks = self
            .stream_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // One reference in the map plus ours.
        if Arc::strong_count(&stream_lock) == 2 {
            locks.remove(request_id);
        }
    }

    #[cfg(test)]
    fn tracked_streams(&self) -> usize {
        self.stream_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl EventSink for EventLog {
    fn publish(&self, event: PipelineEvent) -> Result<(), CoreError> {
        EventLog::publish(self, event)
    }
}
