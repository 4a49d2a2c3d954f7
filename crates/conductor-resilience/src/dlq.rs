use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conductor_core::{
    Clock, EventSink, NullSink, PipelineEvent, RepeatingTask, TimerFuture, TimerHandle,
    deadline_after, event_types, validate_id,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::dlq_store::{DlqStore, FileDlqStore, MemoryDlqStore};
use crate::error::{BoxError, DlqError};

/// Stream that queue events are published on.
pub const DLQ_STREAM: &str = "dlq";

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_BASE_DELAY_MS: u64 = 1_000;
const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY_MS
}

fn default_backoff_factor() -> f64 {
    DEFAULT_BACKOFF_FACTOR
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DlqConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// Entry file; entries stay in memory when absent.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            path: None,
        }
    }
}

impl DlqConfig {
    /// An enabled, in-memory configuration with default tuning.
    #[must_use]
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    /// Check the values keep retry deadlines strictly increasing.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid field.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.base_delay_ms == 0 {
            return Err("base_delay_ms must be greater than 0");
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err("backoff_factor must be a finite number of at least 1.0");
        }
        Ok(())
    }
}

/// `base_delay_ms * backoff_factor ^ attempt`, saturating at
/// [`Duration::MAX`].
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn backoff_delay(base_delay_ms: u64, backoff_factor: f64, attempt: u32) -> Duration {
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let millis = base_delay_ms as f64 * backoff_factor.powi(exponent);
    Duration::try_from_secs_f64(millis / 1_000.0).unwrap_or(Duration::MAX)
}

/// A failed unit of work waiting for redelivery.
///
/// Retry tuning is copied from the queue configuration at enqueue time, so
/// entries keep their schedule across configuration changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqEntry {
    pub id: String,
    pub payload: Value,
    pub attempt_count: u32,
    pub next_retry_at: DateTime<Utc>,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub backoff_factor: f64,
    pub permanently_failed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
}

impl DlqEntry {
    /// A fresh entry, first due one base delay after `now`.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        payload: Value,
        config: &DlqConfig,
        now: DateTime<Utc>,
    ) -> Self {
        let mut entry = Self {
            id: id.into(),
            payload,
            attempt_count: 0,
            next_retry_at: now,
            max_retries: config.max_retries,
            base_delay_ms: config.base_delay_ms,
            backoff_factor: config.backoff_factor,
            permanently_failed: config.max_retries == 0,
            last_error: None,
            enqueued_at: now,
        };
        entry.next_retry_at = deadline_after(now, entry.retry_delay());
        entry
    }

    /// Delay before the next attempt at the current `attempt_count`.
    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        backoff_delay(self.base_delay_ms, self.backoff_factor, self.attempt_count)
    }

    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.permanently_failed && self.next_retry_at <= now
    }

    /// Count a failed redelivery. Flags the entry once `max_retries`
    /// attempts have failed, otherwise pushes `next_retry_at` out.
    pub fn record_failure(&mut self, error: String, now: DateTime<Utc>) {
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.last_error = Some(error);
        if self.attempt_count >= self.max_retries {
            self.permanently_failed = true;
        } else {
            self.next_retry_at = deadline_after(now, self.retry_delay());
        }
    }

    fn same_generation(&self, other: &Self) -> bool {
        self.id == other.id
            && self.enqueued_at == other.enqueued_at
            && self.attempt_count == other.attempt_count
    }
}

/// Attempts to deliver a dead-lettered payload again.
#[async_trait]
pub trait Redeliver: Send + Sync {
    /// # Errors
    ///
    /// Returns an error when the redelivery attempt failed.
    async fn redeliver(&self, entry: &DlqEntry) -> Result<(), BoxError>;
}

/// What one pass over the due entries did, by entry id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub redelivered: Vec<String>,
    pub rescheduled: Vec<String>,
    pub exhausted: Vec<String>,
}

impl DrainReport {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.redelivered.is_empty() && self.rescheduled.is_empty() && self.exhausted.is_empty()
    }
}

/// Durable retry queue with exponential backoff.
///
/// Entries are keyed by id; enqueueing an id that is already queued replaces
/// the old entry and restarts its retry schedule. Entries that run out of
/// retries stay in the queue flagged `permanently_failed` and are announced
/// with a `dlq.exhausted` event.
pub struct DeadLetterQueue {
    config: DlqConfig,
    store: Arc<dyn DlqStore>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn EventSink>,
    entries_lock: Mutex<()>,
    draining: tokio::sync::Mutex<()>,
    consumer: Mutex<Option<TimerHandle>>,
}

impl std::fmt::Debug for DeadLetterQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterQueue")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DeadLetterQueue {
    #[must_use]
    pub fn new(config: DlqConfig, store: Arc<dyn DlqStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            store,
            clock,
            sink: Arc::new(NullSink),
            entries_lock: Mutex::new(()),
            draining: tokio::sync::Mutex::new(()),
            consumer: Mutex::new(None),
        }
    }

    /// Build a queue whose store follows `config.path`: a JSON file when set,
    /// memory otherwise.
    #[must_use]
    pub fn from_config(config: DlqConfig, clock: Arc<dyn Clock>) -> Self {
        let store: Arc<dyn DlqStore> = match &config.path {
            Some(path) => Arc::new(FileDlqStore::new(path)),
            None => Arc::new(MemoryDlqStore::new()),
        };
        Self::new(config, store, clock)
    }

    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    #[must_use]
    pub fn config(&self) -> &DlqConfig {
        &self.config
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Queue `payload` under `id` for redelivery.
    ///
    /// Returns `None` without storing anything when the queue is disabled.
    ///
    /// # Errors
    ///
    /// Returns an error if `id` is invalid or the store fails.
    pub fn enqueue(
        &self,
        id: impl Into<String>,
        payload: Value,
    ) -> Result<Option<DlqEntry>, DlqError> {
        let id = id.into();
        if !self.config.enabled {
            debug!(id = %id, "dead-letter queue disabled; dropping entry");
            return Ok(None);
        }
        validate_id("dlq entry id", &id)?;

        let entry = DlqEntry::new(id, payload, &self.config, self.clock.now());
        let replaced = {
            let _guard = self.lock_entries();
            let mut entries = self.store.load()?;
            let replaced = if let Some(existing) = entries.iter_mut().find(|e| e.id == entry.id) {
                *existing = entry.clone();
                true
            } else {
                entries.push(entry.clone());
                false
            };
            self.store.save(&entries)?;
            replaced
        };

        info!(
            id = %entry.id,
            replaced,
            next_retry_at = %entry.next_retry_at,
            "enqueued dead letter"
        );
        self.publish(event_types::DLQ_ENQUEUED, &entry, json!({ "replaced": replaced }));
        if entry.permanently_failed {
            self.announce_exhausted(&entry);
        }
        Ok(Some(entry))
    }

    /// Try every due entry once.
    ///
    /// Successful entries are removed; failed ones are rescheduled or, once
    /// out of retries, flagged `permanently_failed`. A pass that starts while
    /// another is still running returns an empty report.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails. Redelivery failures are not
    /// errors; they are counted in the report.
    pub async fn process_due(&self, redeliver: &dyn Redeliver) -> Result<DrainReport, DlqError> {
        let Ok(_drain) = self.draining.try_lock() else {
            debug!("dead-letter drain already in progress");
            return Ok(DrainReport::default());
        };

        let now = self.clock.now();
        let due: Vec<DlqEntry> = {
            let _guard = self.lock_entries();
            self.store
                .load()?
                .into_iter()
                .filter(|e| e.is_due(now))
                .collect()
        };

        let mut report = DrainReport::default();
        for entry in due {
            let outcome = redeliver.redeliver(&entry).await;
            let updated = {
                let _guard = self.lock_entries();
                let mut entries = self.store.load()?;
                let Some(index) = entries.iter().position(|e| e.same_generation(&entry)) else {
                    debug!(id = %entry.id, "entry replaced or removed during redelivery");
                    continue;
                };
                let updated = match outcome {
                    Ok(()) => {
                        entries.remove(index);
                        None
                    }
                    Err(e) => {
                        entries[index].record_failure(e.to_string(), self.clock.now());
                        Some(entries[index].clone())
                    }
                };
                self.store.save(&entries)?;
                updated
            };

            match updated {
                None => {
                    info!(id = %entry.id, attempt = entry.attempt_count + 1, "redelivered dead letter");
                    self.publish(event_types::DLQ_REDELIVERED, &entry, Value::Null);
                    report.redelivered.push(entry.id);
                }
                Some(failed) if failed.permanently_failed => {
                    self.announce_exhausted(&failed);
                    report.exhausted.push(failed.id);
                }
                Some(failed) => {
                    warn!(
                        id = %failed.id,
                        attempt_count = failed.attempt_count,
                        next_retry_at = %failed.next_retry_at,
                        error = failed.last_error.as_deref().unwrap_or_default(),
                        "redelivery failed; rescheduled"
                    );
                    self.publish(event_types::DLQ_RESCHEDULED, &failed, Value::Null);
                    report.rescheduled.push(failed.id);
                }
            }
        }

        Ok(report)
    }

    /// Drain due entries every `poll_interval` until [`stop`](Self::stop).
    ///
    /// Restarting replaces the previous consumer.
    pub fn start(self: &Arc<Self>, redeliver: Arc<dyn Redeliver>, poll_interval: Duration) {
        let queue = Arc::downgrade(self);
        let task: RepeatingTask = Arc::new(move || -> TimerFuture {
            let queue = queue.clone();
            let redeliver = Arc::clone(&redeliver);
            Box::pin(async move {
                let Some(queue) = queue.upgrade() else {
                    return;
                };
                if let Err(e) = queue.process_due(redeliver.as_ref()).await {
                    warn!(error = %e, "dead-letter drain failed");
                }
            })
        });

        let handle = self.clock.every(poll_interval, task);
        if let Some(previous) = self.lock_consumer().replace(handle) {
            previous.cancel();
        }
        debug!(poll_ms = poll_interval.as_millis(), "dead-letter consumer started");
    }

    /// Stop the consumer. Safe to call when it was never started.
    pub fn stop(&self) {
        if let Some(handle) = self.lock_consumer().take() {
            handle.cancel();
            debug!("dead-letter consumer stopped");
        }
    }

    #[must_use]
    pub fn is_consuming(&self) -> bool {
        self.lock_consumer().is_some()
    }

    /// All queued entries, exhausted ones included.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn entries(&self) -> Result<Vec<DlqEntry>, DlqError> {
        let _guard = self.lock_entries();
        Ok(self.store.load()?)
    }

    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn get(&self, id: &str) -> Result<Option<DlqEntry>, DlqError> {
        Ok(self.entries()?.into_iter().find(|e| e.id == id))
    }

    /// Entries that ran out of retries.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn permanently_failed(&self) -> Result<Vec<DlqEntry>, DlqError> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|e| e.permanently_failed)
            .collect())
    }

    /// Drop an entry. Returns `false` if no entry had that id.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn remove(&self, id: &str) -> Result<bool, DlqError> {
        let _guard = self.lock_entries();
        let mut entries = self.store.load()?;
        let before = entries.len();
        entries.retain(|e| e.id != id);
        if entries.len() == before {
            return Ok(false);
        }
        self.store.save(&entries)?;
        Ok(true)
    }

    fn announce_exhausted(&self, entry: &DlqEntry) {
        warn!(
            id = %entry.id,
            attempt_count = entry.attempt_count,
            max_retries = entry.max_retries,
            "dead letter permanently failed"
        );
        self.publish(event_types::DLQ_EXHAUSTED, entry, Value::Null);
    }

    fn publish(&self, event_type: &str, entry: &DlqEntry, extra: Value) {
        let mut data = json!({
            "id": entry.id,
            "attempt_count": entry.attempt_count,
            "max_retries": entry.max_retries,
            "next_retry_at": entry.next_retry_at,
            "permanently_failed": entry.permanently_failed,
            "last_error": entry.last_error,
        });
        if let (Value::Object(data), Value::Object(extra)) = (&mut data, extra) {
            data.extend(extra);
        }
        let event = PipelineEvent::at(event_type, DLQ_STREAM, self.clock.now(), data);
        if let Err(e) = self.sink.publish(event) {
            warn!(id = %entry.id, event_type, error = %e, "failed to publish dead-letter event");
        }
    }

    fn lock_entries(&self) -> MutexGuard<'_, ()> {
        self.entries_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_consumer(&self) -> MutexGuard<'_, Option<TimerHandle>> {
        self.consumer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use conductor_core::ManualClock;

    use super::*;

    #[test]
    fn backoff_grows_by_factor() {
        assert_eq!(backoff_delay(1_000, 2.0, 0), Duration::from_secs(1));
        assert_eq!(backoff_delay(1_000, 2.0, 1), Duration::from_secs(2));
        assert_eq!(backoff_delay(1_000, 2.0, 3), Duration::from_secs(8));
        assert_eq!(backoff_delay(500, 1.0, 7), Duration::from_millis(500));
    }

    #[test]
    fn backoff_saturates() {
        assert_eq!(backoff_delay(u64::MAX, 10.0, u32::MAX), Duration::MAX);
    }

    #[test]
    fn new_entry_is_due_after_base_delay() {
        let now = DateTime::<Utc>::default();
        let entry = DlqEntry::new("a", Value::Null, &DlqConfig::enabled(), now);

        assert_eq!(entry.attempt_count, 0);
        assert_eq!(entry.next_retry_at, deadline_after(now, Duration::from_secs(1)));
        assert!(!entry.is_due(now));
        assert!(entry.is_due(entry.next_retry_at));
    }

    #[test]
    fn record_failure_flags_at_max_retries() {
        let now = DateTime::<Utc>::default();
        let config = DlqConfig {
            max_retries: 2,
            ..DlqConfig::enabled()
        };
        let mut entry = DlqEntry::new("a", Value::Null, &config, now);

        entry.record_failure("first".to_string(), now);
        assert!(!entry.permanently_failed);
        assert_eq!(entry.next_retry_at, deadline_after(now, Duration::from_secs(2)));

        entry.record_failure("second".to_string(), now);
        assert!(entry.permanently_failed);
        assert_eq!(entry.attempt_count, 2);
        assert_eq!(entry.last_error.as_deref(), Some("second"));
    }

    #[test]
    fn config_validation() {
        assert!(DlqConfig::default().validate().is_ok());
        assert!(
            DlqConfig {
                base_delay_ms: 0,
                ..DlqConfig::default()
            }
            .validate()
            .is_err()
        );
        assert!(
            DlqConfig {
                backoff_factor: 0.5,
                ..DlqConfig::default()
            }
            .validate()
            .is_err()
        );
        assert!(
            DlqConfig {
                backoff_factor: f64::NAN,
                ..DlqConfig::default()
            }
            .validate()
            .is_err()
        );
    }

    #[test]
    fn disabled_queue_stores_nothing() -> anyhow::Result<()> {
        let queue = DeadLetterQueue::from_config(DlqConfig::default(), Arc::new(ManualClock::new()));

        assert!(queue.enqueue("review:req-1", Value::Null)?.is_none());
        assert!(queue.entries()?.is_empty());
        Ok(())
    }

    #[test]
    fn enqueue_replaces_same_id() -> anyhow::Result<()> {
        let queue =
            DeadLetterQueue::from_config(DlqConfig::enabled(), Arc::new(ManualClock::new()));

        queue.enqueue("review:req-1", json!(1))?;
        queue.enqueue("review:req-2", json!(2))?;
        queue.enqueue("review:req-1", json!(3))?;

        let entries = queue.entries()?;
        assert_eq!(entries.len(), 2);
        assert_eq!(
            queue.get("review:req-1")?.map(|e| e.payload),
            Some(json!(3))
        );
        Ok(())
    }

    #[test]
    fn zero_retries_is_exhausted_on_arrival() -> anyhow::Result<()> {
        let config = DlqConfig {
            max_retries: 0,
            ..DlqConfig::enabled()
        };
        let queue = DeadLetterQueue::from_config(config, Arc::new(ManualClock::new()));

        queue.enqueue("review:req-1", Value::Null)?;

        assert_eq!(queue.permanently_failed()?.len(), 1);
        Ok(())
    }

    #[test]
    fn invalid_id_is_rejected() {
        let queue =
            DeadLetterQueue::from_config(DlqConfig::enabled(), Arc::new(ManualClock::new()));

        assert!(queue.enqueue("../escape", Value::Null).is_err());
    }

    #[test]
    fn remove_reports_whether_present() -> anyhow::Result<()> {
        let queue =
            DeadLetterQueue::from_config(DlqConfig::enabled(), Arc::new(ManualClock::new()));
        queue.enqueue("a", Value::Null)?;

        assert!(queue.remove("a")?);
        assert!(!queue.remove("a")?);
        Ok(())
    }

    #[test]
    fn stop_without_start_is_a_no_op() {
        let queue =
            DeadLetterQueue::from_config(DlqConfig::enabled(), Arc::new(ManualClock::new()));

        queue.stop();
        assert!(!queue.is_consuming());
    }
}
