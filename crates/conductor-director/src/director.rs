use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conductor_core::{
    Clock, EventSink, PipelineEvent, RepeatingTask, TimerFuture, TimerHandle, event_types,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::error::{BoxError, DirectorError, Result};
use crate::manifest::{ManifestManager, ReadyItem};

/// Stream that director events are published on.
pub const DIRECTOR_STREAM: &str = "director";

/// Result of a successful merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Merged {
    /// New head of the main branch.
    pub sha: String,
}

/// Merges one ready item into main.
#[async_trait]
pub trait Integrator: Send + Sync {
    /// # Errors
    ///
    /// Returns an error when the item could not be integrated.
    async fn integrate(&self, item: &ReadyItem) -> std::result::Result<Merged, BoxError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    Manual,
    Scheduled,
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Manual => "manual",
            Self::Scheduled => "scheduled",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegratedItem {
    pub branch: String,
    pub sha: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedItem {
    pub branch: String,
    pub error: String,
}

/// What one integration cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub trigger: Trigger,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub integrated: Vec<IntegratedItem>,
    pub failed: Vec<FailedItem>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// A scheduled tick arrived while another cycle was in flight.
    Skipped,
    Completed(CycleReport),
}

impl CycleOutcome {
    #[must_use]
    pub fn report(&self) -> Option<&CycleReport> {
        match self {
            Self::Skipped => None,
            Self::Completed(report) => Some(report),
        }
    }
}

/// Clears the running flag however the cycle ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl<'a> RunningGuard<'a> {
    fn set(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        Self(flag)
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Integrates ready branches from the manifest, on a schedule or on demand.
///
/// At most one cycle reads the manifest and calls the integrator at a time.
/// A scheduled tick that finds a cycle in flight is dropped; a manual
/// trigger waits for the in-flight cycle and then runs.
pub struct Director {
    manifest: Arc<dyn ManifestManager>,
    integrator: Arc<dyn Integrator>,
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    cycle_lock: tokio::sync::Mutex<()>,
    running: AtomicBool,
    schedule: Mutex<Option<TimerHandle>>,
}

impl std::fmt::Debug for Director {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Director")
            .field("running", &self.is_running())
            .field("scheduled", &self.is_scheduled())
            .finish_non_exhaustive()
    }
}

impl Director {
    #[must_use]
    pub fn new(
        manifest: Arc<dyn ManifestManager>,
        integrator: Arc<dyn Integrator>,
        sink: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            manifest,
            integrator,
            sink,
            clock,
            cycle_lock: tokio::sync::Mutex::new(()),
            running: AtomicBool::new(false),
            schedule: Mutex::new(None),
        }
    }

    /// Whether a cycle is currently in flight.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_scheduled(&self) -> bool {
        self.lock_schedule().is_some()
    }

    /// Run a scheduled cycle every `interval_ms`. Non-positive intervals
    /// arm nothing. Restarting replaces the previous schedule.
    pub fn start_schedule(self: &Arc<Self>, interval_ms: i64) {
        let Ok(interval_ms) = u64::try_from(interval_ms) else {
            debug!(interval_ms, "negative interval; schedule not started");
            return;
        };
        if interval_ms == 0 {
            debug!("zero interval; schedule not started");
            return;
        }

        let director = Arc::downgrade(self);
        let task: RepeatingTask = Arc::new(move || -> TimerFuture {
            let director = director.clone();
            Box::pin(async move {
                let Some(director) = director.upgrade() else {
                    return;
                };
                if let Err(e) = director.run_cycle(Trigger::Scheduled).await {
                    warn!(error = %e, "scheduled cycle failed");
                }
            })
        });

        let handle = self.clock.every(Duration::from_millis(interval_ms), task);
        if let Some(previous) = self.lock_schedule().replace(handle) {
            previous.cancel();
        }
        info!(interval_ms, "director schedule started");
    }

    /// Cancel the schedule. Safe to call when none is armed.
    pub fn stop_schedule(&self) {
        if let Some(handle) = self.lock_schedule().take() {
            handle.cancel();
            info!("director schedule stopped");
        }
    }

    /// Run one integration cycle.
    ///
    /// Integration failures are isolated per item and reported in the
    /// [`CycleReport`]; they do not fail the cycle.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest cannot be read.
    pub async fn run_cycle(&self, trigger: Trigger) -> Result<CycleOutcome> {
        let _cycle = match trigger {
            Trigger::Scheduled => {
                let Ok(guard) = self.cycle_lock.try_lock() else {
                    debug!("cycle in flight; dropping scheduled tick");
                    return Ok(CycleOutcome::Skipped);
                };
                guard
            }
            Trigger::Manual => self.cycle_lock.lock().await,
        };
        let _running = RunningGuard::set(&self.running);

        self.cycle(trigger).await.map(CycleOutcome::Completed)
    }

    async fn cycle(&self, trigger: Trigger) -> Result<CycleReport> {
        let started_at = self.clock.now();
        info!(%trigger, "director cycle started");
        self.publish(event_types::DIRECTOR_ACTIVATED, json!({ "trigger": trigger }));

        let manifest = match self.manifest.read().await {
            Ok(manifest) => manifest,
            Err(source) => {
                warn!(%trigger, error = %source, "failed to read manifest");
                self.publish(
                    event_types::DIRECTOR_CYCLE_FAILED,
                    json!({ "trigger": trigger, "error": source.to_string() }),
                );
                return Err(DirectorError::ManifestRead(source));
            }
        };

        let mut integrated = Vec::new();
        let mut failed = Vec::new();
        for item in &manifest.ready {
            match self.integrate(item).await {
                Ok(sha) => {
                    info!(branch = %item.branch, sha = %sha, "integrated");
                    self.publish(
                        event_types::DIRECTOR_INTEGRATED,
                        json!({ "branch": item.branch, "sha": sha }),
                    );
                    integrated.push(IntegratedItem {
                        branch: item.branch.clone(),
                        sha,
                    });
                }
                Err(error) => {
                    warn!(branch = %item.branch, error = %error, "integration failed");
                    self.publish(
                        event_types::DIRECTOR_INTEGRATION_FAILED,
                        json!({ "branch": item.branch, "error": error }),
                    );
                    failed.push(FailedItem {
                        branch: item.branch.clone(),
                        error,
                    });
                }
            }
        }

        self.publish(
            event_types::DIRECTOR_CYCLE_COMPLETED,
            json!({
                "trigger": trigger,
                "integrated": integrated.len(),
                "failed": failed.len(),
            }),
        );
        info!(
            %trigger,
            integrated = integrated.len(),
            failed = failed.len(),
            "director cycle completed"
        );

        Ok(CycleReport {
            trigger,
            started_at,
            finished_at: self.clock.now(),
            integrated,
            failed,
        })
    }

    /// Merge `item` and move the main head, returning the new head.
    async fn integrate(&self, item: &ReadyItem) -> std::result::Result<String, String> {
        let merged = self
            .integrator
            .integrate(item)
            .await
            .map_err(|e| e.to_string())?;
        self.manifest
            .update_main_head(&merged.sha)
            .await
            .map_err(|e| {
                format!(
                    "merged as {} but failed to update main head: {e}",
                    merged.sha
                )
            })?;
        Ok(merged.sha)
    }

    fn publish(&self, event_type: &str, data: Value) {
        let event = PipelineEvent::at(event_type, DIRECTOR_STREAM, self.clock.now(), data);
        if let Err(e) = self.sink.publish(event) {
            warn!(event_type, error = %e, "failed to publish director event");
        }
    }

    fn lock_schedule(&self) -> MutexGuard<'_, Option<TimerHandle>> {
        self.schedule.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Director {
    fn drop(&mut self) {
        self.stop_schedule();
    }
}
