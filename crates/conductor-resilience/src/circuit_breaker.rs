use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conductor_core::{
    Clock, EventSink, NullSink, PipelineEvent, TimerFuture, TimerHandle, deadline_after,
    event_types,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::{CallError, CircuitOpenError};

const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
const DEFAULT_RESET_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_PROBE_TIMEOUT_MS: u64 = 5_000;

fn default_failure_threshold() -> u32 {
    DEFAULT_FAILURE_THRESHOLD
}

fn default_reset_timeout_ms() -> u64 {
    DEFAULT_RESET_TIMEOUT_MS
}

fn default_probe_timeout_ms() -> u64 {
    DEFAULT_PROBE_TIMEOUT_MS
}

/// Per-dependency breaker tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures while closed that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Cooldown before an open circuit probes the dependency on its own.
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
    /// Upper bound on a single health probe.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            reset_timeout_ms: DEFAULT_RESET_TIMEOUT_MS,
            probe_timeout_ms: DEFAULT_PROBE_TIMEOUT_MS,
        }
    }
}

impl CircuitBreakerConfig {
    /// Check the values are usable.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid field.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.failure_threshold == 0 {
            return Err("failure_threshold must be at least 1");
        }
        if self.reset_timeout_ms == 0 {
            return Err("reset_timeout_ms must be greater than 0");
        }
        if self.probe_timeout_ms == 0 {
            return Err("probe_timeout_ms must be greater than 0");
        }
        Ok(())
    }

    #[must_use]
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    fn event_type(self) -> &'static str {
        match self {
            Self::Closed => event_types::CIRCUIT_CLOSED,
            Self::Open => event_types::CIRCUIT_OPENED,
            Self::HalfOpen => event_types::CIRCUIT_HALF_OPEN,
        }
    }
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        })
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub dependency_id: String,
    pub state: BreakerState,
    pub failure_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_deadline: Option<DateTime<Utc>>,
}

/// Health check run against a dependency when its breaker probes.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Whether the dependency looks healthy.
    async fn probe(&self) -> bool;
}

struct Inner {
    state: BreakerState,
    failure_count: u32,
    cooldown_deadline: Option<DateTime<Utc>>,
    cooldown: Option<TimerHandle>,
    /// Bumped each time a cooldown is armed.
    cooldown_generation: u64,
}

impl Inner {
    fn cancel_cooldown(&mut self) {
        if let Some(timer) = self.cooldown.take() {
            timer.cancel();
        }
        self.cooldown_deadline = None;
    }
}

/// Breaker guarding one external dependency.
///
/// `closed` counts consecutive failures and opens at the threshold. `open`
/// refuses calls and arms a cooldown timer on the [`Clock`]; when it fires
/// while the breaker is still open on that cooldown, the breaker probes the
/// dependency as [`CircuitBreaker::retry_now`] does.
/// `half-open` closes on a healthy probe and reopens on any failure.
///
/// State changes are applied under one lock, so concurrent callers observe
/// each `record_*` call atomically.
pub struct CircuitBreaker {
    dependency_id: String,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    probe: Arc<dyn HealthProbe>,
    sink: Arc<dyn EventSink>,
    inner: Mutex<Inner>,
    this: Weak<CircuitBreaker>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("dependency_id", &self.dependency_id)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    /// Create a closed breaker that publishes nothing.
    #[must_use]
    pub fn new(
        dependency_id: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
        probe: Arc<dyn HealthProbe>,
    ) -> Arc<Self> {
        Self::with_sink(dependency_id, config, clock, probe, Arc::new(NullSink))
    }

    /// Create a closed breaker publishing its transitions to `sink` on the
    /// `circuit:<dependency>` stream.
    #[must_use]
    pub fn with_sink(
        dependency_id: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
        probe: Arc<dyn HealthProbe>,
        sink: Arc<dyn EventSink>,
    ) -> Arc<Self> {
        let dependency_id = dependency_id.into();
        Arc::new_cyclic(|this| Self {
            dependency_id,
            config,
            clock,
            probe,
            sink,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                cooldown_deadline: None,
                cooldown: None,
                cooldown_generation: 0,
            }),
            this: this.clone(),
        })
    }

    #[must_use]
    pub fn dependency_id(&self) -> &str {
        &self.dependency_id
    }

    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    #[must_use]
    pub fn snapshot(&self) -> CircuitBreakerState {
        let inner = self.lock();
        CircuitBreakerState {
            dependency_id: self.dependency_id.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            cooldown_deadline: inner.cooldown_deadline,
        }
    }

    /// Refuse immediately while the circuit is open.
    ///
    /// # Errors
    ///
    /// Returns [`CircuitOpenError`] when the breaker is open.
    pub fn check(&self) -> Result<(), CircuitOpenError> {
        if self.state() == BreakerState::Open {
            debug!(dependency = %self.dependency_id, "short-circuiting call");
            return Err(CircuitOpenError {
                dependency: self.dependency_id.clone(),
            });
        }
        Ok(())
    }

    /// Run `f` through the breaker, recording its outcome.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::CircuitOpen`] without calling `f` while open, or
    /// [`CallError::Dependency`] with `f`'s own error.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.check()?;
        match f().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(CallError::Dependency(e))
            }
        }
    }

    pub fn record_failure(&self) {
        let opened = {
            let mut inner = self.lock();
            match inner.state {
                BreakerState::Closed => {
                    inner.failure_count =
                        (inner.failure_count + 1).min(self.config.failure_threshold);
                    debug!(
                        dependency = %self.dependency_id,
                        failure_count = inner.failure_count,
                        threshold = self.config.failure_threshold,
                        "recorded failure"
                    );
                    if inner.failure_count >= self.config.failure_threshold {
                        self.open(&mut inner);
                        true
                    } else {
                        false
                    }
                }
                // A failed probe reopens; the counter is left as it was.
                BreakerState::HalfOpen => {
                    self.open(&mut inner);
                    true
                }
                BreakerState::Open => false,
            }
        };
        if opened {
            self.publish_transition(BreakerState::Open);
        }
    }

    pub fn record_success(&self) {
        let previous = {
            let mut inner = self.lock();
            let previous = inner.state;
            inner.cancel_cooldown();
            inner.failure_count = 0;
            inner.state = BreakerState::Closed;
            previous
        };
        if previous != BreakerState::Closed {
            info!(dependency = %self.dependency_id, "circuit closed");
            self.publish_transition(BreakerState::Closed);
        }
    }

    /// Probe the dependency now, closing or reopening on the result.
    ///
    /// The probe is bounded by `probe_timeout_ms`; a probe that times out
    /// counts as a failure.
    pub async fn retry_now(&self) {
        {
            let mut inner = self.lock();
            inner.cancel_cooldown();
            inner.state = BreakerState::HalfOpen;
        }
        self.probe_half_open().await;
    }

    /// Cooldown expiry. Does nothing unless the breaker is still open on the
    /// cooldown that scheduled it.
    async fn cooldown_elapsed(&self, generation: u64) {
        {
            let mut inner = self.lock();
            if inner.state != BreakerState::Open || inner.cooldown_generation != generation {
                debug!(dependency = %self.dependency_id, "stale cooldown; not probing");
                return;
            }
            inner.cancel_cooldown();
            inner.state = BreakerState::HalfOpen;
        }
        self.probe_half_open().await;
    }

    async fn probe_half_open(&self) {
        info!(dependency = %self.dependency_id, "circuit half-open, probing");
        self.publish_transition(BreakerState::HalfOpen);

        let healthy =
            match tokio::time::timeout(self.config.probe_timeout(), self.probe.probe()).await {
                Ok(healthy) => healthy,
                Err(_) => {
                    warn!(
                        dependency = %self.dependency_id,
                        timeout_ms = self.config.probe_timeout_ms,
                        "health probe timed out"
                    );
                    false
                }
            };

        if healthy {
            self.record_success();
        } else {
            self.record_failure();
        }
    }

    fn open(&self, inner: &mut Inner) {
        inner.cancel_cooldown();
        inner.state = BreakerState::Open;
        let delay = self.config.reset_timeout();
        inner.cooldown_deadline = Some(deadline_after(self.clock.now(), delay));
        inner.cooldown_generation += 1;
        let generation = inner.cooldown_generation;

        let this = self.this.clone();
        inner.cooldown = Some(self.clock.after(
            delay,
            Box::new(move || -> TimerFuture {
                Box::pin(async move {
                    if let Some(breaker) = this.upgrade() {
                        breaker.cooldown_elapsed(generation).await;
                    }
                })
            }),
        ));
        warn!(
            dependency = %self.dependency_id,
            failure_count = inner.failure_count,
            cooldown_ms = self.config.reset_timeout_ms,
            "circuit opened"
        );
    }

    fn publish_transition(&self, state: BreakerState) {
        let snapshot = self.snapshot();
        let event = PipelineEvent::at(
            state.event_type(),
            format!("circuit:{}", self.dependency_id),
            self.clock.now(),
            json!({
                "dependency_id": snapshot.dependency_id,
                "state": state,
                "failure_count": snapshot.failure_count,
                "cooldown_deadline": snapshot.cooldown_deadline,
            }),
        );
        if let Err(e) = self.sink.publish(event) {
            warn!(dependency = %self.dependency_id, error = %e, "failed to publish breaker event");
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
