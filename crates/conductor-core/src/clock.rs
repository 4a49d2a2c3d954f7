use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Future produced by a timer callback.
pub type TimerFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// One-shot timer callback.
pub type TimerTask = Box<dyn FnOnce() -> TimerFuture + Send + 'static>;

/// Repeating timer callback, invoked once per tick.
pub type RepeatingTask = Arc<dyn Fn() -> TimerFuture + Send + Sync + 'static>;

/// Shortest period a repeating timer may use.
pub const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Handle to an armed timer.
///
/// Cancelling prevents any future firing; a callback that already started
/// runs to completion. Dropping the handle does not cancel the timer.
#[derive(Debug, Clone, Default)]
pub struct TimerHandle {
    token: CancellationToken,
}

impl TimerHandle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

/// Time source and timer scheduler.
///
/// Everything in the engine that waits (breaker cooldowns, DLQ backoff,
/// scheduled director cycles) goes through this port so tests can drive time
/// by hand.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Run `task` once after `delay`.
    fn after(&self, delay: Duration, task: TimerTask) -> TimerHandle;

    /// Run `task` every `period`, first tick one period from now.
    fn every(&self, period: Duration, task: RepeatingTask) -> TimerHandle;
}

/// `now + delay`, saturating at the largest representable instant.
#[must_use]
pub fn deadline_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Wall-clock implementation backed by the Tokio timer.
///
/// Timers spawn onto the current Tokio runtime, so arming one outside a
/// runtime panics. Each tick of a repeating timer runs on its own task, so a
/// slow callback does not delay the next tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn after(&self, delay: Duration, task: TimerTask) -> TimerHandle {
        let handle = TimerHandle::new();
        let token = handle.token();
        tokio::spawn(async move {
            let fired = tokio::select! {
                biased;
                () = token.cancelled() => false,
                () = tokio::time::sleep(delay) => true,
            };
            if fired {
                task().await;
            }
        });
        handle
    }

    fn every(&self, period: Duration, task: RepeatingTask) -> TimerHandle {
        let period = period.max(MIN_PERIOD);
        let handle = TimerHandle::new();
        let token = handle.token();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        tokio::spawn(task());
                    }
                }
            }
        });
        handle
    }
}

#[cfg(any(test, feature = "testing"))]
pub use manual::ManualClock;

#[cfg(any(test, feature = "testing"))]
mod manual {
    use std::sync::{Mutex, PoisonError};

    use super::*;

    enum Job {
        Once(TimerTask),
        Every { period: Duration, task: RepeatingTask },
    }

    struct Pending {
        seq: u64,
        deadline: DateTime<Utc>,
        handle: TimerHandle,
        job: Job,
    }

    struct ManualState {
        now: DateTime<Utc>,
        next_seq: u64,
        timers: Vec<Pending>,
    }

    impl ManualState {
        fn push(&mut self, deadline: DateTime<Utc>, handle: TimerHandle, job: Job) {
            self.next_seq += 1;
            self.timers.push(Pending {
                seq: self.next_seq,
                deadline,
                handle,
                job,
            });
        }
    }

    /// Deterministic clock for tests.
    ///
    /// Time only moves when [`ManualClock::advance`] is awaited. Due timers
    /// fire in deadline order and each callback is awaited to completion
    /// before the next one fires.
    pub struct ManualClock {
        state: Mutex<ManualState>,
    }

    impl std::fmt::Debug for ManualClock {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("ManualClock")
                .field("now", &self.now())
                .field("pending_timers", &self.pending_timers())
                .finish()
        }
    }

    impl Default for ManualClock {
        fn default() -> Self {
            Self::new()
        }
    }

    impl ManualClock {
        /// A clock starting at the Unix epoch.
        #[must_use]
        pub fn new() -> Self {
            Self::starting_at(DateTime::<Utc>::default())
        }

        #[must_use]
        pub fn starting_at(now: DateTime<Utc>) -> Self {
            Self {
                state: Mutex::new(ManualState {
                    now,
                    next_seq: 0,
                    timers: Vec::new(),
                }),
            }
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, ManualState> {
            self.state.lock().unwrap_or_else(PoisonError::into_inner)
        }

        /// Number of armed, non-cancelled timers.
        #[must_use]
        pub fn pending_timers(&self) -> usize {
            self.lock()
                .timers
                .iter()
                .filter(|t| !t.handle.is_cancelled())
                .count()
        }

        /// Move time forward by `by`, firing every timer that falls due.
        pub async fn advance(&self, by: Duration) {
            let target = deadline_after(self.now(), by);
            loop {
                let job = {
                    let mut state = self.lock();
                    state.timers.retain(|t| !t.handle.is_cancelled());
                    let next = state
                        .timers
                        .iter()
                        .enumerate()
                        .filter(|(_, t)| t.deadline <= target)
                        .min_by_key(|(_, t)| (t.deadline, t.seq))
                        .map(|(index, _)| index);
                    let Some(index) = next else {
                        state.now = target;
                        break;
                    };

                    let pending = state.timers.swap_remove(index);
                    if pending.deadline > state.now {
                        state.now = pending.deadline;
                    }
                    match pending.job {
                        Job::Once(task) => Job::Once(task),
                        Job::Every { period, task } => {
                            let next_deadline = deadline_after(pending.deadline, period);
                            state.push(
                                next_deadline,
                                pending.handle,
                                Job::Every {
                                    period,
                                    task: Arc::clone(&task),
                                },
                            );
                            Job::Every { period, task }
                        }
                    }
                };

                match job {
                    Job::Once(task) => task().await,
                    Job::Every { task, .. } => task().await,
                }
            }
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            self.lock().now
        }

        fn after(&self, delay: Duration, task: TimerTask) -> TimerHandle {
            let handle = TimerHandle::new();
            let mut state = self.lock();
            let deadline = deadline_after(state.now, delay);
            state.push(deadline, handle.clone(), Job::Once(task));
            handle
        }

        fn every(&self, period: Duration, task: RepeatingTask) -> TimerHandle {
            let period = period.max(MIN_PERIOD);
            let handle = TimerHandle::new();
            let mut state = self.lock();
            let deadline = deadline_after(state.now, period);
            state.push(deadline, handle.clone(), Job::Every { period, task });
            handle
        }
    }
}
