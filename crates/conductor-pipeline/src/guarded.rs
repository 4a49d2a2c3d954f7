use std::sync::Arc;

use async_trait::async_trait;
use conductor_resilience::{CircuitBreaker, CircuitOpenError};
use conductor_saga::StepAction;

/// Step action that calls an external dependency through its breaker.
///
/// While the breaker is open the action is not run and the step fails with
/// the step error built from [`CircuitOpenError`]. Otherwise the action's
/// outcome is recorded on the breaker.
pub struct Guarded<A> {
    breaker: Arc<CircuitBreaker>,
    action: A,
}

impl<A> Guarded<A> {
    #[must_use]
    pub fn new(breaker: Arc<CircuitBreaker>, action: A) -> Self {
        Self { breaker, action }
    }

    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }
}

#[async_trait]
impl<Ctx, E, A> StepAction<Ctx, E> for Guarded<A>
where
    Ctx: Send,
    E: Send + From<CircuitOpenError>,
    A: StepAction<Ctx, E>,
{
    async fn run(&self, ctx: &mut Ctx) -> Result<(), E> {
        self.breaker.check()?;
        match self.action.run(ctx).await {
            Ok(()) => {
                self.breaker.record_success();
                Ok(())
            }
            Err(e) => {
                self.breaker.record_failure();
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use conductor_core::ManualClock;
    use conductor_resilience::{BreakerState, CircuitBreakerConfig, HealthProbe};
    use conductor_saga::FnAction;

    use super::*;

    #[derive(Debug, PartialEq)]
    enum TestError {
        Open(String),
        Down,
    }

    impl From<CircuitOpenError> for TestError {
        fn from(e: CircuitOpenError) -> Self {
            Self::Open(e.dependency)
        }
    }

    struct NeverHealthy;

    #[async_trait]
    impl HealthProbe for NeverHealthy {
        async fn probe(&self) -> bool {
            false
        }
    }

    fn breaker(threshold: u32) -> Arc<CircuitBreaker> {
        CircuitBreaker::new(
            "github",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                ..CircuitBreakerConfig::default()
            },
            Arc::new(ManualClock::new()),
            Arc::new(NeverHealthy),
        )
    }

    #[tokio::test]
    async fn failures_trip_the_breaker_then_short_circuit() {
        let breaker = breaker(2);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let guarded = Guarded::new(
            Arc::clone(&breaker),
            FnAction::new(move |_: &mut ()| {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(TestError::Down)
            }),
        );

        assert_eq!(guarded.run(&mut ()).await, Err(TestError::Down));
        assert_eq!(guarded.run(&mut ()).await, Err(TestError::Down));
        assert_eq!(breaker.state(), BreakerState::Open);

        let refused = guarded.run(&mut ()).await;

        assert_eq!(refused, Err(TestError::Open("github".to_string())));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn success_resets_the_failure_count() {
        let breaker = breaker(3);
        breaker.record_failure();
        let guarded = Guarded::new(
            Arc::clone(&breaker),
            FnAction::new(|_: &mut ()| Ok::<(), TestError>(())),
        );

        assert_eq!(guarded.run(&mut ()).await, Ok(()));
        assert_eq!(breaker.snapshot().failure_count, 0);
    }
}
