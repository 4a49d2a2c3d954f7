use std::fmt::Debug;
use std::sync::Arc;

use conductor_core::{Clock, CoreError, validate_id};
use tracing::{debug, info, warn};

use crate::error::SagaError;
use crate::log::SagaLog;
use crate::step::Step;
use crate::store::SagaLogStore;

/// A compiled saga ready for execution.
///
/// Steps run in declared order against a shared, mutable context. If a step
/// fails, the steps that already completed are compensated in reverse order
/// (LIFO) and a [`SagaLog`] describing the run is persisted.
pub struct Saga<Ctx: Send, E: Send> {
    name: String,
    steps: Vec<Step<Ctx, E>>,
    store: Arc<dyn SagaLogStore>,
    clock: Arc<dyn Clock>,
}

impl<Ctx: Send, E: Send + Debug> Saga<Ctx, E> {
    pub(crate) fn from_parts(
        name: String,
        steps: Vec<Step<Ctx, E>>,
        store: Arc<dyn SagaLogStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            name,
            steps,
            store,
            clock,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn step_names(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(Step::name)
    }

    /// Execute the saga for `request_id`.
    ///
    /// # Errors
    ///
    /// Returns [`SagaError::StepFailed`] carrying the failing action's original
    /// error after rollback. Compensation errors are recorded in the run log
    /// and never returned. Returns [`SagaError::Log`] if the ids are invalid
    /// (no step runs) or if the log of a successful run cannot be written.
    pub async fn execute(&self, request_id: &str, ctx: &mut Ctx) -> Result<(), SagaError<E>> {
        let (result, _log) = self.execute_with_log(request_id, ctx).await;
        result
    }

    /// Execute the saga and also return the run log that was persisted.
    pub async fn execute_with_log(
        &self,
        request_id: &str,
        ctx: &mut Ctx,
    ) -> (Result<(), SagaError<E>>, SagaLog) {
        let mut log = SagaLog::new(&self.name, request_id);
        if let Err(e) = self.validate_ids(request_id) {
            return (Err(SagaError::Log(e)), log);
        }

        info!(saga = %self.name, request_id, steps = self.steps.len(), "executing saga");

        let mut completed: Vec<&Step<Ctx, E>> = Vec::with_capacity(self.steps.len());
        for step in &self.steps {
            debug!(saga = %self.name, request_id, step = step.name(), "running step");

            match step.action().run(ctx).await {
                Ok(()) => {
                    log.record_completed(step.name());
                    completed.push(step);
                }
                Err(error) => {
                    warn!(
                        saga = %self.name,
                        request_id,
                        step = step.name(),
                        ?error,
                        "step failed; rolling back"
                    );
                    log.record_failed(step.name());
                    self.compensate(request_id, ctx, completed, &mut log).await;

                    if let Err(e) = self.store.save(&log) {
                        warn!(saga = %self.name, request_id, error = %e, "failed to persist saga log");
                    }
                    let saga_error = SagaError::StepFailed {
                        step: step.name().to_string(),
                        source: error,
                    };
                    return (Err(saga_error), log);
                }
            }
        }

        log.completed_at = Some(self.clock.now());
        if let Err(e) = self.store.save(&log) {
            return (Err(SagaError::Log(e)), log);
        }
        info!(saga = %self.name, request_id, "saga completed");
        (Ok(()), log)
    }

    /// Load the persisted log of the most recent run for `request_id`.
    ///
    /// Returns `Ok(None)` if no run for this request has ever finished.
    ///
    /// # Errors
    ///
    /// Returns an error if the request id is invalid or the stored log
    /// cannot be read.
    pub fn load_log(&self, request_id: &str) -> Result<Option<SagaLog>, CoreError> {
        self.store.load(&self.name, request_id)
    }

    fn validate_ids(&self, request_id: &str) -> Result<(), CoreError> {
        validate_id("saga name", &self.name)?;
        validate_id("request id", request_id)
    }

    async fn compensate(
        &self,
        request_id: &str,
        ctx: &mut Ctx,
        mut completed: Vec<&Step<Ctx, E>>,
        log: &mut SagaLog,
    ) {
        while let Some(step) = completed.pop() {
            let Some(compensation) = step.compensation() else {
                debug!(saga = %self.name, request_id, step = step.name(), "no compensation; skipping");
                continue;
            };

            match compensation.run(ctx).await {
                Ok(()) => {
                    debug!(saga = %self.name, request_id, step = step.name(), "compensated step");
                    log.record_compensated(step.name());
                }
                Err(error) => {
                    warn!(
                        saga = %self.name,
                        request_id,
                        step = step.name(),
                        ?error,
                        "compensation failed; continuing rollback"
                    );
                    log.record_compensation_failed(step.name());
                }
            }
        }
    }
}

impl<Ctx: Send, E: Send> std::fmt::Debug for Saga<Ctx, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Saga")
            .field("name", &self.name)
            .field("steps", &self.steps)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::builder::SagaBuilder;
    use crate::step::StepAction;
    use crate::store::MemorySagaLogStore;

    #[derive(Default)]
    struct TestContext {
        value: i32,
        operations: Vec<String>,
    }

    #[derive(Debug, PartialEq, thiserror::Error)]
    #[error("{0}")]
    struct TestError(String);

    struct AddStep {
        value: i32,
    }

    #[async_trait]
    impl StepAction<TestContext, TestError> for AddStep {
        async fn run(&self, ctx: &mut TestContext) -> Result<(), TestError> {
            ctx.value += self.value;
            ctx.operations.push(format!("add {}", self.value));
            Ok(())
        }
    }

    struct SubtractStep {
        value: i32,
    }

    #[async_trait]
    impl StepAction<TestContext, TestError> for SubtractStep {
        async fn run(&self, ctx: &mut TestContext) -> Result<(), TestError> {
            ctx.value -= self.value;
            ctx.operations.push(format!("undo add {}", self.value));
            Ok(())
        }
    }

    fn add(name: &str, value: i32) -> Step<TestContext, TestError> {
        Step::new(name, AddStep { value }).compensate_with(SubtractStep { value })
    }

    fn failing(name: &str, message: &'static str) -> Step<TestContext, TestError> {
        Step::from_fn(name, move |_: &mut TestContext| {
            Err(TestError(message.to_string()))
        })
    }

    #[tokio::test]
    async fn steps_mutate_shared_context_in_order() -> anyhow::Result<()> {
        let saga = SagaBuilder::new("math")
            .add_step(add("add_10", 10))
            .add_step(add("add_5", 5))
            .build();
        let mut ctx = TestContext::default();

        saga.execute("req-1", &mut ctx).await?;

        assert_eq!(ctx.value, 15);
        assert_eq!(ctx.operations, vec!["add 10", "add 5"]);
        Ok(())
    }

    #[tokio::test]
    async fn rollback_restores_context_in_lifo_order() {
        let saga = SagaBuilder::new("math")
            .add_step(add("add_10", 10))
            .add_step(add("add_5", 5))
            .add_step(failing("boom", "boom"))
            .build();
        let mut ctx = TestContext::default();

        let result = saga.execute("req-1", &mut ctx).await;

        assert!(result.is_err());
        assert_eq!(ctx.value, 0);
        assert_eq!(
            ctx.operations,
            vec!["add 10", "add 5", "undo add 5", "undo add 10"]
        );
    }

    #[tokio::test]
    async fn first_step_failure_requires_no_compensation() -> anyhow::Result<()> {
        let saga = SagaBuilder::new("math")
            .add_step(failing("immediate", "immediate failure"))
            .build();
        let mut ctx = TestContext::default();

        let (result, log) = saga.execute_with_log("req-1", &mut ctx).await;

        let err = result.expect_err("should be an error");
        assert_eq!(err.failed_step(), Some("immediate"));
        assert_eq!(err.step_error(), Some(&TestError("immediate failure".into())));
        assert!(log.steps_completed.is_empty());
        assert!(log.compensations_run.is_empty());
        assert!(ctx.operations.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn invalid_request_id_runs_nothing() {
        let store = Arc::new(MemorySagaLogStore::new());
        let saga = SagaBuilder::new("math")
            .add_step(add("add_10", 10))
            .with_store(store)
            .build();
        let mut ctx = TestContext::default();

        let result = saga.execute("../escape", &mut ctx).await;

        assert!(matches!(result, Err(SagaError::Log(CoreError::InvalidId { .. }))));
        assert!(ctx.operations.is_empty());
    }

    #[tokio::test]
    async fn empty_saga_completes_and_persists_log() -> anyhow::Result<()> {
        let saga: Saga<TestContext, TestError> = SagaBuilder::new("empty").build();
        let mut ctx = TestContext::default();

        saga.execute("req-1", &mut ctx).await?;

        let log = saga.load_log("req-1")?.expect("log persisted");
        assert!(log.succeeded());
        Ok(())
    }
}
