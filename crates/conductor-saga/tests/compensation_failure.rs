//! Integration tests for compensation failure scenarios.

use async_trait::async_trait;
use conductor_saga::{SagaBuilder, SagaError, Step, StepAction};

#[derive(Default)]
struct TestContext {
    compensation_log: Vec<String>,
}

#[derive(Debug, PartialEq, thiserror::Error)]
#[error("{0}")]
struct TestError(String);

struct Succeed;

#[async_trait]
impl StepAction<TestContext, TestError> for Succeed {
    async fn run(&self, _ctx: &mut TestContext) -> Result<(), TestError> {
        Ok(())
    }
}

struct Compensate {
    name: &'static str,
}

#[async_trait]
impl StepAction<TestContext, TestError> for Compensate {
    async fn run(&self, ctx: &mut TestContext) -> Result<(), TestError> {
        ctx.compensation_log.push(format!("compensated {}", self.name));
        Ok(())
    }
}

struct FailingCompensation {
    name: &'static str,
}

#[async_trait]
impl StepAction<TestContext, TestError> for FailingCompensation {
    async fn run(&self, ctx: &mut TestContext) -> Result<(), TestError> {
        ctx.compensation_log
            .push(format!("failed to compensate {}", self.name));
        Err(TestError(format!("compensation {} failed", self.name)))
    }
}

struct Trigger;

#[async_trait]
impl StepAction<TestContext, TestError> for Trigger {
    async fn run(&self, _ctx: &mut TestContext) -> Result<(), TestError> {
        Err(TestError("triggered failure".to_string()))
    }
}

#[tokio::test]
async fn compensation_failure_still_runs_other_compensations() {
    let saga = SagaBuilder::new("rollback")
        .add_step(Step::new("step_a", Succeed).compensate_with(Compensate { name: "step_a" }))
        .add_step(
            Step::new("step_b", Succeed).compensate_with(FailingCompensation { name: "step_b" }),
        )
        .add_step(Step::new("step_c", Succeed).compensate_with(Compensate { name: "step_c" }))
        .add_step(Step::new("trigger", Trigger))
        .build();
    let mut ctx = TestContext::default();

    let (result, log) = saga.execute_with_log("req-1", &mut ctx).await;

    assert!(result.is_err());
    assert_eq!(
        ctx.compensation_log,
        vec![
            "compensated step_c",
            "failed to compensate step_b",
            "compensated step_a",
        ]
    );
    assert_eq!(
        log.compensations_run,
        vec!["step_c", "step_b (FAILED)", "step_a"]
    );
    assert_eq!(log.failed_compensations().collect::<Vec<_>>(), vec!["step_b"]);
}

#[tokio::test]
async fn original_error_is_returned_not_compensation_error() {
    let saga = SagaBuilder::new("rollback")
        .add_step(
            Step::new("step_a", Succeed).compensate_with(FailingCompensation { name: "step_a" }),
        )
        .add_step(Step::new("trigger", Trigger))
        .build();
    let mut ctx = TestContext::default();

    let err = saga
        .execute("req-1", &mut ctx)
        .await
        .expect_err("saga should fail");

    match err {
        SagaError::StepFailed { step, source } => {
            assert_eq!(step, "trigger");
            assert_eq!(source, TestError("triggered failure".to_string()));
        }
        other => panic!("expected StepFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn every_compensation_failing_is_still_recorded() -> anyhow::Result<()> {
    let saga = SagaBuilder::new("rollback")
        .add_step(
            Step::new("step_a", Succeed).compensate_with(FailingCompensation { name: "step_a" }),
        )
        .add_step(
            Step::new("step_b", Succeed).compensate_with(FailingCompensation { name: "step_b" }),
        )
        .add_step(Step::new("trigger", Trigger))
        .build();
    let mut ctx = TestContext::default();

    let result = saga.execute("req-1", &mut ctx).await;

    assert!(result.is_err());
    let log = saga.load_log("req-1")?.expect("log persisted");
    assert_eq!(
        log.compensations_run,
        vec!["step_b (FAILED)", "step_a (FAILED)"]
    );
    assert_eq!(log.failed_at_step.as_deref(), Some("trigger"));
    Ok(())
}
