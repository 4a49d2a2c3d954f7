//! Integration tests for director cycles.

mod common;

use std::sync::Arc;

use common::{MockIntegrator, MockManifest};
use conductor_core::{ManualClock, NullSink, event_types};
use conductor_director::{
    CycleOutcome, DIRECTOR_STREAM, Director, DirectorError, FailedItem, Trigger,
};
use conductor_events::EventLog;

fn director(
    manifest: &Arc<MockManifest>,
    integrator: &Arc<MockIntegrator>,
    log: &Arc<EventLog>,
) -> Director {
    Director::new(
        manifest.clone(),
        integrator.clone(),
        log.clone(),
        Arc::new(ManualClock::new()),
    )
}

#[tokio::test]
async fn cycle_integrates_every_ready_item_and_moves_main_head() -> anyhow::Result<()> {
    let manifest = MockManifest::with_ready(&[("feat-a", "a1"), ("feat-b", "b1")]);
    let integrator = MockIntegrator::new();
    let log = Arc::new(EventLog::in_memory());
    let director = director(&manifest, &integrator, &log);

    let outcome = director.run_cycle(Trigger::Manual).await?;

    let report = outcome.report().expect("manual cycle runs");
    assert_eq!(report.trigger, Trigger::Manual);
    assert_eq!(report.integrated.len(), 2);
    assert!(report.failed.is_empty());
    assert_eq!(manifest.main_head().as_deref(), Some("merged-b1"));
    assert!(!director.is_running());

    let events = log.get_events(DIRECTOR_STREAM)?;
    let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(
        types,
        vec![
            event_types::DIRECTOR_ACTIVATED,
            event_types::DIRECTOR_INTEGRATED,
            event_types::DIRECTOR_INTEGRATED,
            event_types::DIRECTOR_CYCLE_COMPLETED,
        ]
    );
    assert_eq!(events[0].data["trigger"], "manual");
    Ok(())
}

#[tokio::test]
async fn one_failed_item_does_not_stop_the_rest() -> anyhow::Result<()> {
    let manifest =
        MockManifest::with_ready(&[("feat-a", "a1"), ("feat-b", "b1"), ("feat-c", "c1")]);
    let integrator = MockIntegrator::failing(&["feat-b"]);
    let log = Arc::new(EventLog::in_memory());
    let director = director(&manifest, &integrator, &log);

    let outcome = director.run_cycle(Trigger::Scheduled).await?;

    let report = outcome.report().expect("idle director runs scheduled cycle");
    assert_eq!(integrator.calls(), vec!["feat-a", "feat-b", "feat-c"]);
    let merged: Vec<&str> = report.integrated.iter().map(|i| i.branch.as_str()).collect();
    assert_eq!(merged, vec!["feat-a", "feat-c"]);
    assert_eq!(
        report.failed,
        vec![FailedItem {
            branch: "feat-b".to_string(),
            error: "conflict on feat-b".to_string(),
        }]
    );
    assert_eq!(manifest.main_head().as_deref(), Some("merged-c1"));

    let failures: Vec<_> = log
        .get_events(DIRECTOR_STREAM)?
        .into_iter()
        .filter(|e| e.event_type == event_types::DIRECTOR_INTEGRATION_FAILED)
        .collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].data["branch"], "feat-b");
    Ok(())
}

#[tokio::test]
async fn manifest_read_failure_fails_the_cycle_and_releases_the_guard() -> anyhow::Result<()> {
    let manifest = MockManifest::with_ready(&[("feat-a", "a1")]);
    manifest.fail_reads(true);
    let integrator = MockIntegrator::new();
    let log = Arc::new(EventLog::in_memory());
    let director = director(&manifest, &integrator, &log);

    let err = director
        .run_cycle(Trigger::Manual)
        .await
        .expect_err("read fails");
    assert!(matches!(err, DirectorError::ManifestRead(_)));
    assert!(!director.is_running());
    assert!(integrator.calls().is_empty());
    let last = log.get_events(DIRECTOR_STREAM)?.pop().expect("events published");
    assert_eq!(last.event_type, event_types::DIRECTOR_CYCLE_FAILED);

    manifest.fail_reads(false);
    let outcome = director.run_cycle(Trigger::Scheduled).await?;
    assert!(matches!(outcome, CycleOutcome::Completed(_)));
    Ok(())
}

#[tokio::test]
async fn empty_manifest_completes_without_integrating() -> anyhow::Result<()> {
    let manifest = MockManifest::with_ready(&[]);
    let integrator = MockIntegrator::new();
    let director = Director::new(
        manifest.clone(),
        integrator.clone(),
        Arc::new(NullSink),
        Arc::new(ManualClock::new()),
    );

    let outcome = director.run_cycle(Trigger::Manual).await?;

    let report = outcome.report().expect("completed");
    assert!(report.integrated.is_empty() && report.failed.is_empty());
    assert!(manifest.main_head().is_none());
    Ok(())
}
