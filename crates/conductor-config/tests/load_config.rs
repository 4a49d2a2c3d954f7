//! Loading `conductor.toml` from disk and building engines from it.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use conductor_config::{ConfigError, load_config};
use conductor_core::{NullSink, TokioClock};
use conductor_resilience::{BreakerState, CircuitBreakerRegistry, DeadLetterQueue, HealthProbe};

const FULL_CONFIG: &str = r#"
[saga]
log_dir = "state/sagas"

[events]
dir = "state/events"

[director]
interval_ms = 15000

[resilience.circuit_breakers.claude]
failure_threshold = 2
reset_timeout_ms = 10000

[resilience.circuit_breakers.github]

[resilience.dlq]
enabled = true
max_retries = 5
base_delay_ms = 500
backoff_factor = 3.0
path = "state/dlq.json"

[webhook]
url = "https://hooks.example/pipeline"
events = ["pipeline.failed", "dlq.exhausted"]
timeout_ms = 2000
"#;

struct AlwaysHealthy;

#[async_trait]
impl HealthProbe for AlwaysHealthy {
    async fn probe(&self) -> bool {
        true
    }
}

fn write_config(dir: &Path, content: &str) -> anyhow::Result<std::path::PathBuf> {
    let path = dir.join("conductor.toml");
    fs::write(&path, content)?;
    Ok(path)
}

#[test]
fn loads_every_section() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = write_config(dir.path(), FULL_CONFIG)?;

    let config = load_config(&path)?;

    assert_eq!(config.saga_log_dir(), dir.path().join("state/sagas"));
    assert_eq!(config.events_dir(), dir.path().join("state/events"));
    assert_eq!(config.director_interval_ms(), 15_000);
    assert_eq!(
        config.circuit_breakers().keys().collect::<Vec<_>>(),
        vec!["claude", "github"]
    );
    assert_eq!(config.circuit_breakers()["claude"].reset_timeout_ms, 10_000);
    assert_eq!(config.circuit_breakers()["github"].failure_threshold, 3);

    let dlq = config.dlq();
    assert!(dlq.enabled);
    assert_eq!(dlq.max_retries, 5);
    assert_eq!(dlq.path, Some(dir.path().join("state/dlq.json")));

    let webhook = config.webhook().expect("webhook configured");
    assert_eq!(webhook.url, "https://hooks.example/pipeline");
    assert_eq!(webhook.events, vec!["pipeline.failed", "dlq.exhausted"]);
    assert_eq!(webhook.timeout_ms, 2_000);
    Ok(())
}

#[test]
fn missing_file_is_a_read_error() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;

    let err = load_config(&dir.path().join("conductor.toml")).expect_err("no file");

    assert!(matches!(err, ConfigError::Read { .. }));
    Ok(())
}

#[test]
fn malformed_toml_reports_the_path() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = write_config(dir.path(), "[saga\nlog_dir = 1")?;

    let err = load_config(&path).expect_err("malformed");

    match err {
        ConfigError::Parse { path: reported, .. } => assert_eq!(reported, path),
        other => panic!("expected parse error, got {other:?}"),
    }
    Ok(())
}

#[test]
fn engines_build_from_loaded_config() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = write_config(dir.path(), FULL_CONFIG)?;
    let config = load_config(&path)?;
    let clock = Arc::new(TokioClock);

    let registry = CircuitBreakerRegistry::from_config(
        config.circuit_breakers(),
        |_| Arc::new(AlwaysHealthy),
        clock.clone(),
        Arc::new(NullSink),
    )?;
    let dlq = DeadLetterQueue::from_config(config.dlq().clone(), clock);

    assert_eq!(
        registry.get("claude").expect("registered").state(),
        BreakerState::Closed
    );
    assert!(dlq.is_enabled());
    let entry = dlq
        .enqueue("review:req-1", serde_json::json!({}))?
        .expect("enabled queue keeps entries");
    assert_eq!(entry.max_retries, 5);
    assert!(dir.path().join("state/dlq.json").exists());
    Ok(())
}
