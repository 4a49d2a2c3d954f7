use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use conductor_core::validate_id;
use conductor_events::WebhookConfig;
use conductor_resilience::{CircuitBreakerConfig, DlqConfig};
use serde::Deserialize;
use tracing::debug;

use crate::error::{ConfigError, Result};

pub const DEFAULT_CONFIG_FILE: &str = "conductor.toml";
pub const DEFAULT_DIRECTOR_INTERVAL_MS: i64 = 60_000;
/// Environment variable that overrides `[webhook] secret`.
pub const WEBHOOK_SECRET_ENV: &str = "CONDUCTOR_WEBHOOK_SECRET";

const DEFAULT_SAGA_LOG_DIR: &str = ".conductor/sagas";
const DEFAULT_EVENTS_DIR: &str = ".conductor/events";
const DEFAULT_DLQ_PATH: &str = ".conductor/dlq.json";

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    saga: Option<RawSaga>,
    events: Option<RawEvents>,
    director: Option<RawDirector>,
    resilience: Option<RawResilience>,
    webhook: Option<WebhookConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSaga {
    log_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawEvents {
    dir: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDirector {
    interval_ms: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawResilience {
    #[serde(default)]
    circuit_breakers: BTreeMap<String, CircuitBreakerConfig>,
    dlq: Option<DlqConfig>,
}

/// Validated conductor configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ConductorConfig {
    saga_log_dir: PathBuf,
    events_dir: PathBuf,
    director_interval_ms: i64,
    circuit_breakers: BTreeMap<String, CircuitBreakerConfig>,
    dlq: DlqConfig,
    webhook: Option<WebhookConfig>,
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            saga_log_dir: PathBuf::from(DEFAULT_SAGA_LOG_DIR),
            events_dir: PathBuf::from(DEFAULT_EVENTS_DIR),
            director_interval_ms: DEFAULT_DIRECTOR_INTERVAL_MS,
            circuit_breakers: BTreeMap::new(),
            dlq: DlqConfig {
                path: Some(PathBuf::from(DEFAULT_DLQ_PATH)),
                ..DlqConfig::default()
            },
            webhook: None,
        }
    }
}

impl ConductorConfig {
    /// Directory the saga execution logs are written to.
    #[must_use]
    pub fn saga_log_dir(&self) -> &Path {
        &self.saga_log_dir
    }

    /// Directory holding one event file per stream.
    #[must_use]
    pub fn events_dir(&self) -> &Path {
        &self.events_dir
    }

    /// Director schedule period. Non-positive values disable the schedule.
    #[must_use]
    pub fn director_interval_ms(&self) -> i64 {
        self.director_interval_ms
    }

    #[must_use]
    pub fn circuit_breakers(&self) -> &BTreeMap<String, CircuitBreakerConfig> {
        &self.circuit_breakers
    }

    #[must_use]
    pub fn dlq(&self) -> &DlqConfig {
        &self.dlq
    }

    #[must_use]
    pub fn webhook(&self) -> Option<&WebhookConfig> {
        self.webhook.as_ref()
    }

    /// Replace the webhook secret with `secret`, if a webhook is configured.
    fn override_webhook_secret(&mut self, secret: Option<String>) {
        let Some(secret) = secret.filter(|s| !s.is_empty()) else {
            return;
        };
        match &mut self.webhook {
            Some(webhook) => {
                debug!("webhook secret taken from {WEBHOOK_SECRET_ENV}");
                webhook.secret = Some(secret);
            }
            None => debug!("{WEBHOOK_SECRET_ENV} set but no [webhook] configured"),
        }
    }
}

/// Load and validate the config file at `path`.
///
/// Relative paths in the file resolve against the file's directory, and
/// `CONDUCTOR_WEBHOOK_SECRET` overrides the webhook secret when set.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed, or if any section
/// holds invalid values.
pub fn load_config(path: &Path) -> Result<ConductorConfig> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let raw: RawConfig = toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source: Box::new(source),
    })?;

    let base_dir = path.parent().unwrap_or_else(|| Path::new(""));
    let mut config = build_config(raw, base_dir)?;
    config.override_webhook_secret(std::env::var(WEBHOOK_SECRET_ENV).ok());
    debug!(path = %path.display(), "loaded conductor config");
    Ok(config)
}

/// Parse and validate config from a string, resolving relative paths
/// against `base_dir`. The environment is not consulted.
///
/// # Errors
///
/// Returns an error if `content` is not valid TOML or any section holds
/// invalid values.
pub fn parse_config(content: &str, base_dir: &Path) -> Result<ConductorConfig> {
    let raw: RawConfig = toml::from_str(content).map_err(|source| ConfigError::Parse {
        path: base_dir.join(DEFAULT_CONFIG_FILE),
        source: Box::new(source),
    })?;
    build_config(raw, base_dir)
}

fn build_config(raw: RawConfig, base_dir: &Path) -> Result<ConductorConfig> {
    let defaults = ConductorConfig::default();
    let resilience = raw.resilience.unwrap_or_default();

    let saga_log_dir = raw
        .saga
        .and_then(|s| s.log_dir)
        .unwrap_or(defaults.saga_log_dir);
    let events_dir = raw
        .events
        .and_then(|e| e.dir)
        .unwrap_or(defaults.events_dir);
    let director_interval_ms = raw
        .director
        .and_then(|d| d.interval_ms)
        .unwrap_or(defaults.director_interval_ms);

    let circuit_breakers = build_circuit_breakers(resilience.circuit_breakers)?;
    let dlq = build_dlq(resilience.dlq, defaults.dlq, base_dir)?;
    let webhook = raw.webhook.map(build_webhook).transpose()?;

    Ok(ConductorConfig {
        saga_log_dir: resolve(base_dir, saga_log_dir),
        events_dir: resolve(base_dir, events_dir),
        director_interval_ms,
        circuit_breakers,
        dlq,
        webhook,
    })
}

fn build_circuit_breakers(
    configs: BTreeMap<String, CircuitBreakerConfig>,
) -> Result<BTreeMap<String, CircuitBreakerConfig>> {
    for (dependency_id, config) in &configs {
        let section = format!("resilience.circuit_breakers.{dependency_id}");
        validate_id("dependency", dependency_id)
            .map_err(|e| ConfigError::invalid(&section, e.to_string()))?;
        config
            .validate()
            .map_err(|reason| ConfigError::invalid(&section, reason))?;
    }
    Ok(configs)
}

fn build_dlq(raw: Option<DlqConfig>, defaults: DlqConfig, base_dir: &Path) -> Result<DlqConfig> {
    let mut dlq = raw.unwrap_or(defaults);
    dlq.validate()
        .map_err(|reason| ConfigError::invalid("resilience.dlq", reason))?;
    dlq.path = Some(resolve(
        base_dir,
        dlq.path.unwrap_or_else(|| PathBuf::from(DEFAULT_DLQ_PATH)),
    ));
    Ok(dlq)
}

fn build_webhook(webhook: WebhookConfig) -> Result<WebhookConfig> {
    if webhook.url.trim().is_empty() {
        return Err(ConfigError::invalid("webhook", "url must not be empty"));
    }
    if webhook.timeout_ms == 0 {
        return Err(ConfigError::invalid(
            "webhook",
            "timeout_ms must be greater than 0",
        ));
    }
    Ok(webhook)
}

fn resolve(base_dir: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        base_dir.join(path)
    }
}
