use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use conductor_core::{CoreError, validate_id};

use crate::log::SagaLog;

/// Durable storage for [`SagaLog`]s, one record per `(saga_name, request_id)`.
pub trait SagaLogStore: Send + Sync {
    /// Store `log`, replacing any previous log for the same pair.
    ///
    /// # Errors
    ///
    /// Returns an error if the ids are invalid or the write fails.
    fn save(&self, log: &SagaLog) -> Result<(), CoreError>;

    /// Load the log for a pair, or `None` if no run has been recorded.
    ///
    /// # Errors
    ///
    /// Returns an error if the ids are invalid or the stored record is unreadable.
    fn load(&self, saga_name: &str, request_id: &str) -> Result<Option<SagaLog>, CoreError>;
}

/// Stores each log as `<dir>/<saga_name>/<request_id>.json`.
///
/// Writes go to a temporary file that is renamed over the target, so readers
/// never observe a partially written log.
#[derive(Debug, Clone)]
pub struct FileSagaLogStore {
    dir: PathBuf,
}

impl FileSagaLogStore {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn log_path(&self, saga_name: &str, request_id: &str) -> Result<PathBuf, CoreError> {
        validate_id("saga name", saga_name)?;
        validate_id("request id", request_id)?;
        Ok(self.dir.join(saga_name).join(format!("{request_id}.json")))
    }
}

impl SagaLogStore for FileSagaLogStore {
    fn save(&self, log: &SagaLog) -> Result<(), CoreError> {
        let path = self.log_path(&log.saga_name, &log.request_id)?;
        let parent = path.parent().unwrap_or(&self.dir).to_path_buf();
        fs::create_dir_all(&parent).map_err(|source| CoreError::Storage {
            path: parent,
            source,
        })?;

        let content =
            serde_json::to_string_pretty(log).map_err(|source| CoreError::Encode {
                stream: format!("{}/{}", log.saga_name, log.request_id),
                source,
            })?;

        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, content).map_err(|source| CoreError::Storage {
            path: tmp_path.clone(),
            source,
        })?;
        fs::rename(&tmp_path, &path).map_err(|source| CoreError::Storage { path, source })
    }

    fn load(&self, saga_name: &str, request_id: &str) -> Result<Option<SagaLog>, CoreError> {
        let path = self.log_path(saga_name, request_id)?;
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(CoreError::Storage { path, source }),
        };

        serde_json::from_str(&content)
            .map(Some)
            .map_err(|source| CoreError::InvalidRecord { path, source })
    }
}

/// In-memory store; clones share the same logs.
#[derive(Debug, Clone, Default)]
pub struct MemorySagaLogStore {
    logs: Arc<Mutex<HashMap<(String, String), SagaLog>>>,
}

impl MemorySagaLogStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SagaLogStore for MemorySagaLogStore {
    fn save(&self, log: &SagaLog) -> Result<(), CoreError> {
        validate_id("saga name", &log.saga_name)?;
        validate_id("request id", &log.request_id)?;
        self.logs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                (log.saga_name.clone(), log.request_id.clone()),
                log.clone(),
            );
        Ok(())
    }

    fn load(&self, saga_name: &str, request_id: &str) -> Result<Option<SagaLog>, CoreError> {
        validate_id("saga name", saga_name)?;
        validate_id("request id", request_id)?;
        Ok(self
            .logs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(saga_name.to_string(), request_id.to_string()))
            .cloned())
    }
}
