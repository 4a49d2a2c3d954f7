use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use conductor_core::CoreError;

use crate::dlq::DlqEntry;

/// Durable home of the dead-letter queue's entries.
///
/// The queue reads and rewrites the whole entry set under its own lock, so
/// implementations only need whole-set load and save.
pub trait DlqStore: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if stored entries cannot be read or decoded.
    fn load(&self) -> Result<Vec<DlqEntry>, CoreError>;

    /// # Errors
    ///
    /// Returns an error if the entries cannot be encoded or written.
    fn save(&self, entries: &[DlqEntry]) -> Result<(), CoreError>;
}

/// Entries kept as a JSON array in a single file.
///
/// Saves go through a sibling temporary file and a rename, so a crash never
/// leaves a half-written queue behind.
#[derive(Debug, Clone)]
pub struct FileDlqStore {
    path: PathBuf,
}

impl FileDlqStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(std::ffi::OsStr::to_os_string)
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl DlqStore for FileDlqStore {
    fn load(&self) -> Result<Vec<DlqEntry>, CoreError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(CoreError::Storage {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&content).map_err(|source| CoreError::InvalidRecord {
            path: self.path.clone(),
            source,
        })
    }

    fn save(&self, entries: &[DlqEntry]) -> Result<(), CoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| CoreError::Storage {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let content =
            serde_json::to_string_pretty(entries).map_err(|source| CoreError::Encode {
                stream: self.path.display().to_string(),
                source,
            })?;

        let temp = self.temp_path();
        fs::write(&temp, content).map_err(|source| CoreError::Storage {
            path: temp.clone(),
            source,
        })?;
        fs::rename(&temp, &self.path).map_err(|source| CoreError::Storage {
            path: self.path.clone(),
            source,
        })
    }
}

/// In-memory entries; clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct MemoryDlqStore {
    entries: Arc<Mutex<Vec<DlqEntry>>>,
}

impl MemoryDlqStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl DlqStore for MemoryDlqStore {
    fn load(&self) -> Result<Vec<DlqEntry>, CoreError> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn save(&self, entries: &[DlqEntry]) -> Result<(), CoreError> {
        *self.entries.lock().unwrap_or_else(PoisonError::into_inner) = entries.to_vec();
        Ok(())
    }
}
