use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{BoxError, ManifestError};

/// A branch that passed review and waits to be merged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyItem {
    pub branch: String,
    /// Head commit the review approved.
    pub sha: String,
    /// Pipeline request that produced the approval, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl ReadyItem {
    #[must_use]
    pub fn new(branch: impl Into<String>, sha: impl Into<String>) -> Self {
        Self {
            branch: branch.into(),
            sha: sha.into(),
            request_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeRecord {
    pub branch: String,
    pub merged_sha: String,
    pub merged_at: DateTime<Utc>,
}

/// Ledger of integration work. Owned by whoever implements
/// [`ManifestManager`]; the director only reads it and moves `main_head`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub ready: Vec<ReadyItem>,
    #[serde(default)]
    pub pending_merge: Vec<ReadyItem>,
    #[serde(default)]
    pub merge_history: Vec<MergeRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_head: Option<String>,
}

/// Reads the manifest and records new main heads.
#[async_trait]
pub trait ManifestManager: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if the manifest cannot be read.
    async fn read(&self) -> Result<Manifest, BoxError>;

    /// # Errors
    ///
    /// Returns an error if the new head cannot be recorded.
    async fn update_main_head(&self, sha: &str) -> Result<(), BoxError>;
}

/// Manifest stored as a JSON document.
///
/// A missing file reads as an empty manifest. Writes replace the file through
/// a temporary sibling and a rename.
#[derive(Debug, Clone)]
pub struct FileManifestManager {
    path: PathBuf,
}

impl FileManifestManager {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(&self) -> Result<Manifest, ManifestError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Manifest::default()),
            Err(source) => {
                return Err(ManifestError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        serde_json::from_str(&content).map_err(|source| ManifestError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    /// # Errors
    ///
    /// Returns an error if the manifest cannot be serialized or written.
    pub fn save(&self, manifest: &Manifest) -> Result<(), ManifestError> {
        let content =
            serde_json::to_string_pretty(manifest).map_err(|source| ManifestError::Serialize {
                path: self.path.clone(),
                source,
            })?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| ManifestError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let temp = self.path.with_extension("json.tmp");
        fs::write(&temp, content).map_err(|source| ManifestError::Io {
            path: temp.clone(),
            source,
        })?;
        fs::rename(&temp, &self.path).map_err(|source| ManifestError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

#[async_trait]
impl ManifestManager for FileManifestManager {
    async fn read(&self) -> Result<Manifest, BoxError> {
        Ok(self.load()?)
    }

    async fn update_main_head(&self, sha: &str) -> Result<(), BoxError> {
        let mut manifest = self.load()?;
        manifest.main_head = Some(sha.to_string());
        self.save(&manifest)?;
        Ok(())
    }
}
