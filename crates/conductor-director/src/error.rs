use std::path::PathBuf;

use thiserror::Error;

/// Error type returned by manifest and integrator collaborators.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum DirectorError {
    #[error("failed to read manifest")]
    ManifestRead(#[source] BoxError),
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to access manifest '{path}'")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse manifest '{path}'")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize manifest '{path}'")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, DirectorError>;
