use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid {kind} '{id}': {reason}")]
    InvalidId {
        kind: &'static str,
        id: String,
        reason: &'static str,
    },

    #[error("storage error at '{path}'")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode record for stream '{stream}'")]
    Encode {
        stream: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to decode record at '{path}'")]
    InvalidRecord {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to decode line {line} of stream '{stream}'")]
    Decode {
        stream: String,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}
