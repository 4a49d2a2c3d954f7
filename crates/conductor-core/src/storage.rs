use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, warn};

use crate::error::CoreError;
use crate::id::validate_id;

const STREAM_EXTENSION: &str = "jsonl";
const TAIL_CHUNK: usize = 4096;

/// Append-only storage of text records grouped by stream id.
///
/// Each `append` must be atomic with respect to other appends to the same
/// stream: concurrent writers never interleave within a record.
pub trait AppendLog: Send + Sync {
    /// Append one record (without trailing newline) to `stream`.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream id is invalid or the write fails.
    fn append(&self, stream: &str, record: &str) -> Result<(), CoreError>;

    /// Read every record of `stream` in append order. Unknown streams are empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream id is invalid or the read fails.
    fn read_all(&self, stream: &str) -> Result<Vec<String>, CoreError>;
}

/// One newline-delimited file per stream under a base directory.
///
/// Several instances pointed at the same directory observe the same streams.
#[derive(Debug, Clone)]
pub struct FileAppendLog {
    dir: PathBuf,
}

impl FileAppendLog {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn stream_path(&self, stream: &str) -> Result<PathBuf, CoreError> {
        validate_id("stream id", stream)?;
        Ok(self.dir.join(format!("{stream}.{STREAM_EXTENSION}")))
    }
}

impl AppendLog for FileAppendLog {
    fn append(&self, stream: &str, record: &str) -> Result<(), CoreError> {
        let path = self.stream_path(stream)?;
        fs::create_dir_all(&self.dir).map_err(|source| CoreError::Storage {
            path: self.dir.clone(),
            source,
        })?;

        let mut line = String::with_capacity(record.len() + 1);
        line.push_str(record);
        line.push('\n');

        // O_APPEND plus a single write keeps each record contiguous.
        let mut file = OpenOptions::new()
            .read(true)
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| CoreError::Storage {
                path: path.clone(),
                source,
            })?;
        let dropped = truncate_torn_tail(&mut file).map_err(|source| CoreError::Storage {
            path: path.clone(),
            source,
        })?;
        if dropped > 0 {
            warn!(stream, bytes = dropped, "truncated partial record before append");
        }
        file.write_all(line.as_bytes())
            .map_err(|source| CoreError::Storage { path, source })?;
        debug!(stream, bytes = line.len(), "appended record");
        Ok(())
    }

    fn read_all(&self, stream: &str) -> Result<Vec<String>, CoreError> {
        let path = self.stream_path(stream)?;
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(stream, "stream has no file yet");
                return Ok(Vec::new());
            }
            Err(source) => return Err(CoreError::Storage { path, source }),
        };

        Ok(content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(str::to_string)
            .collect())
    }
}

/// Cut an unterminated final record left behind by an interrupted append,
/// returning how many bytes were dropped.
fn truncate_torn_tail(file: &mut File) -> std::io::Result<u64> {
    let len = file.metadata()?.len();
    let mut buf = [0u8; TAIL_CHUNK];
    let mut end = len;

    while end > 0 {
        let size = usize::try_from(end).map_or(TAIL_CHUNK, |end| end.min(TAIL_CHUNK));
        let start = end - size as u64;
        let chunk = &mut buf[..size];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(chunk)?;

        if end == len && chunk.last() == Some(&b'\n') {
            return Ok(0);
        }
        if let Some(newline) = chunk.iter().rposition(|&b| b == b'\n') {
            let keep = start + newline as u64 + 1;
            file.set_len(keep)?;
            return Ok(len - keep);
        }
        end = start;
    }

    if len > 0 {
        file.set_len(0)?;
    }
    Ok(len)
}

/// In-memory append log for tests and embedding.
///
/// Clones share the same underlying streams.
#[derive(Debug, Clone, Default)]
pub struct MemoryAppendLog {
    streams: Arc<Mutex<HashMap<String, Vec<String>>>>,
}

impl MemoryAppendLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl AppendLog for MemoryAppendLog {
    fn append(&self, stream: &str, record: &str) -> Result<(), CoreError> {
        validate_id("stream id", stream)?;
        let mut streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        streams
            .entry(stream.to_string())
            .or_default()
            .push(record.to_string());
        Ok(())
    }

    fn read_all(&self, stream: &str) -> Result<Vec<String>, CoreError> {
        validate_id("stream id", stream)?;
        let streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(streams.get(stream).cloned().unwrap_or_default())
    }
}
