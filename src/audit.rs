//! Per-session execution transcripts.
//!
//! One JSON line per executed command in `<dir>/<session>.jsonl`. Files are append-only and
//! rotate by size (`<session>.jsonl.1.jsonl` ... `.9.jsonl`).

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::TranscriptConfig;
use crate::error::StoreError;
use crate::session::SessionId;

const MAX_ROTATED: u32 = 9;

/// One executed command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptRecord {
    /// When the command finished.
    pub timestamp: DateTime<Utc>,
    /// Unique id of this record (UUID v4).
    pub event_id: String,
    /// Session the command ran for.
    pub session_id: SessionId,
    /// Name of the container that ran it.
    pub container: String,
    /// The command exactly as submitted.
    pub command: String,
    /// Combined output as returned to the caller.
    pub output: String,
    /// Process exit status; `None` when killed by a signal.
    pub exit_code: Option<i32>,
    /// Wall-clock time of the exec call in milliseconds.
    pub duration_ms: u64,
}

impl TranscriptRecord {
    /// Start a record for `command`; fill the outcome in with [`Self::with_result`].
    pub fn new(session_id: &SessionId, container: &str, command: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            event_id: Uuid::new_v4().to_string(),
            session_id: session_id.clone(),
            container: container.to_string(),
            command: command.to_string(),
            output: String::new(),
            exit_code: None,
            duration_ms: 0,
        }
    }

    /// Attach the outcome of the command.
    pub fn with_result(mut self, output: &str, exit_code: Option<i32>, duration_ms: u64) -> Self {
        self.output = output.to_string();
        self.exit_code = exit_code;
        self.duration_ms = duration_ms;
        self
    }
}

/// Writes and reads session transcripts.
#[derive(Debug, Clone)]
pub struct TranscriptLog {
    /// Directory holding one `<session>.jsonl` file per session.
    dir: PathBuf,
    config: TranscriptConfig,
}

impl TranscriptLog {
    /// Create a transcript writer rooted at `dir`. Nothing is touched on disk until the
    /// first append.
    pub fn new(config: TranscriptConfig, dir: PathBuf) -> Self {
        Self { dir, config }
    }

    /// Current transcript file of a session.
    pub fn path_for(&self, session: &SessionId) -> PathBuf {
        self.dir.join(format!("{session}.jsonl"))
    }

    /// Append a record. A disabled transcript writes nothing.
    pub fn append(&self, record: &TranscriptRecord) -> Result<(), StoreError> {
        if !self.config.enabled {
            return Ok(());
        }
        std::fs::create_dir_all(&self.dir).map_err(|e| StoreError::io(&self.dir, e))?;

        let lock_path = self.dir.join(format!("{}.lock", record.session_id));
        let lock = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| StoreError::io(&lock_path, e))?;
        lock.lock_exclusive().map_err(|source| StoreError::Lock {
            path: lock_path.clone(),
            source,
        })?;

        let path = self.path_for(&record.session_id);
        self.rotate_if_needed(&path)?;

        let line = serde_json::to_string(record).map_err(|source| StoreError::Json {
            path: path.clone(),
            source,
        })?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| StoreError::io(&path, e))?;
        writeln!(file, "{line}").map_err(|e| StoreError::io(&path, e))?;
        file.sync_all().map_err(|e| StoreError::io(&path, e))?;

        drop(lock);
        Ok(())
    }

    /// Records of the current (unrotated) transcript, oldest first.
    pub fn read(&self, session: &SessionId) -> Result<Vec<TranscriptRecord>, StoreError> {
        let path = self.path_for(session);
        let file = match std::fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&path, e)),
        };
        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| StoreError::io(&path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            let record = serde_json::from_str(&line).map_err(|source| StoreError::Json {
                path: path.clone(),
                source,
            })?;
            records.push(record);
        }
        Ok(records)
    }

    /// Rotate once the live file reaches `max_size_mb`.
    fn rotate_if_needed(&self, path: &Path) -> Result<(), StoreError> {
        if let Ok(metadata) = std::fs::metadata(path) {
            let limit = u64::from(self.config.max_size_mb).saturating_mul(1024 * 1024);
            if metadata.len() >= limit.max(1) {
                rotate(path)?;
            }
        }
        Ok(())
    }
}

/// Shift `<file>.N.jsonl` to `N+1` (dropping the oldest) and move the live file to `.1`.
fn rotate(path: &Path) -> Result<(), StoreError> {
    for i in (1..MAX_ROTATED).rev() {
        let old_name = format!("{}.{}.jsonl", path.display(), i);
        let new_name = format!("{}.{}.jsonl", path.display(), i + 1);
        let _ = std::fs::rename(&old_name, &new_name);
    }
    let rotated = format!("{}.1.jsonl", path.display());
    std::fs::rename(path, &rotated).map_err(|e| StoreError::io(path, e))
}
