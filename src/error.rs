//! Error types.
//!
//! Only terminal failures are errors. Policy rejections, challenge prompts and non-zero exits
//! are ordinary [`BrokerResponse`](crate::broker::BrokerResponse) values.

use std::path::PathBuf;

/// Failure of a persisted store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store I/O on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt store {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to lock {}: {source}", path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Terminal failure of a broker request.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Missing or unusable project path or configuration. Nothing was mutated.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// The session container could not be brought up. Carries the runtime's startup log.
    #[error("container {container} failed to start: {message}\n--- container log ---\n{logs}")]
    Infrastructure {
        container: String,
        message: String,
        logs: String,
    },
    /// The execution service itself failed (daemon unreachable, exec failed to spawn).
    #[error("execution service error: {0}")]
    Runtime(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}
