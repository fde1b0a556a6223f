//! Crate-wide error types.
//!
//! Each layer gets its own `thiserror` enum so callers can match on error
//! kinds instead of parsing messages; the teacher (and the rest of the pack)
//! reserves `anyhow` for binary glue and uses typed errors at library seams.

use std::path::PathBuf;

/// Errors from the [`crate::store`] layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("job_id must not be empty")]
    EmptyJobId,
    #[error("job not found: {0}")]
    NotFound(String),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to open database at {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },
    #[error("failed to create directory {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the [`crate::supervisor`] layer.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("executable not found: {0}")]
    ExecutableNotFound(String),
    #[error("permission denied launching job: {0}")]
    PermissionDenied(String),
    #[error("working directory invalid: {}", .0.display())]
    WorkingDirectoryInvalid(PathBuf),
    #[error("log file unwritable: {}: {source}", path.display())]
    LogFileUnwritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("fork failed: {0}")]
    ForkFailed(std::io::Error),
}

/// Errors from the [`crate::manager`] public façade.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("job_id must not be empty")]
    EmptyJobId,
    #[error("command must not be empty")]
    EmptyCommand,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}
