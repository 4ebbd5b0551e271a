use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Classification of a single job's failure.
///
/// Only `Transient` is retried in place; everything else is reported against the job
/// index on the first occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Output file briefly locked, database not yet flushed.
    Transient,
    /// Override path does not exist in the model document.
    InvalidOverride,
    /// Engine exited cleanly but the expected output artifact or report table is absent.
    MissingOutput,
    /// Engine exited with a non-zero status or could not be started.
    EngineFailed,
    /// Engine exceeded its deadline and was terminated by the worker.
    Timeout,
    /// The result sink rejected the write (schema conflict, disk full, lock wait exhausted).
    Sink,
    Io,
    Panicked,
    /// A process-mode child exited abnormally.
    WorkerCrashed,
    /// A process-mode child answered with something that is not a job outcome.
    Protocol,
}

impl ErrorKind {
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorKind::Transient)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::InvalidOverride => "invalid_override",
            ErrorKind::MissingOutput => "missing_output",
            ErrorKind::EngineFailed => "engine_failed",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Sink => "sink",
            ErrorKind::Io => "io",
            ErrorKind::Panicked => "panicked",
            ErrorKind::WorkerCrashed => "worker_crashed",
            ErrorKind::Protocol => "protocol",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn io(context: &str, err: std::io::Error) -> Self {
        Self::new(ErrorKind::Io, format!("{}: {}", context, err))
    }
}

impl From<SinkError> for JobError {
    fn from(e: SinkError) -> Self {
        let kind = if e.is_busy() {
            ErrorKind::Transient
        } else {
            ErrorKind::Sink
        };
        JobError::new(kind, e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sqlite error on {path}: {source}")]
    Sqlite {
        path: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("schema conflict for table '{table}': existing columns {existing:?}, incoming {incoming:?}")]
    SchemaConflict {
        table: String,
        existing: Vec<String>,
        incoming: Vec<String>,
    },

    #[error("row {row} has {got} values, table '{table}' has {expected} columns")]
    RowShape {
        table: String,
        row: usize,
        expected: usize,
        got: usize,
    },

    #[error("unknown table '{0}'")]
    UnknownTable(String),

    #[error("export target table '{0}' already exists")]
    TargetExists(String),

    #[error("invalid axis {0}: expected 0 (rows) or 1 (columns)")]
    InvalidAxis(i64),

    #[error("csv export failed: {0}")]
    Csv(#[from] csv::Error),
}

impl SinkError {
    pub fn sqlite(path: &std::path::Path, source: rusqlite::Error) -> Self {
        SinkError::Sqlite {
            path: path.display().to_string(),
            source,
        }
    }

    pub fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        SinkError::Io {
            path: path.display().to_string(),
            source,
        }
    }

    /// Lock contention that a later attempt may get past.
    pub fn is_busy(&self) -> bool {
        match self {
            SinkError::Sqlite {
                source: rusqlite::Error::SqliteFailure(e, _),
                ..
            } => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("invalid concurrency: {0}")]
    InvalidConcurrency(String),

    #[error("all {0} jobs failed")]
    AllJobsFailed(usize),

    #[error("job {job_id} failed ({kind}): {message}")]
    FailFast {
        job_id: String,
        kind: ErrorKind,
        message: String,
    },

    #[error("results requested before run_all_jobs completed successfully (phase: {0})")]
    NotReady(String),

    #[error("no simulation results to save")]
    NoResults,

    #[error("failed to prepare scratch directory {path}: {source}")]
    Scratch {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Sink(#[from] SinkError),
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct ConfigError(pub String);
