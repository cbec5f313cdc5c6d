//! Engine error taxonomy
//!
//! Row-level problems are not errors at this level: the transformer returns a
//! [`crate::transform::Rejection`] and the pipeline decides whether to
//! dead-letter it or promote it to [`IngestError::RowValidation`] under
//! strict mode. Everything here is either job-fatal or a registry/control
//! error returned to the caller.

use crate::registry::JobStatus;
use thiserror::Error;

pub type IngestResult<T> = std::result::Result<T, IngestError>;

#[derive(Error, Debug)]
pub enum IngestError {
    /// Unreachable API, unreadable or malformed file. Always fatal.
    #[error("Source error: {0}")]
    Source(String),

    /// A row failed validation while the job runs in strict mode
    #[error("Row {row_index} rejected: {reason}")]
    RowValidation { row_index: u64, reason: String },

    /// The store refused a whole buffer (duplicate or foreign key)
    #[error("Constraint violation: {0}")]
    Constraint(String),

    /// Checkpoint could not be read or written. Never fails a job.
    #[error("Checkpoint IO error for job {job_id}: {message}")]
    CheckpointIo { job_id: String, message: String },

    /// Rejected rows could not be persisted
    #[error("Dead-letter IO error at {path}: {source}")]
    DeadLetterIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Job {0} is already running")]
    AlreadyRunning(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Job {job_id} cancelled{}", .reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default())]
    Cancelled {
        job_id: String,
        reason: Option<String>,
    },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl IngestError {
    /// Short stable label used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            IngestError::Source(_) => "source",
            IngestError::RowValidation { .. } => "row_validation",
            IngestError::Constraint(_) => "constraint",
            IngestError::CheckpointIo { .. } => "checkpoint_io",
            IngestError::DeadLetterIo { .. } => "dead_letter_io",
            IngestError::Database(_) => "database",
            IngestError::AlreadyRunning(_) => "already_running",
            IngestError::JobNotFound(_) => "job_not_found",
            IngestError::InvalidTransition { .. } => "invalid_transition",
            IngestError::Cancelled { .. } => "cancelled",
            IngestError::Config(_) => "config",
        }
    }

    /// Whether this error ends a running job with status `failed`
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            IngestError::CheckpointIo { .. } | IngestError::Cancelled { .. }
        )
    }
}

impl From<reqwest::Error> for IngestError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            IngestError::Source(format!("request timed out: {err}"))
        } else {
            IngestError::Source(format!("request failed: {err}"))
        }
    }
}
