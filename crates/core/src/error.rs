//! Domain error model.

use thiserror::Error;

use crate::id::JobId;
use crate::job::JobStatus;

/// Result type used across the job domain.
pub type JobResult<T> = Result<T, JobError>;

/// Job-domain error.
///
/// Covers caller-facing failures (validation, lookup, illegal transitions).
/// Handler execution failures never surface here; they become job state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobError {
    /// Job creation was rejected (bad payload, failed validator).
    #[error("validation failed: {0}")]
    Validation(String),

    /// The job type is not known or has no registered handler.
    #[error("unknown job type: {0}")]
    UnknownJobType(String),

    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("job already exists: {0}")]
    AlreadyExists(JobId),

    /// The operation needs a job in a terminal state.
    #[error("job {0} is still active")]
    NotTerminal(JobId),

    /// A lifecycle transition outside the state machine was requested.
    #[error("invalid transition for job {id}: {from} -> {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    /// The requester does not own the job.
    #[error("job {0} belongs to another requester")]
    Forbidden(JobId),

    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl JobError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn unknown_type(name: impl Into<String>) -> Self {
        Self::UnknownJobType(name.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    /// Whether the error was caused by caller input rather than job state.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            JobError::Validation(_) | JobError::UnknownJobType(_) | JobError::InvalidId(_)
        )
    }
}
