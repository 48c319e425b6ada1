//! Scheduler-level errors.

use std::time::Duration;

use jobforge_core::JobType;

use crate::config::ConfigError;

/// Why a handler attempt did not produce a result.
///
/// These never reach callers directly; they are folded into job state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutionError {
    #[error("no handler registered for job type {0}")]
    MissingHandler(JobType),

    /// The handler returned an error.
    #[error("{0}")]
    Handler(String),

    #[error("timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl ExecutionError {
    /// A missing handler cannot be fixed by trying again.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ExecutionError::MissingHandler(_))
    }
}

/// Failure to construct a scheduler.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("no tokio runtime available; create the scheduler from within a runtime")]
    NoRuntime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_missing_handler_is_terminal() {
        assert!(!ExecutionError::MissingHandler(JobType::Echo).is_retryable());
        assert!(ExecutionError::Handler("io".into()).is_retryable());
        assert!(ExecutionError::Timeout(Duration::from_millis(5)).is_retryable());
        assert!(ExecutionError::Panicked("oops".into()).is_retryable());
    }

    #[test]
    fn timeout_message_names_the_limit() {
        let err = ExecutionError::Timeout(Duration::from_millis(1500));
        assert_eq!(err.to_string(), "timed out after 1500ms");
    }
}
