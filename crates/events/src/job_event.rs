//! Notifications emitted by the scheduler.

use serde::{Deserialize, Serialize};

use jobforge_core::{JobId, JobOutcome, JobStatus};

/// Progress or completion of a job.
///
/// Delivered at most once per occurrence; listeners that need certainty
/// poll the scheduler instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobEvent {
    Progress {
        job_id: JobId,
        progress: u8,
        status: JobStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// Emitted once a job is completed, failed or cancelled.
    Completed {
        job_id: JobId,
        status: JobStatus,
        result: Option<JobOutcome>,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            JobEvent::Progress { job_id, .. } | JobEvent::Completed { job_id, .. } => *job_id,
        }
    }

    pub fn status(&self) -> JobStatus {
        match self {
            JobEvent::Progress { status, .. } | JobEvent::Completed { status, .. } => *status,
        }
    }

    pub fn is_completion(&self) -> bool {
        matches!(self, JobEvent::Completed { .. })
    }
}
