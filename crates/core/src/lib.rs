//! `jobforge-core`: job record model shared by the scheduler and its callers.
//!
//! This crate contains **pure domain** types (no runtime, no locking).

pub mod error;
pub mod id;
pub mod job;
pub mod payload;

pub use error::{JobError, JobResult};
pub use id::{JobId, UserId};
pub use job::{
    Job, JobLogEntry, JobMetrics, JobOutcome, JobPriority, JobStatus, LogLevel, RetryDecision,
    MAX_LOG_ENTRIES,
};
pub use payload::{
    DataExportParams, EchoParams, ExportFormat, JobPayload, JobType, NotificationChannel,
    NotificationParams, StudyCreationParams,
};
