//! Job record and lifecycle state machine.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{JobError, JobResult};
use crate::id::{JobId, UserId};
use crate::payload::{JobPayload, JobType};

/// Number of log entries kept per job; older entries are dropped first.
pub const MAX_LOG_ENTRIES: usize = 100;

/// Retry ceiling used when neither the job nor the scheduler overrides it.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Dispatch priority. Fixed at creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl JobPriority {
    /// All priorities, highest first.
    pub const ALL: [JobPriority; 4] = [
        JobPriority::Critical,
        JobPriority::High,
        JobPriority::Normal,
        JobPriority::Low,
    ];

    /// 0 for `Critical` up to 3 for `Low`.
    pub fn rank(&self) -> usize {
        match self {
            JobPriority::Critical => 0,
            JobPriority::High => 1,
            JobPriority::Normal => 2,
            JobPriority::Low => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobPriority::Critical => "critical",
            JobPriority::High => "high",
            JobPriority::Normal => "normal",
            JobPriority::Low => "low",
        }
    }
}

impl core::fmt::Display for JobPriority {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, or waiting out a retry delay
    Pending,
    /// A handler attempt is in flight
    Running,
    Completed,
    /// Failed permanently (retries exhausted or no handler)
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether `self -> next` is an edge of the lifecycle state machine.
    ///
    /// `Running -> Pending` is the automatic retry edge and `Failed -> Pending`
    /// the manual one. `Completed` and `Cancelled` have no outgoing edges.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Pending)
                | (Failed, Pending)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One entry of a job's log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobLogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<JsonValue>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMetrics {
    /// Wall-clock duration of the final attempt.
    pub duration_ms: u64,
    /// Number of handler attempts made, including the final one.
    pub attempts: u32,
}

/// Outcome recorded once a job reaches `Completed` or `Failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub success: bool,
    pub data: Option<JsonValue>,
    pub error: Option<String>,
    pub metrics: JobMetrics,
}

impl JobOutcome {
    pub fn succeeded(data: JsonValue, metrics: JobMetrics) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            metrics,
        }
    }

    pub fn failed(error: impl Into<String>, metrics: JobMetrics) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            metrics,
        }
    }
}

/// What happened to a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back to `Pending`; `retry_count` is the new count.
    Retry { retry_count: u32 },
    /// Budget spent; the job is now `Failed`.
    Exhausted { attempts: u32 },
}

/// A background job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: JobType,
    pub title: String,
    pub description: Option<String>,
    pub status: JobStatus,
    pub priority: JobPriority,
    /// 0..=100, set by the running handler
    pub progress: u8,
    pub payload: JobPayload,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Present iff `status` is `Completed` or `Failed`
    pub result: Option<JobOutcome>,
    pub created_at: DateTime<Utc>,
    /// First dispatch; kept across retries
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub estimated_completion: Option<DateTime<Utc>>,
    pub created_by: UserId,
    pub logs: VecDeque<JobLogEntry>,
}

impl Job {
    /// Create a new pending job. The job type follows from the payload.
    pub fn new(title: impl Into<String>, payload: JobPayload, created_by: UserId) -> Self {
        Self {
            id: JobId::new(),
            job_type: payload.job_type(),
            title: title.into(),
            description: None,
            status: JobStatus::Pending,
            priority: JobPriority::default(),
            progress: 0,
            payload,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            result: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            estimated_completion: None,
            created_by,
            logs: VecDeque::new(),
        }
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Estimated completion as `created_at + estimate`.
    pub fn with_estimate(mut self, estimate: Duration) -> Self {
        self.estimated_completion = chrono::Duration::from_std(estimate)
            .ok()
            .and_then(|d| self.created_at.checked_add_signed(d));
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Number of the attempt currently (or last) dispatched, 1-indexed.
    pub fn attempt(&self) -> u32 {
        self.retry_count + 1
    }

    /// Terminal and finished strictly before `cutoff`.
    pub fn finished_before(&self, cutoff: DateTime<Utc>) -> bool {
        self.is_terminal() && self.completed_at.is_some_and(|at| at < cutoff)
    }

    fn transition(&mut self, next: JobStatus) -> JobResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(JobError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Mark job as running (dispatched).
    pub fn mark_running(&mut self) -> JobResult<()> {
        self.transition(JobStatus::Running)?;
        self.progress = 0;
        self.started_at.get_or_insert_with(Utc::now);
        let message = format!("Attempt {} started", self.attempt());
        self.push_log(LogLevel::Info, message, None);
        Ok(())
    }

    /// Mark job as completed with the handler's output.
    pub fn mark_completed(&mut self, data: JsonValue, duration: Duration) -> JobResult<()> {
        self.transition(JobStatus::Completed)?;
        self.progress = 100;
        self.completed_at = Some(Utc::now());
        self.result = Some(JobOutcome::succeeded(
            data,
            JobMetrics {
                duration_ms: duration_ms(duration),
                attempts: self.attempt(),
            },
        ));
        self.push_log(LogLevel::Info, "Job completed", None);
        Ok(())
    }

    /// Record a failed attempt and decide whether the job goes back to
    /// `Pending` or fails permanently.
    pub fn record_failure(&mut self, error: &str, duration: Duration) -> JobResult<RetryDecision> {
        if self.status != JobStatus::Running {
            return Err(JobError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: JobStatus::Failed,
            });
        }

        let next = self.retry_count + 1;
        if next < self.max_retries {
            self.transition(JobStatus::Pending)?;
            self.retry_count = next;
            self.progress = 0;
            self.push_log(
                LogLevel::Warn,
                format!("Attempt {next} failed, retrying ({next}/{}): {error}", self.max_retries),
                None,
            );
            return Ok(RetryDecision::Retry { retry_count: next });
        }

        self.transition(JobStatus::Failed)?;
        self.retry_count = next.min(self.max_retries);
        self.completed_at = Some(Utc::now());
        let message = format!("failed after {next} attempts: {error}");
        self.push_log(LogLevel::Error, message.clone(), None);
        self.result = Some(JobOutcome::failed(
            message,
            JobMetrics {
                duration_ms: duration_ms(duration),
                attempts: next,
            },
        ));
        Ok(RetryDecision::Exhausted { attempts: next })
    }

    /// Fail the running job without consuming retry budget.
    pub fn mark_failed(&mut self, error: impl Into<String>) -> JobResult<()> {
        self.transition(JobStatus::Failed)?;
        let error = error.into();
        self.completed_at = Some(Utc::now());
        self.push_log(LogLevel::Error, error.clone(), None);
        self.result = Some(JobOutcome::failed(
            error,
            JobMetrics {
                duration_ms: 0,
                attempts: self.attempt(),
            },
        ));
        Ok(())
    }

    /// Mark job as cancelled.
    pub fn mark_cancelled(&mut self) -> JobResult<()> {
        let was = self.status;
        self.transition(JobStatus::Cancelled)?;
        self.completed_at = Some(Utc::now());
        self.result = None;
        self.push_log(LogLevel::Info, format!("Job cancelled while {was}"), None);
        Ok(())
    }

    /// Move a failed job back to `Pending` with a fresh retry budget.
    pub fn reset_for_retry(&mut self) -> JobResult<()> {
        if self.status != JobStatus::Failed {
            return Err(JobError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: JobStatus::Pending,
            });
        }
        self.transition(JobStatus::Pending)?;
        self.retry_count = 0;
        self.progress = 0;
        self.result = None;
        self.completed_at = None;
        self.push_log(LogLevel::Info, "Job requeued manually", None);
        Ok(())
    }

    /// Set progress (clamped to 100). Ignored unless the job is running.
    pub fn set_progress(&mut self, progress: u8) -> bool {
        if self.status != JobStatus::Running {
            return false;
        }
        self.progress = progress.min(100);
        true
    }

    /// Append a log entry, dropping the oldest once the cap is reached.
    pub fn push_log(&mut self, level: LogLevel, message: impl Into<String>, meta: Option<JsonValue>) {
        while self.logs.len() >= MAX_LOG_ENTRIES {
            self.logs.pop_front();
        }
        self.logs.push_back(JobLogEntry {
            timestamp: Utc::now(),
            level,
            message: message.into(),
            meta,
        });
    }

    /// Open key/value view of the payload plus the scheduler-managed fields.
    pub fn metadata(&self) -> JsonValue {
        let mut metadata = match self.payload.to_metadata() {
            JsonValue::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        metadata.insert("retryCount".to_string(), self.retry_count.into());
        metadata.insert("maxRetries".to_string(), self.max_retries.into());
        JsonValue::Object(metadata)
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn echo_job() -> Job {
        Job::new("echo", JobPayload::echo("hello"), UserId::new())
    }

    #[test]
    fn job_lifecycle() {
        let mut job = echo_job();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.job_type, JobType::Echo);

        job.mark_running().unwrap();
        assert_eq!(job.status, JobStatus::Running);
        let started = job.started_at.unwrap();

        assert!(job.set_progress(40));
        job.mark_completed(serde_json::json!({"ok": true}), Duration::from_millis(12))
            .unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
        assert_eq!(job.started_at, Some(started));
        let result = job.result.as_ref().unwrap();
        assert!(result.success);
        assert_eq!(result.metrics, JobMetrics { duration_ms: 12, attempts: 1 });
    }

    #[test]
    fn job_failure_and_retry() {
        let mut job = echo_job().with_max_retries(2);

        job.mark_running().unwrap();
        job.set_progress(70);
        let decision = job.record_failure("boom", Duration::ZERO).unwrap();
        assert_eq!(decision, RetryDecision::Retry { retry_count: 1 });
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.progress, 0);
        assert!(job.result.is_none());

        job.mark_running().unwrap();
        let decision = job.record_failure("boom again", Duration::ZERO).unwrap();
        assert_eq!(decision, RetryDecision::Exhausted { attempts: 2 });
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 2);

        let error = job.result.as_ref().and_then(|r| r.error.clone()).unwrap();
        assert_eq!(error, "failed after 2 attempts: boom again");
    }

    #[test]
    fn completed_and_cancelled_jobs_never_reactivate() {
        let mut done = echo_job();
        done.mark_running().unwrap();
        done.mark_completed(JsonValue::Null, Duration::ZERO).unwrap();
        assert!(matches!(done.mark_running(), Err(JobError::InvalidTransition { .. })));
        assert!(done.mark_cancelled().is_err());
        assert!(done.reset_for_retry().is_err());

        let mut cancelled = echo_job();
        cancelled.mark_cancelled().unwrap();
        assert!(cancelled.mark_running().is_err());
        assert!(cancelled.result.is_none());
        assert!(cancelled.completed_at.is_some());
    }

    #[test]
    fn failed_job_can_be_requeued_manually() {
        let mut job = echo_job().with_max_retries(1);
        job.mark_running().unwrap();
        job.record_failure("nope", Duration::ZERO).unwrap();
        assert_eq!(job.status, JobStatus::Failed);

        job.reset_for_retry().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 0);
        assert!(job.result.is_none());
        assert!(job.completed_at.is_none());
    }

    #[test]
    fn progress_is_ignored_unless_running() {
        let mut job = echo_job();
        assert!(!job.set_progress(10));
        job.mark_running().unwrap();
        assert!(job.set_progress(250));
        assert_eq!(job.progress, 100);
    }

    #[test]
    fn logs_are_capped() {
        let mut job = echo_job();
        for i in 0..(MAX_LOG_ENTRIES + 25) {
            job.push_log(LogLevel::Debug, format!("line {i}"), None);
        }
        assert_eq!(job.logs.len(), MAX_LOG_ENTRIES);
        assert_eq!(job.logs.front().unwrap().message, "line 25");
        assert_eq!(
            job.logs.back().unwrap().message,
            format!("line {}", MAX_LOG_ENTRIES + 24)
        );
    }

    #[test]
    fn metadata_exposes_retry_fields() {
        let job = echo_job().with_max_retries(5);
        let metadata = job.metadata();
        assert_eq!(metadata["message"], "hello");
        assert_eq!(metadata["retryCount"], 0);
        assert_eq!(metadata["maxRetries"], 5);
    }

    #[test]
    fn estimate_is_relative_to_creation() {
        let job = echo_job().with_estimate(Duration::from_secs(30));
        let eta = job.estimated_completion.unwrap();
        assert_eq!((eta - job.created_at).num_seconds(), 30);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: however many attempts fail, `retry_count` never exceeds
        /// `max_retries` and the job fails exactly when the budget is spent.
        #[test]
        fn retry_count_never_exceeds_budget(max_retries in 1u32..8, failures in 1u32..12) {
            let mut job = echo_job().with_max_retries(max_retries);

            for _ in 0..failures {
                if job.status != JobStatus::Pending {
                    break;
                }
                job.mark_running().unwrap();
                job.record_failure("err", Duration::ZERO).unwrap();
                prop_assert!(job.retry_count <= job.max_retries);
            }

            if failures >= max_retries {
                prop_assert_eq!(job.status, JobStatus::Failed);
                prop_assert_eq!(job.retry_count, max_retries);
                prop_assert!(job.result.is_some());
            } else {
                prop_assert_eq!(job.status, JobStatus::Pending);
                prop_assert_eq!(job.retry_count, failures);
                prop_assert!(job.result.is_none());
            }
        }
    }
}
