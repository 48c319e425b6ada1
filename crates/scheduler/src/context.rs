//! Per-attempt context handed to job handlers.

use std::sync::Weak;

use tokio_util::sync::CancellationToken;

use jobforge_core::{Job, JobId, JobPayload, JobType, LogLevel};

/// Channel from a running handler back to the scheduler that dispatched it.
///
/// Every call carries the attempt's dispatch sequence number; the scheduler
/// drops calls for an attempt that is no longer the one holding the slot.
pub(crate) trait AttemptFeedback: Send + Sync {
    fn progress(&self, job_id: JobId, attempt: u64, progress: u8, message: Option<&str>) -> bool;

    fn log(&self, job_id: JobId, attempt: u64, level: LogLevel, message: &str);
}

/// Everything a handler gets to see about the attempt it is running.
///
/// Cancellation is cooperative: the scheduler fires the token on cancel and
/// long-running handlers are expected to watch it. On timeout the handler
/// future is dropped at its next await point.
#[derive(Clone)]
pub struct JobContext {
    job_id: JobId,
    job_type: JobType,
    title: String,
    payload: JobPayload,
    retry_count: u32,
    /// Dispatch sequence number of this attempt.
    seq: u64,
    cancellation: CancellationToken,
    /// `None` when not attached to a scheduler.
    feedback: Option<Weak<dyn AttemptFeedback>>,
}

impl JobContext {
    pub(crate) fn new(
        job: &Job,
        seq: u64,
        cancellation: CancellationToken,
        feedback: Option<Weak<dyn AttemptFeedback>>,
    ) -> Self {
        Self {
            job_id: job.id,
            job_type: job.job_type,
            title: job.title.clone(),
            payload: job.payload.clone(),
            retry_count: job.retry_count,
            seq,
            cancellation,
            feedback,
        }
    }

    /// Context for running a handler outside a scheduler (tests, one-off
    /// invocations). Progress and log calls go nowhere.
    pub fn detached(job: &Job) -> Self {
        Self::new(job, 0, CancellationToken::new(), None)
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn job_type(&self) -> JobType {
        self.job_type
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn payload(&self) -> &JobPayload {
        &self.payload
    }

    /// 1 for the first attempt, 2 for the first retry, ...
    pub fn attempt(&self) -> u32 {
        self.retry_count + 1
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves once the attempt has been cancelled.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Report progress (0..=100). Returns `false` if the update was dropped
    /// because this attempt is no longer the running one.
    pub fn update_progress(&self, progress: u8, message: Option<&str>) -> bool {
        match self.feedback.as_ref().and_then(Weak::upgrade) {
            Some(feedback) => feedback.progress(self.job_id, self.seq, progress, message),
            None => false,
        }
    }

    /// Append to the job log.
    pub fn log(&self, level: LogLevel, message: impl AsRef<str>) {
        if let Some(feedback) = self.feedback.as_ref().and_then(Weak::upgrade) {
            feedback.log(self.job_id, self.seq, level, message.as_ref());
        }
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Warn, message);
    }

    #[cfg(test)]
    pub(crate) fn with_feedback(mut self, feedback: &std::sync::Arc<dyn AttemptFeedback>) -> Self {
        self.feedback = Some(std::sync::Arc::downgrade(feedback));
        self
    }
}

impl core::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job_id)
            .field("job_type", &self.job_type)
            .field("attempt", &self.attempt())
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use jobforge_core::UserId;

    #[derive(Default)]
    struct Recorder {
        current_attempt: u64,
        seen: Mutex<Vec<(u8, Option<String>)>>,
        logs: Mutex<Vec<String>>,
    }

    impl AttemptFeedback for Recorder {
        fn progress(&self, _: JobId, attempt: u64, progress: u8, message: Option<&str>) -> bool {
            if attempt != self.current_attempt {
                return false;
            }
            self.seen
                .lock()
                .unwrap()
                .push((progress, message.map(str::to_string)));
            true
        }

        fn log(&self, _: JobId, _: u64, _: LogLevel, message: &str) {
            self.logs.lock().unwrap().push(message.to_string());
        }
    }

    fn job() -> Job {
        Job::new("ctx", JobPayload::echo("hi"), UserId::system())
    }

    #[test]
    fn detached_context_drops_feedback() {
        let ctx = JobContext::detached(&job());
        assert!(!ctx.update_progress(50, None));
        ctx.info("nobody hears this");
        assert_eq!(ctx.attempt(), 1);
        assert!(!ctx.is_cancelled());
    }

    #[test]
    fn feedback_reaches_the_scheduler_for_the_current_attempt() {
        let recorder = Arc::new(Recorder::default());
        let feedback: Arc<dyn AttemptFeedback> = recorder.clone();
        let ctx = JobContext::detached(&job()).with_feedback(&feedback);

        assert!(ctx.update_progress(30, Some("loading")));
        ctx.warn("slow");

        assert_eq!(
            *recorder.seen.lock().unwrap(),
            vec![(30, Some("loading".to_string()))]
        );
        assert_eq!(*recorder.logs.lock().unwrap(), vec!["slow".to_string()]);
    }

    #[test]
    fn stale_attempt_is_rejected() {
        let recorder = Arc::new(Recorder {
            current_attempt: 1,
            ..Recorder::default()
        });
        let feedback: Arc<dyn AttemptFeedback> = recorder.clone();
        let ctx = JobContext::detached(&job()).with_feedback(&feedback);

        assert!(!ctx.update_progress(90, None));
        assert!(recorder.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancellation_is_observable() {
        let ctx = JobContext::detached(&job());
        let token = ctx.cancellation_token();
        token.cancel();
        ctx.cancelled().await;
        assert!(ctx.is_cancelled());
    }
}
