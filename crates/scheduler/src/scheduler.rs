//! Dispatch loop, attempt supervision and the public scheduler handle.
//!
//! ## Locking
//!
//! - `dispatch` (queue + running-attempt table) serialises every decision
//!   about what runs next
//! - the store has its own lock and is always taken *after* `dispatch`
//! - the registry is read while dispatching; nothing takes `dispatch`
//!   while holding the registry
//!
//! Handler bodies run as their own tokio tasks, outside every lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, Weak};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value as JsonValue;
use tokio::runtime::Handle;
use tokio::task::JoinError;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, instrument, warn};

use jobforge_core::{
    Job, JobError, JobId, JobOutcome, JobPayload, JobPriority, JobResult, JobStatus, JobType,
    LogLevel, RetryDecision, UserId,
};
use jobforge_events::{EventBus, InMemoryEventBus, JobEvent, Subscription};

use crate::config::SchedulerConfig;
use crate::context::{AttemptFeedback, JobContext};
use crate::error::{ExecutionError, SchedulerError};
use crate::queue::PriorityQueue;
use crate::registry::{HandlerRegistry, JobHandler};
use crate::retry::RetryPolicy;
use crate::store::{JobFilter, JobStore, QueueStats};

/// Per-job settings supplied at creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOptions {
    pub priority: JobPriority,
    pub description: Option<String>,
    pub created_by: UserId,
    /// Overrides the handler's own estimate.
    pub estimated_duration: Option<Duration>,
    /// Overrides the scheduler-wide `max_retries`.
    pub max_retries: Option<u32>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            priority: JobPriority::Normal,
            description: None,
            created_by: UserId::system(),
            estimated_duration: None,
            max_retries: None,
        }
    }
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_created_by(mut self, user: UserId) -> Self {
        self.created_by = user;
        self
    }

    pub fn with_estimated_duration(mut self, estimate: Duration) -> Self {
        self.estimated_duration = Some(estimate);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

#[derive(Debug, Default)]
struct DispatchState {
    queue: PriorityQueue,
    /// Every attempt currently holding a slot.
    running: HashMap<JobId, RunningAttempt>,
    /// Last attempt sequence number handed out.
    attempt_seq: u64,
    stopped: bool,
}

/// Attempts are identified by a sequence number unique for the scheduler's
/// lifetime, so a reset `retry_count` never makes an old attempt current again.
#[derive(Debug)]
struct RunningAttempt {
    seq: u64,
    token: CancellationToken,
}

/// An attempt that has been claimed under the dispatch lock and is ready to
/// be spawned once the lock is released.
struct Dispatch {
    job_id: JobId,
    job_type: JobType,
    seq: u64,
    retry_count: u32,
    handler: Arc<dyn JobHandler>,
    ctx: JobContext,
    token: CancellationToken,
}

/// Store-side result of a finished attempt.
enum Settled {
    Completed(Option<JobOutcome>),
    Retry { retry_count: u32 },
    Failed(Option<JobOutcome>),
}

#[derive(Debug)]
struct Inner {
    config: SchedulerConfig,
    retry_policy: RetryPolicy,
    registry: RwLock<HandlerRegistry>,
    store: JobStore,
    dispatch: Mutex<DispatchState>,
    events: InMemoryEventBus<JobEvent>,
    runtime: Handle,
    shutdown: CancellationToken,
}

/// Handle to a running scheduler. Cheap to clone; all clones share state.
///
/// Dropping the last handle stops the maintenance loop. Attempts already in
/// flight run to completion.
#[derive(Debug, Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Scheduler with no handlers registered.
    ///
    /// Must be called from within a tokio runtime; the runtime handle is
    /// captured so later calls work from synchronous code too.
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        Self::with_registry(config, HandlerRegistry::new())
    }

    pub fn with_registry(
        config: SchedulerConfig,
        registry: HandlerRegistry,
    ) -> Result<Self, SchedulerError> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| SchedulerError::NoRuntime)?;

        let inner = Arc::new(Inner {
            retry_policy: config.retry_policy(),
            registry: RwLock::new(registry),
            store: JobStore::new(),
            dispatch: Mutex::new(DispatchState::default()),
            events: InMemoryEventBus::new(),
            runtime,
            shutdown: CancellationToken::new(),
            config,
        });

        inner.runtime.spawn(maintenance_loop(
            Arc::downgrade(&inner),
            inner.config.cleanup_interval(),
            inner.shutdown.clone(),
        ));

        info!(
            max_concurrent_jobs = inner.config.max_concurrent_jobs,
            job_timeout_ms = inner.config.job_timeout_ms,
            max_retries = inner.config.max_retries,
            "scheduler started"
        );
        Ok(Self { inner })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Register (or replace) a handler. Attempts already dispatched keep the
    /// handler they started with.
    pub fn register<H: JobHandler>(&self, job_type: JobType, handler: H) {
        let replaced = self
            .inner
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register(job_type, handler);
        info!(%job_type, replaced = replaced.is_some(), "handler registered");
    }

    /// Remove a handler. Queued jobs of that type fail when dispatched.
    pub fn unregister(&self, job_type: JobType) -> bool {
        let removed = self
            .inner
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .unregister(job_type);
        if removed.is_some() {
            warn!(%job_type, "handler unregistered");
        }
        removed.is_some()
    }

    /// Validate, store and enqueue a new job.
    ///
    /// Rejected jobs leave no record behind.
    pub fn create_job(
        &self,
        title: impl Into<String>,
        payload: JobPayload,
        options: JobOptions,
    ) -> JobResult<JobId> {
        let title = title.into();
        if title.trim().is_empty() {
            return Err(JobError::validation("title must not be empty"));
        }

        let estimate = {
            let registry = self.inner.registry();
            registry.validate(&payload)?;
            options
                .estimated_duration
                .or_else(|| registry.estimate_duration(&payload))
        };

        let max_retries = options.max_retries.unwrap_or(self.inner.config.max_retries);
        if max_retries == 0 {
            return Err(JobError::validation("max_retries must be at least 1"));
        }

        let mut job = Job::new(title, payload, options.created_by)
            .with_priority(options.priority)
            .with_max_retries(max_retries);
        if let Some(description) = options.description {
            job = job.with_description(description);
        }
        if let Some(estimate) = estimate {
            job = job.with_estimate(estimate);
        }
        job.push_log(
            LogLevel::Info,
            format!("Job created with {} priority", job.priority),
            None,
        );

        let (job_id, job_type, priority) = (job.id, job.job_type, job.priority);
        {
            let mut state = self.inner.lock_dispatch();
            self.inner.store.insert(job)?;
            state.queue.enqueue(job_id, priority);
        }
        info!(%job_id, %job_type, %priority, "job created");

        self.inner.pump();
        Ok(job_id)
    }

    /// Create a job from a type name and an untyped metadata object, as
    /// received from a transport edge.
    pub fn create_job_from_metadata(
        &self,
        job_type: &str,
        title: impl Into<String>,
        metadata: JsonValue,
        options: JobOptions,
    ) -> JobResult<JobId> {
        let job_type: JobType = job_type.parse()?;
        let payload = JobPayload::from_metadata(job_type, metadata)?;
        self.create_job(title, payload, options)
    }

    pub fn get_job(&self, job_id: JobId) -> Option<Job> {
        self.inner.store.get(job_id)
    }

    /// Jobs matching `filter`, newest first.
    pub fn list_jobs(&self, filter: &JobFilter) -> Vec<Job> {
        self.inner.store.list(filter)
    }

    /// Cancel a pending or running job. Returns `false` if the job is
    /// unknown or already terminal.
    pub fn cancel_job(&self, job_id: JobId) -> bool {
        self.inner.cancel(job_id)
    }

    /// Cancel on behalf of `user`, who must own the job.
    pub fn cancel_job_as(&self, job_id: JobId, user: UserId) -> JobResult<bool> {
        let owner = self
            .inner
            .store
            .view(job_id, |job| job.created_by)
            .ok_or(JobError::NotFound(job_id))?;
        if owner != user {
            return Err(JobError::Forbidden(job_id));
        }
        Ok(self.inner.cancel(job_id))
    }

    /// Set progress of a running job. Ignored (returns `false`) otherwise.
    pub fn update_progress(&self, job_id: JobId, progress: u8, message: Option<&str>) -> bool {
        self.inner.set_progress(job_id, None, progress, message)
    }

    /// Requeue a failed job with a fresh retry budget.
    pub fn retry_job(&self, job_id: JobId) -> JobResult<()> {
        {
            let mut state = self.inner.lock_dispatch();
            let priority = self
                .inner
                .store
                .update(job_id, |job| job.reset_for_retry().map(|()| job.priority))
                .ok_or(JobError::NotFound(job_id))??;
            state.queue.enqueue(job_id, priority);
        }
        info!(%job_id, "failed job requeued");

        self.inner.emit(JobEvent::Progress {
            job_id,
            progress: 0,
            status: JobStatus::Pending,
            message: Some("requeued".to_string()),
        });
        self.inner.pump();
        Ok(())
    }

    /// Remove a terminal job immediately, bypassing retention.
    pub fn purge_job(&self, job_id: JobId) -> JobResult<Job> {
        let _state = self.inner.lock_dispatch();
        let terminal = self
            .inner
            .store
            .view(job_id, Job::is_terminal)
            .ok_or(JobError::NotFound(job_id))?;
        if !terminal {
            return Err(JobError::NotTerminal(job_id));
        }
        let job = self
            .inner
            .store
            .remove(job_id)
            .ok_or(JobError::NotFound(job_id))?;
        debug!(%job_id, "job purged");
        Ok(job)
    }

    pub fn record_log(
        &self,
        job_id: JobId,
        level: LogLevel,
        message: impl Into<String>,
        meta: Option<JsonValue>,
    ) -> JobResult<()> {
        self.inner.store.record_log(job_id, level, message, meta)
    }

    pub fn get_queue_stats(&self) -> QueueStats {
        QueueStats {
            max_concurrent: self.inner.config.max_concurrent_jobs,
            ..self.inner.store.counts()
        }
    }

    /// Zero-based place in the dispatch order, if the job is queued.
    pub fn queue_position(&self, job_id: JobId) -> Option<usize> {
        self.inner.lock_dispatch().queue.position(job_id)
    }

    pub fn subscribe(&self) -> Subscription<JobEvent> {
        self.inner.events.subscribe()
    }

    /// Run the retention sweep now. Returns the number of jobs removed.
    pub fn cleanup(&self) -> usize {
        self.inner.cleanup()
    }

    /// Stop dispatching and stop the maintenance loop. Running attempts
    /// finish normally; queued jobs stay pending.
    pub fn shutdown(&self) {
        self.inner.lock_dispatch().stopped = true;
        self.inner.shutdown.cancel();
        info!("scheduler shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }
}

impl Inner {
    fn lock_dispatch(&self) -> MutexGuard<'_, DispatchState> {
        self.dispatch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn registry(&self) -> RwLockReadGuard<'_, HandlerRegistry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: JobEvent) {
        if let Err(err) = self.events.publish(event) {
            warn!(error = ?err, "dropping job event");
        }
    }

    /// Dispatch queued jobs until the concurrency cap is reached or the queue
    /// is empty.
    fn pump(self: &Arc<Self>) {
        let mut ready = Vec::new();
        let mut failed = Vec::new();

        {
            let mut state = self.lock_dispatch();
            if state.stopped {
                return;
            }
            let registry = self.registry();

            while state.running.len() < self.config.max_concurrent_jobs {
                let Some(job_id) = state.queue.dequeue_next() else {
                    break;
                };

                let token = CancellationToken::new();
                state.attempt_seq += 1;
                let seq = state.attempt_seq;
                let claimed = self.store.update(job_id, |job| {
                    if job.status != JobStatus::Pending {
                        return None;
                    }

                    let Some(handler) = registry.resolve(job.job_type) else {
                        let err = ExecutionError::MissingHandler(job.job_type);
                        let marked = job
                            .mark_running()
                            .and_then(|()| job.mark_failed(err.to_string()));
                        return marked.ok().map(|()| Err((job.job_type, job.result.clone())));
                    };

                    job.mark_running().ok()?;
                    let weak: Weak<Inner> = Arc::downgrade(self);
                    let feedback: Weak<dyn AttemptFeedback> = weak;
                    Some(Ok(Dispatch {
                        job_id,
                        job_type: job.job_type,
                        seq,
                        retry_count: job.retry_count,
                        handler,
                        ctx: JobContext::new(job, seq, token.clone(), Some(feedback)),
                        token: token.clone(),
                    }))
                });

                match claimed.flatten() {
                    Some(Ok(dispatch)) => {
                        state.running.insert(job_id, RunningAttempt { seq, token });
                        ready.push(dispatch);
                    }
                    Some(Err((job_type, result))) => failed.push((job_id, job_type, result)),
                    // Cancelled (or purged) while queued.
                    None => debug!(%job_id, "skipping stale queue entry"),
                }
            }
        }

        for (job_id, job_type, result) in failed {
            error!(%job_id, %job_type, "no handler registered; job failed");
            self.emit(JobEvent::Completed {
                job_id,
                status: JobStatus::Failed,
                result,
            });
        }

        for dispatch in ready {
            self.emit(JobEvent::Progress {
                job_id: dispatch.job_id,
                progress: 0,
                status: JobStatus::Running,
                message: None,
            });
            self.runtime.spawn(Arc::clone(self).supervise(dispatch));
        }
    }

    /// Race one attempt against its timeout and its cancellation token.
    #[instrument(
        skip_all,
        fields(
            job_id = %dispatch.job_id,
            job_type = %dispatch.job_type,
            attempt = dispatch.retry_count + 1
        )
    )]
    async fn supervise(self: Arc<Self>, dispatch: Dispatch) {
        let Dispatch {
            job_id,
            job_type,
            seq,
            retry_count: _,
            handler,
            ctx,
            token,
        } = dispatch;

        debug!("attempt started");
        let timeout = self.config.job_timeout();
        let started = Instant::now();
        let mut task = self
            .runtime
            .spawn(async move { handler.run(ctx).await }.in_current_span());

        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            joined = &mut task => Some(match joined {
                Ok(Ok(data)) => Ok(data),
                Ok(Err(err)) => Err(ExecutionError::Handler(format!("{err:#}"))),
                Err(join) => Err(ExecutionError::Panicked(panic_message(join))),
            }),
            _ = tokio::time::sleep(timeout) => {
                // The slot is held until the handler future is gone, so a retry
                // never overlaps the attempt it replaces.
                task.abort();
                let _ = (&mut task).await;
                Some(Err(ExecutionError::Timeout(timeout)))
            }
        };

        match outcome {
            Some(outcome) => self.finish_attempt(job_id, job_type, seq, outcome, started.elapsed()),
            None => debug!("attempt cancelled"),
        }

        // Cancellation stays cooperative: a cancelled handler keeps running
        // until it notices, and whatever it returns is dropped with the handle.
        token.cancel();
    }

    fn finish_attempt(
        self: &Arc<Self>,
        job_id: JobId,
        job_type: JobType,
        seq: u64,
        outcome: Result<JsonValue, ExecutionError>,
        elapsed: Duration,
    ) {
        let duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        let error_text = outcome.as_ref().err().map(ToString::to_string);

        let settled = {
            let mut state = self.lock_dispatch();
            if Self::is_current_attempt(&state, job_id, seq) {
                state.running.remove(&job_id);
            } else {
                drop(state);
                debug!(%job_id, "discarding result of a stale attempt");
                return;
            }

            self.store
                .update(job_id, |job| {
                    if job.status != JobStatus::Running {
                        return None;
                    }
                    let settled = match outcome {
                        Ok(data) => job
                            .mark_completed(data, elapsed)
                            .map(|()| Settled::Completed(job.result.clone())),
                        Err(err) if !err.is_retryable() => job
                            .mark_failed(err.to_string())
                            .map(|()| Settled::Failed(job.result.clone())),
                        Err(err) => job.record_failure(&err.to_string(), elapsed).map(
                            |decision| match decision {
                                RetryDecision::Retry { retry_count } => {
                                    Settled::Retry { retry_count }
                                }
                                RetryDecision::Exhausted { .. } => {
                                    Settled::Failed(job.result.clone())
                                }
                            },
                        ),
                    };
                    settled.ok()
                })
                .flatten()
        };

        match settled {
            Some(Settled::Completed(result)) => {
                info!(%job_id, %job_type, duration_ms, "job completed");
                self.emit(JobEvent::Completed {
                    job_id,
                    status: JobStatus::Completed,
                    result,
                });
            }
            Some(Settled::Retry { retry_count }) => {
                let delay = self.retry_policy.delay_for_retry(retry_count);
                warn!(
                    %job_id,
                    %job_type,
                    retry_count,
                    retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = error_text.as_deref().unwrap_or_default(),
                    "attempt failed; retrying"
                );
                self.emit(JobEvent::Progress {
                    job_id,
                    progress: 0,
                    status: JobStatus::Pending,
                    message: error_text,
                });
                self.schedule_retry(job_id, retry_count, delay);
            }
            Some(Settled::Failed(result)) => {
                error!(
                    %job_id,
                    %job_type,
                    error = error_text.as_deref().unwrap_or_default(),
                    "job failed"
                );
                self.emit(JobEvent::Completed {
                    job_id,
                    status: JobStatus::Failed,
                    result,
                });
            }
            None => debug!(%job_id, "discarding result of a stale attempt"),
        }

        self.pump();
    }

    fn schedule_retry(self: &Arc<Self>, job_id: JobId, retry_count: u32, delay: Duration) {
        let inner = Arc::downgrade(self);
        self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = inner.upgrade() {
                inner.requeue(job_id, retry_count);
            }
        });
    }

    /// Put a job back in the queue once its backoff delay has elapsed,
    /// unless it was cancelled or otherwise moved on in the meantime.
    fn requeue(self: &Arc<Self>, job_id: JobId, retry_count: u32) {
        {
            let mut state = self.lock_dispatch();
            let waiting = self
                .store
                .view(job_id, |job| {
                    (job.status == JobStatus::Pending && job.retry_count == retry_count)
                        .then_some(job.priority)
                })
                .flatten();

            match waiting {
                Some(priority) if !state.queue.contains(job_id) => {
                    state.queue.enqueue(job_id, priority);
                }
                _ => return,
            }
        }
        debug!(%job_id, retry_count, "job requeued after backoff");
        self.pump();
    }

    fn cancel(self: &Arc<Self>, job_id: JobId) -> bool {
        let previous = {
            let mut state = self.lock_dispatch();
            state.queue.remove(job_id);
            let previous = self
                .store
                .update(job_id, |job| {
                    let was = job.status;
                    job.mark_cancelled().ok().map(|()| was)
                })
                .flatten();

            if previous.is_some() {
                if let Some(attempt) = state.running.remove(&job_id) {
                    attempt.token.cancel();
                }
            }
            previous
        };

        let Some(was) = previous else {
            return false;
        };

        info!(%job_id, was = %was, "job cancelled");
        self.emit(JobEvent::Completed {
            job_id,
            status: JobStatus::Cancelled,
            result: None,
        });
        self.pump();
        true
    }

    fn is_current_attempt(state: &DispatchState, job_id: JobId, seq: u64) -> bool {
        state.running.get(&job_id).is_some_and(|a| a.seq == seq)
    }

    /// `attempt` scopes the update to one attempt; `None` applies to
    /// whichever attempt is running.
    fn set_progress(
        &self,
        job_id: JobId,
        attempt: Option<u64>,
        progress: u8,
        message: Option<&str>,
    ) -> bool {
        let updated = {
            let state = self.lock_dispatch();
            if attempt.is_some_and(|seq| !Self::is_current_attempt(&state, job_id, seq)) {
                return false;
            }
            self.store
                .update(job_id, |job| {
                    if !job.set_progress(progress) {
                        return None;
                    }
                    if let Some(message) = message {
                        job.push_log(LogLevel::Info, message, None);
                    }
                    Some(job.progress)
                })
                .flatten()
        };

        let Some(progress) = updated else {
            return false;
        };
        self.emit(JobEvent::Progress {
            job_id,
            progress,
            status: JobStatus::Running,
            message: message.map(str::to_string),
        });
        true
    }

    fn cleanup(&self) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(self.config.retention())
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
        else {
            return 0;
        };

        let purged = self.store.purge_finished_before(cutoff);
        if !purged.is_empty() {
            info!(count = purged.len(), "removed expired jobs");
        }
        purged.len()
    }
}

impl AttemptFeedback for Inner {
    fn progress(&self, job_id: JobId, attempt: u64, progress: u8, message: Option<&str>) -> bool {
        self.set_progress(job_id, Some(attempt), progress, message)
    }

    fn log(&self, job_id: JobId, attempt: u64, level: LogLevel, message: &str) {
        let state = self.lock_dispatch();
        if !Self::is_current_attempt(&state, job_id, attempt) {
            return;
        }
        if let Err(err) = self.store.record_log(job_id, level, message, None) {
            warn!(%job_id, error = %err, "dropping handler log entry");
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Periodic retention sweep. Also re-runs the pump so nothing stays queued
/// if a wake-up was missed.
async fn maintenance_loop(inner: Weak<Inner>, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.cleanup();
        inner.pump();
    }
    debug!("maintenance loop stopped");
}

fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}
