//! In-memory job storage.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;

use jobforge_core::{Job, JobError, JobId, JobResult, JobStatus, JobType, LogLevel, UserId};

/// Filter for [`JobStore::list`]. Unset fields match everything; set
/// fields are ANDed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub job_type: Option<JobType>,
    pub created_by: Option<UserId>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_job_type(mut self, job_type: JobType) -> Self {
        self.job_type = Some(job_type);
        self
    }

    pub fn with_created_by(mut self, user: UserId) -> Self {
        self.created_by = Some(user);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.status.is_none_or(|s| job.status == s)
            && self.job_type.is_none_or(|t| job.job_type == t)
            && self.created_by.is_none_or(|u| job.created_by == u)
    }
}

/// Snapshot of job counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub total: usize,
    /// Configured concurrency cap (filled in by the scheduler).
    pub max_concurrent: usize,
}

#[derive(Debug)]
struct StoredJob {
    /// Insertion order; breaks ties between jobs created in the same instant.
    seq: u64,
    job: Job,
}

#[derive(Debug, Default)]
struct StoreInner {
    jobs: HashMap<JobId, StoredJob>,
    next_seq: u64,
}

/// Id → job map shared by the scheduler and its callers.
///
/// Reads hand out clones; all mutation goes through [`JobStore::update`] so
/// a job is never observed half-written.
#[derive(Debug, Default)]
pub struct JobStore {
    inner: RwLock<StoreInner>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, job: Job) -> JobResult<JobId> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.jobs.contains_key(&job.id) {
            return Err(JobError::AlreadyExists(job.id));
        }
        let id = job.id;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.jobs.insert(id, StoredJob { seq, job });
        Ok(id)
    }

    pub fn get(&self, job_id: JobId) -> Option<Job> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.jobs.get(&job_id).map(|s| s.job.clone())
    }

    pub fn contains(&self, job_id: JobId) -> bool {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.jobs.contains_key(&job_id)
    }

    /// Read part of a job without cloning it.
    pub fn view<R>(&self, job_id: JobId, f: impl FnOnce(&Job) -> R) -> Option<R> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.jobs.get(&job_id).map(|s| f(&s.job))
    }

    /// Mutate a job in place. Returns `None` if the job does not exist.
    pub fn update<R>(&self, job_id: JobId, f: impl FnOnce(&mut Job) -> R) -> Option<R> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.jobs.get_mut(&job_id).map(|s| f(&mut s.job))
    }

    /// Jobs matching `filter`, newest first.
    pub fn list(&self, filter: &JobFilter) -> Vec<Job> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut matched: Vec<&StoredJob> = inner
            .jobs
            .values()
            .filter(|s| filter.matches(&s.job))
            .collect();

        matched.sort_by(|a, b| {
            (b.job.created_at, b.seq).cmp(&(a.job.created_at, a.seq))
        });
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }
        matched.into_iter().map(|s| s.job.clone()).collect()
    }

    /// Append to the job's log and mirror the line to `tracing`.
    pub fn record_log(
        &self,
        job_id: JobId,
        level: LogLevel,
        message: impl Into<String>,
        meta: Option<JsonValue>,
    ) -> JobResult<()> {
        let message = message.into();
        let job_type = self
            .update(job_id, |job| {
                job.push_log(level, message.clone(), meta);
                job.job_type
            })
            .ok_or(JobError::NotFound(job_id))?;

        match level {
            LogLevel::Debug => tracing::debug!(%job_id, %job_type, "{message}"),
            LogLevel::Info => tracing::info!(%job_id, %job_type, "{message}"),
            LogLevel::Warn => tracing::warn!(%job_id, %job_type, "{message}"),
            LogLevel::Error => tracing::error!(%job_id, %job_type, "{message}"),
        }
        Ok(())
    }

    pub fn remove(&self, job_id: JobId) -> Option<Job> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.jobs.remove(&job_id).map(|s| s.job)
    }

    /// Delete terminal jobs that finished before `cutoff`; returns their ids.
    pub fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> Vec<JobId> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let expired: Vec<JobId> = inner
            .jobs
            .values()
            .filter(|s| s.job.finished_before(cutoff))
            .map(|s| s.job.id)
            .collect();
        for id in &expired {
            inner.jobs.remove(id);
        }
        expired
    }

    pub fn counts(&self) -> QueueStats {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut stats = QueueStats::default();
        for stored in inner.jobs.values() {
            match stored.job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats.total = inner.jobs.len();
        stats
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
