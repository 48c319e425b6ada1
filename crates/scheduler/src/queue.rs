//! Pending-job queue ordered by priority, then arrival.

use std::collections::VecDeque;

use jobforge_core::{JobId, JobPriority};

/// Logical priority queue built from one FIFO bucket per priority class.
///
/// Appending to a bucket is the same as inserting before the first entry of
/// strictly lower priority, so ties keep arrival order without comparisons.
#[derive(Debug, Default, Clone)]
pub struct PriorityQueue {
    buckets: [VecDeque<JobId>; 4],
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, job_id: JobId, priority: JobPriority) {
        self.buckets[priority.rank()].push_back(job_id);
    }

    /// Remove and return the highest-priority, earliest-arrived job.
    pub fn dequeue_next(&mut self) -> Option<JobId> {
        self.buckets.iter_mut().find_map(VecDeque::pop_front)
    }

    pub fn peek_next(&self) -> Option<JobId> {
        self.buckets.iter().find_map(|b| b.front().copied())
    }

    /// Remove a job wherever it sits. Returns `false` if it was not queued.
    pub fn remove(&mut self, job_id: JobId) -> bool {
        for bucket in &mut self.buckets {
            if let Some(pos) = bucket.iter().position(|id| *id == job_id) {
                bucket.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn contains(&self, job_id: JobId) -> bool {
        self.iter().any(|id| id == job_id)
    }

    /// Zero-based position in dispatch order.
    pub fn position(&self, job_id: JobId) -> Option<usize> {
        self.iter().position(|id| id == job_id)
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(VecDeque::is_empty)
    }

    pub fn len_of(&self, priority: JobPriority) -> usize {
        self.buckets[priority.rank()].len()
    }

    /// Queued ids in dispatch order.
    pub fn iter(&self) -> impl Iterator<Item = JobId> + '_ {
        self.buckets.iter().flat_map(|b| b.iter().copied())
    }
}
