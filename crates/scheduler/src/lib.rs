//! In-process background job scheduler.
//!
//! ## Design
//!
//! - Jobs are typed (one payload variant per job type) and prioritised
//! - A bounded number of attempts run concurrently as tokio tasks
//! - Each attempt races its handler against a timeout
//! - Failed attempts are retried with backoff up to a per-job budget
//! - Progress and completion are broadcast on an in-memory event bus
//! - Terminal jobs are garbage-collected after a retention window
//!
//! ## Components
//!
//! - `PriorityQueue`: four FIFO buckets, one per priority
//! - `JobStore`: id → job map with filtered listing
//! - `HandlerRegistry`: job type → `JobHandler`
//! - `Scheduler`: dispatch loop, supervision, cancellation, stats

pub mod config;
pub mod context;
pub mod error;
pub mod handlers;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod store;


pub use config::{ConfigError, SchedulerConfig};
pub use context::JobContext;
pub use error::{ExecutionError, SchedulerError};
pub use queue::PriorityQueue;
pub use registry::{FnHandler, HandlerRegistry, JobHandler, handler_fn};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use scheduler::{JobOptions, Scheduler};
pub use store::{JobFilter, JobStore, QueueStats};
