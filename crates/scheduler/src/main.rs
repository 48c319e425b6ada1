use std::time::Duration;

use anyhow::Context as _;

use jobforge_core::{EchoParams, JobPayload, JobPriority};
use jobforge_scheduler::handlers::register_defaults;
use jobforge_scheduler::{HandlerRegistry, JobOptions, QueueStats, Scheduler, SchedulerConfig};

const DEFAULT_DEMO_JOBS: usize = 5;
const DEMO_DELAY_MS: u64 = 200;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    jobforge_observability::init();

    let config = SchedulerConfig::from_env().context("invalid scheduler configuration")?;
    let demo_jobs = match std::env::var("JOBFORGE_DEMO_JOBS") {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid JOBFORGE_DEMO_JOBS: {raw:?}"))?,
        Err(_) => DEFAULT_DEMO_JOBS,
    };

    let mut registry = HandlerRegistry::new();
    register_defaults(&mut registry);
    let scheduler =
        Scheduler::with_registry(config, registry).context("failed to start scheduler")?;

    let stats = run_demo(&scheduler, demo_jobs, DEMO_DELAY_MS).await?;
    tracing::info!(
        completed = stats.completed,
        failed = stats.failed,
        cancelled = stats.cancelled,
        "all demo jobs finished"
    );

    scheduler.shutdown();
    Ok(())
}

/// Submit `count` echo jobs (the last one at high priority) and wait until
/// every one of them has reported completion.
async fn run_demo(scheduler: &Scheduler, count: usize, delay_ms: u64) -> anyhow::Result<QueueStats> {
    let events = scheduler.subscribe();

    let mut pending = Vec::with_capacity(count);
    for n in 1..=count {
        let priority = if n == count {
            JobPriority::High
        } else {
            JobPriority::Normal
        };
        let payload =
            JobPayload::Echo(EchoParams::new(format!("demo job {n}")).with_delay_ms(delay_ms));
        let job_id = scheduler.create_job(
            format!("Demo {n}"),
            payload,
            JobOptions::new().with_priority(priority),
        )?;
        pending.push(job_id);
    }
    tracing::info!(jobs = count, "demo jobs submitted");

    while !pending.is_empty() {
        for event in events.drain() {
            tracing::info!(
                job_id = %event.job_id(),
                status = %event.status(),
                completion = event.is_completion(),
                "job event"
            );
            if event.is_completion() {
                pending.retain(|id| *id != event.job_id());
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    Ok(scheduler.get_queue_stats())
}
