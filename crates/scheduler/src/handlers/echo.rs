//! Diagnostic handler that returns its message after an optional delay.

use std::time::Duration;

use serde_json::{Value as JsonValue, json};

use jobforge_core::{EchoParams, JobPayload};

use crate::context::JobContext;
use crate::registry::JobHandler;

const STEPS: u32 = 4;

#[derive(Debug, Default, Clone, Copy)]
pub struct EchoHandler;

#[async_trait::async_trait]
impl JobHandler for EchoHandler {
    async fn run(&self, ctx: JobContext) -> anyhow::Result<JsonValue> {
        let JobPayload::Echo(EchoParams { message, delay_ms }) = ctx.payload().clone() else {
            anyhow::bail!("echo handler received a {} payload", ctx.job_type());
        };

        let step = Duration::from_millis(delay_ms) / STEPS;
        for i in 1..=STEPS {
            tokio::select! {
                _ = ctx.cancelled() => anyhow::bail!("echo interrupted at step {i}"),
                _ = tokio::time::sleep(step) => {}
            }
            if i < STEPS {
                ctx.update_progress((i * 100 / STEPS) as u8, None);
            }
        }

        Ok(json!({ "message": message, "attempt": ctx.attempt() }))
    }

    fn estimate_duration(&self, payload: &JobPayload) -> Option<Duration> {
        match payload {
            JobPayload::Echo(p) => Some(Duration::from_millis(p.delay_ms)),
            _ => None,
        }
    }
}
