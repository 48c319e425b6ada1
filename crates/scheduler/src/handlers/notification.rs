//! Notification dispatch.
//!
//! Delivery itself is pluggable through [`NotificationSink`]; the handler
//! fans a job out per recipient and reports progress as it goes.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::{Value as JsonValue, json};

use jobforge_core::{JobPayload, NotificationChannel, NotificationParams};

use crate::context::JobContext;
use crate::registry::JobHandler;

/// Upper bound on recipients for a single job.
pub const MAX_RECIPIENTS: usize = 500;

const PER_RECIPIENT_ESTIMATE: Duration = Duration::from_millis(50);

/// Transport that actually delivers one message.
#[async_trait::async_trait]
pub trait NotificationSink: Send + Sync + 'static {
    async fn deliver(
        &self,
        channel: NotificationChannel,
        recipient: &str,
        subject: &str,
        body: &str,
    ) -> anyhow::Result<()>;
}

/// Sink that only logs. Used when no real transport is wired in.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

#[async_trait::async_trait]
impl NotificationSink for TracingSink {
    async fn deliver(
        &self,
        channel: NotificationChannel,
        recipient: &str,
        subject: &str,
        _body: &str,
    ) -> anyhow::Result<()> {
        tracing::info!(?channel, recipient, subject, "notification delivered");
        Ok(())
    }
}

/// In-memory sink for tests/dev.
#[derive(Debug, Default)]
pub struct InMemorySink {
    delivered: Mutex<Vec<(String, String)>>,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(recipient, subject)` pairs in delivery order.
    pub fn delivered(&self) -> Vec<(String, String)> {
        self.delivered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait::async_trait]
impl NotificationSink for InMemorySink {
    async fn deliver(
        &self,
        _channel: NotificationChannel,
        recipient: &str,
        subject: &str,
        _body: &str,
    ) -> anyhow::Result<()> {
        if !recipient.contains('@') {
            anyhow::bail!("undeliverable address {recipient:?}");
        }
        self.delivered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((recipient.to_string(), subject.to_string()));
        Ok(())
    }
}

pub struct NotificationHandler<S> {
    sink: Arc<S>,
}

impl<S: NotificationSink> NotificationHandler<S> {
    pub fn new(sink: Arc<S>) -> Self {
        Self { sink }
    }
}

#[async_trait::async_trait]
impl<S: NotificationSink> JobHandler for NotificationHandler<S> {
    async fn run(&self, ctx: JobContext) -> anyhow::Result<JsonValue> {
        let JobPayload::NotificationDispatch(NotificationParams {
            recipients,
            subject,
            body,
            channel,
        }) = ctx.payload().clone()
        else {
            anyhow::bail!("notification handler received a {} payload", ctx.job_type());
        };

        let total = recipients.len();
        let mut delivered = 0usize;
        let mut failed = Vec::new();

        for (i, recipient) in recipients.iter().enumerate() {
            if ctx.is_cancelled() {
                anyhow::bail!("dispatch interrupted after {delivered} of {total} recipients");
            }

            match self.sink.deliver(channel, recipient, &subject, &body).await {
                Ok(()) => delivered += 1,
                Err(err) => {
                    ctx.warn(format!("delivery to {recipient} failed: {err:#}"));
                    failed.push(recipient.clone());
                }
            }

            let pct = ((i + 1) * 100 / total).min(99) as u8;
            let note = format!("{}/{total} processed", i + 1);
            ctx.update_progress(pct, Some(note.as_str()));
        }

        if delivered == 0 {
            anyhow::bail!("no recipient could be reached ({total} attempted)");
        }

        ctx.info(format!("delivered {delivered}/{total} notifications"));
        Ok(json!({ "delivered": delivered, "failed": failed }))
    }

    fn validate(&self, payload: &JobPayload) -> Result<(), String> {
        match payload {
            JobPayload::NotificationDispatch(p) if p.recipients.len() > MAX_RECIPIENTS => Err(
                format!("at most {MAX_RECIPIENTS} recipients per job, got {}", p.recipients.len()),
            ),
            _ => Ok(()),
        }
    }

    fn estimate_duration(&self, payload: &JobPayload) -> Option<Duration> {
        match payload {
            JobPayload::NotificationDispatch(p) => {
                Some(PER_RECIPIENT_ESTIMATE * u32::try_from(p.recipients.len()).ok()?)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobforge_core::{Job, UserId};

    fn dispatch(recipients: &[&str]) -> JobPayload {
        JobPayload::NotificationDispatch(NotificationParams {
            recipients: recipients.iter().map(|r| r.to_string()).collect(),
            subject: "Your export is ready".to_string(),
            body: String::new(),
            channel: NotificationChannel::Email,
        })
    }

    #[tokio::test]
    async fn partial_delivery_reports_failures() {
        let sink = Arc::new(InMemorySink::new());
        let handler = NotificationHandler::new(sink.clone());
        let job = Job::new("notify", dispatch(&["a@x.io", "broken", "b@x.io"]), UserId::system());

        let output = handler.run(JobContext::detached(&job)).await.unwrap();

        assert_eq!(output, json!({ "delivered": 2, "failed": ["broken"] }));
        assert_eq!(sink.delivered().len(), 2);
    }

    #[tokio::test]
    async fn total_failure_is_an_error() {
        let handler = NotificationHandler::new(Arc::new(InMemorySink::new()));
        let job = Job::new("notify", dispatch(&["nobody"]), UserId::system());

        let err = handler.run(JobContext::detached(&job)).await.unwrap_err();
        assert!(err.to_string().contains("no recipient could be reached"));
    }

    #[test]
    fn too_many_recipients_is_rejected() {
        let handler = NotificationHandler::new(Arc::new(TracingSink));
        let many: Vec<String> = (0..=MAX_RECIPIENTS).map(|i| format!("u{i}@x.io")).collect();
        let refs: Vec<&str> = many.iter().map(String::as_str).collect();

        assert!(handler.validate(&dispatch(&refs)).is_err());
        assert!(handler.validate(&dispatch(&refs[..10])).is_ok());
        assert_eq!(
            handler.estimate_duration(&dispatch(&refs[..10])),
            Some(Duration::from_millis(500))
        );
    }
}
