//! Job type → handler registry.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as JsonValue;

use jobforge_core::{JobError, JobPayload, JobResult, JobType};

use crate::context::JobContext;

/// Executes jobs of one type.
///
/// `run` is raced against the configured timeout and the job's
/// cancellation token; an `Err` counts as a failed attempt and is retried
/// while budget remains. A run that outlives the timeout is dropped at its
/// next await point.
#[async_trait::async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn run(&self, ctx: JobContext) -> anyhow::Result<JsonValue>;

    /// Reject a payload at creation time. The message becomes the
    /// validation error.
    fn validate(&self, _payload: &JobPayload) -> Result<(), String> {
        Ok(())
    }

    /// Advisory duration used to fill in `estimated_completion`.
    fn estimate_duration(&self, _payload: &JobPayload) -> Option<Duration> {
        None
    }
}

type Validator = Box<dyn Fn(&JobPayload) -> Result<(), String> + Send + Sync>;
type Estimator = Box<dyn Fn(&JobPayload) -> Option<Duration> + Send + Sync>;

/// [`JobHandler`] backed by an async closure.
pub struct FnHandler<F> {
    run: F,
    validator: Option<Validator>,
    estimator: Option<Estimator>,
}

/// Wrap an async closure as a handler.
///
/// ```ignore
/// registry.register(JobType::Echo, handler_fn(|ctx| async move {
///     Ok(serde_json::json!({ "title": ctx.title() }))
/// }));
/// ```
pub fn handler_fn<F, Fut>(run: F) -> FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<JsonValue>> + Send + 'static,
{
    FnHandler {
        run,
        validator: None,
        estimator: None,
    }
}

impl<F> FnHandler<F> {
    pub fn with_validator(
        mut self,
        validator: impl Fn(&JobPayload) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        self.validator = Some(Box::new(validator));
        self
    }

    pub fn with_estimator(
        mut self,
        estimator: impl Fn(&JobPayload) -> Option<Duration> + Send + Sync + 'static,
    ) -> Self {
        self.estimator = Some(Box::new(estimator));
        self
    }
}

#[async_trait::async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<JsonValue>> + Send + 'static,
{
    async fn run(&self, ctx: JobContext) -> anyhow::Result<JsonValue> {
        (self.run)(ctx).await
    }

    fn validate(&self, payload: &JobPayload) -> Result<(), String> {
        match &self.validator {
            Some(validator) => validator(payload),
            None => Ok(()),
        }
    }

    fn estimate_duration(&self, payload: &JobPayload) -> Option<Duration> {
        self.estimator.as_ref().and_then(|estimator| estimator(payload))
    }
}

/// Maps each job type to the handler that executes it.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for `job_type`. Returns the handler
    /// it replaced, if any.
    pub fn register<H>(&mut self, job_type: JobType, handler: H) -> Option<Arc<dyn JobHandler>>
    where
        H: JobHandler,
    {
        self.register_arc(job_type, Arc::new(handler))
    }

    pub fn register_arc(
        &mut self,
        job_type: JobType,
        handler: Arc<dyn JobHandler>,
    ) -> Option<Arc<dyn JobHandler>> {
        self.handlers.insert(job_type, handler)
    }

    pub fn unregister(&mut self, job_type: JobType) -> Option<Arc<dyn JobHandler>> {
        self.handlers.remove(&job_type)
    }

    pub fn resolve(&self, job_type: JobType) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&job_type).cloned()
    }

    pub fn contains(&self, job_type: JobType) -> bool {
        self.handlers.contains_key(&job_type)
    }

    /// Registered types in a stable order.
    pub fn registered_types(&self) -> Vec<JobType> {
        let mut types: Vec<JobType> = self.handlers.keys().copied().collect();
        types.sort();
        types
    }

    /// Creation-time checks: payload structure, then a registered handler,
    /// then the handler's own validator.
    pub fn validate(&self, payload: &JobPayload) -> JobResult<()> {
        payload.validate()?;
        let job_type = payload.job_type();
        let handler = self
            .handlers
            .get(&job_type)
            .ok_or_else(|| JobError::unknown_type(job_type.as_str()))?;
        handler.validate(payload).map_err(JobError::Validation)
    }

    pub fn estimate_duration(&self, payload: &JobPayload) -> Option<Duration> {
        self.handlers
            .get(&payload.job_type())
            .and_then(|h| h.estimate_duration(payload))
    }
}

impl core::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("types", &self.registered_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use jobforge_core::{DataExportParams, ExportFormat, Job, UserId};

    fn export(study_id: &str) -> JobPayload {
        JobPayload::DataExport(DataExportParams {
            study_id: study_id.to_string(),
            format: ExportFormat::Json,
            include_responses: true,
        })
    }

    #[test]
    fn unregistered_type_is_rejected() {
        let registry = HandlerRegistry::new();
        assert_eq!(
            registry.validate(&JobPayload::echo("x")),
            Err(JobError::UnknownJobType("echo".to_string()))
        );
    }

    #[test]
    fn structural_checks_run_before_lookup() {
        let registry = HandlerRegistry::new();
        assert!(matches!(
            registry.validate(&export("  ")),
            Err(JobError::Validation(_))
        ));
    }

    #[test]
    fn handler_validator_and_estimator_are_consulted() {
        let mut registry = HandlerRegistry::new();
        registry.register(
            JobType::DataExport,
            handler_fn(|_ctx| async { anyhow::Ok(JsonValue::Null) })
                .with_validator(|payload| match payload {
                    JobPayload::DataExport(p) if p.study_id.starts_with("s-") => Ok(()),
                    _ => Err("study ids start with s-".to_string()),
                })
                .with_estimator(|_| Some(Duration::from_secs(90))),
        );

        assert!(registry.validate(&export("s-42")).is_ok());
        assert_eq!(
            registry.validate(&export("42")),
            Err(JobError::Validation("study ids start with s-".to_string()))
        );
        assert_eq!(
            registry.estimate_duration(&export("s-42")),
            Some(Duration::from_secs(90))
        );
        assert_eq!(registry.estimate_duration(&JobPayload::echo("x")), None);
    }

    #[test]
    fn registration_overwrites() {
        let mut registry = HandlerRegistry::new();
        let first = registry.register(
            JobType::Echo,
            handler_fn(|_ctx| async { anyhow::Ok(json!(1)) }),
        );
        assert!(first.is_none());

        let replaced = registry.register(
            JobType::Echo,
            handler_fn(|_ctx| async { anyhow::Ok(json!(2)) }),
        );
        assert!(replaced.is_some());
        assert_eq!(registry.registered_types(), vec![JobType::Echo]);

        assert!(registry.unregister(JobType::Echo).is_some());
        assert!(!registry.contains(JobType::Echo));
    }

    #[tokio::test]
    async fn resolved_handler_runs() {
        let mut registry = HandlerRegistry::new();
        registry.register(
            JobType::Echo,
            handler_fn(|ctx| async move { anyhow::Ok(json!({ "title": ctx.title() })) }),
        );

        let job = Job::new("hello", JobPayload::echo("x"), UserId::system());
        let handler = registry.resolve(JobType::Echo).unwrap();
        let output = handler.run(JobContext::detached(&job)).await.unwrap();
        assert_eq!(output, json!({ "title": "hello" }));
    }
}
