//! Built-in handlers.

pub mod echo;
pub mod notification;

use std::sync::Arc;

use jobforge_core::JobType;

use crate::registry::HandlerRegistry;

pub use echo::EchoHandler;
pub use notification::{InMemorySink, NotificationHandler, NotificationSink, TracingSink};

/// Register the handlers that need no external wiring: `echo` and
/// `notification_dispatch` (logging sink).
///
/// `study_creation` and `data_export` do real work against the host
/// application, so they get no default. Until the embedding application
/// registers handlers for them, creating such a job fails with
/// `JobError::UnknownJobType`.
pub fn register_defaults(registry: &mut HandlerRegistry) {
    registry.register(JobType::Echo, EchoHandler);
    registry.register(
        JobType::NotificationDispatch,
        NotificationHandler::new(Arc::new(TracingSink)),
    );
}
