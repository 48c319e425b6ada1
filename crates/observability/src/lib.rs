//! Process-wide tracing setup shared by every jobforge binary.

/// Initialize process-wide observability (tracing/logging).
///
/// Output format comes from `JOBFORGE_LOG_FORMAT` (`json` or `pretty`,
/// default `json`); filtering from `RUST_LOG` (default `info`).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    let format = match std::env::var("JOBFORGE_LOG_FORMAT") {
        Ok(raw) => raw.parse().unwrap_or_else(|err| {
            eprintln!("{err}; falling back to json logs");
            tracing::LogFormat::Json
        }),
        Err(_) => tracing::LogFormat::Json,
    };
    tracing::init_with(format);
}

/// Subscriber configuration (format, filters).
pub mod tracing;

pub use self::tracing::LogFormat;
