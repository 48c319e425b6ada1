//! Scheduler configuration.
//!
//! Fixed at construction. Values can come from code (`with_*` builders),
//! from any serde source (camelCase keys) or from `JOBFORGE_*` environment
//! variables via [`SchedulerConfig::from_env`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::{BackoffStrategy, RetryPolicy};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },

    #[error("{0} must be greater than zero")]
    MustBePositive(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulerConfig {
    /// Upper bound on simultaneously running jobs
    pub max_concurrent_jobs: usize,
    /// Retry ceiling for jobs that don't override it
    pub max_retries: u32,
    pub retry_delay_base_ms: u64,
    /// Wall-clock limit per handler attempt
    pub job_timeout_ms: u64,
    pub cleanup_interval_ms: u64,
    /// Age (from completion) after which terminal jobs are purged
    pub retention_ms: u64,
    pub backoff: BackoffStrategy,
    pub max_retry_delay_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 3,
            max_retries: 3,
            retry_delay_base_ms: 1_000,
            job_timeout_ms: 5 * 60 * 1_000,
            cleanup_interval_ms: 60 * 60 * 1_000,
            retention_ms: 24 * 60 * 60 * 1_000,
            backoff: BackoffStrategy::Linear,
            max_retry_delay_ms: 60_000,
        }
    }
}

impl SchedulerConfig {
    pub fn with_max_concurrent_jobs(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = max;
        self
    }

    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    pub fn with_retry_delay_base(mut self, delay: Duration) -> Self {
        self.retry_delay_base_ms = millis(delay);
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout_ms = millis(timeout);
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval_ms = millis(interval);
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention_ms = millis(retention);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.retry_delay_base_ms),
            max_delay: Duration::from_millis(self.max_retry_delay_ms),
            strategy: self.backoff,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_jobs == 0 {
            return Err(ConfigError::MustBePositive("maxConcurrentJobs"));
        }
        if self.max_retries == 0 {
            return Err(ConfigError::MustBePositive("maxRetries"));
        }
        if self.job_timeout_ms == 0 {
            return Err(ConfigError::MustBePositive("jobTimeoutMs"));
        }
        if self.cleanup_interval_ms == 0 {
            return Err(ConfigError::MustBePositive("cleanupIntervalMs"));
        }
        Ok(())
    }

    /// Defaults overridden by `JOBFORGE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each
    /// `JOBFORGE_*` key.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = read(&lookup, "JOBFORGE_MAX_CONCURRENT_JOBS")? {
            config.max_concurrent_jobs = v;
        }
        if let Some(v) = read(&lookup, "JOBFORGE_MAX_RETRIES")? {
            config.max_retries = v;
        }
        if let Some(v) = read(&lookup, "JOBFORGE_RETRY_DELAY_BASE_MS")? {
            config.retry_delay_base_ms = v;
        }
        if let Some(v) = read(&lookup, "JOBFORGE_JOB_TIMEOUT_MS")? {
            config.job_timeout_ms = v;
        }
        if let Some(v) = read(&lookup, "JOBFORGE_CLEANUP_INTERVAL_MS")? {
            config.cleanup_interval_ms = v;
        }
        if let Some(v) = read(&lookup, "JOBFORGE_RETENTION_MS")? {
            config.retention_ms = v;
        }
        if let Some(v) = read(&lookup, "JOBFORGE_BACKOFF")? {
            config.backoff = v;
        }
        if let Some(v) = read(&lookup, "JOBFORGE_MAX_RETRY_DELAY_MS")? {
            config.max_retry_delay_ms = v;
        }

        config.validate()?;
        Ok(config)
    }
}

fn read<F, T>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: core::str::FromStr,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { key, value: raw }),
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = SchedulerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_concurrent_jobs, 3);
        assert_eq!(config.retention(), Duration::from_secs(24 * 60 * 60));
    }

    #[test]
    fn environment_overrides_defaults() {
        let config = SchedulerConfig::from_lookup(lookup_from(&[
            ("JOBFORGE_MAX_CONCURRENT_JOBS", "8"),
            ("JOBFORGE_JOB_TIMEOUT_MS", " 2500 "),
            ("JOBFORGE_BACKOFF", "exponential"),
        ]))
        .unwrap();

        assert_eq!(config.max_concurrent_jobs, 8);
        assert_eq!(config.job_timeout(), Duration::from_millis(2500));
        assert_eq!(config.backoff, BackoffStrategy::Exponential);
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn unparsable_values_are_reported_with_their_key() {
        let err = SchedulerConfig::from_lookup(lookup_from(&[("JOBFORGE_MAX_RETRIES", "many")]))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                key: "JOBFORGE_MAX_RETRIES",
                value: "many".to_string()
            }
        );
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let err = SchedulerConfig::from_lookup(lookup_from(&[(
            "JOBFORGE_MAX_CONCURRENT_JOBS",
            "0",
        )]))
        .unwrap_err();
        assert_eq!(err, ConfigError::MustBePositive("maxConcurrentJobs"));
    }

    #[test]
    fn deserializes_camel_case_with_defaults() {
        let config: SchedulerConfig = serde_json::from_value(serde_json::json!({
            "maxConcurrentJobs": 2,
            "retryDelayBaseMs": 250,
            "backoff": "fixed"
        }))
        .unwrap();

        assert_eq!(config.max_concurrent_jobs, 2);
        assert_eq!(config.retry_delay_base_ms, 250);
        assert_eq!(config.job_timeout_ms, SchedulerConfig::default().job_timeout_ms);
        assert_eq!(
            config.retry_policy(),
            RetryPolicy::fixed(Duration::from_millis(250)).with_cap(Duration::from_secs(60))
        );
    }
}
