//! Configuration types.

use std::time::Duration;

use crate::error::ConfigError;

/// Knobs for a pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Buffer capacity of every inter-stage queue. 0 means synchronous handoff.
    pub queue_capacity: usize,
    /// Maximum number of users per `fetch_messages` call.
    pub max_batch_size: usize,
    /// Concurrent spam-classification workers.
    pub worker_count: usize,
    /// Concurrent user-resolution workers in the dedup stage.
    pub resolver_workers: usize,
    /// Upper bound on any single external call. `None` waits forever.
    pub call_timeout: Option<Duration>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10,
            max_batch_size: 2,
            worker_count: 5,
            resolver_workers: 5,
            call_timeout: None,
        }
    }
}

impl PipelineConfig {
    /// Build config from environment variables, falling back to defaults
    /// for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup. `from_env` delegates here.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let config = Self {
            queue_capacity: parse_or(&lookup, "PIPELINE_QUEUE_CAPACITY", defaults.queue_capacity)?,
            max_batch_size: parse_or(&lookup, "PIPELINE_MAX_BATCH_SIZE", defaults.max_batch_size)?,
            worker_count: parse_or(&lookup, "PIPELINE_WORKER_COUNT", defaults.worker_count)?,
            resolver_workers: parse_or(
                &lookup,
                "PIPELINE_RESOLVER_WORKERS",
                defaults.resolver_workers,
            )?,
            call_timeout: match lookup("PIPELINE_CALL_TIMEOUT_MS") {
                Some(raw) => Some(Duration::from_millis(parse_value(
                    "PIPELINE_CALL_TIMEOUT_MS",
                    &raw,
                )?)),
                None => defaults.call_timeout,
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would stall or make no progress.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (key, value) in [
            ("max_batch_size", self.max_batch_size),
            ("worker_count", self.worker_count),
            ("resolver_workers", self.resolver_workers),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: "must be at least 1".to_string(),
                });
            }
        }

        if self.call_timeout == Some(Duration::ZERO) {
            return Err(ConfigError::InvalidValue {
                key: "call_timeout".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        Ok(())
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{raw:?}: {e}"),
        })
}
