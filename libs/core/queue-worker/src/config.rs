//! Worker configuration
//!
//! This module provides `WorkerConfig` for configuring a worker pool, either
//! through builder methods or from `QUEUE_WORKER_*` environment variables.

use crate::backoff::Backoff;
use crate::controller::ErrorThreshold;
use crate::error::WorkerError;
use core_config::{ConfigError, FromEnv, env_or_default, env_parse};
use std::time::Duration;

/// Upper bound for the exponential receive backoff loaded from the environment.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Configuration for a worker pool
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    /// Worker name, used in logs and metric labels
    pub name: String,

    /// Number of consumer tasks draining the channel
    pub concurrency: usize,

    /// Capacity of the channel between the retriever and the consumers
    pub channel_capacity: usize,

    /// Shut down after this many counted errors per period (None = never)
    pub error_threshold: Option<ErrorThreshold>,

    /// Delay between a failed receive and the next poll
    pub backoff: Backoff,
}

impl WorkerConfig {
    /// Create a new WorkerConfig with default values
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            concurrency: 1,
            channel_capacity: 1,
            error_threshold: Some(ErrorThreshold::default()),
            backoff: Backoff::None,
        }
    }

    /// Set the number of consumer tasks
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Set the channel capacity
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Set the error threshold (None to only report errors)
    pub fn with_error_threshold(mut self, threshold: Option<ErrorThreshold>) -> Self {
        self.error_threshold = threshold;
        self
    }

    /// Set the receive backoff
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Check the configuration before a run.
    pub fn validate(&self) -> Result<(), WorkerError> {
        if self.name.trim().is_empty() {
            return Err(WorkerError::Config("name must not be empty".to_string()));
        }
        if self.concurrency == 0 {
            return Err(WorkerError::Config(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(WorkerError::Config(
                "channel capacity must be at least 1".to_string(),
            ));
        }
        if let Some(threshold) = self.error_threshold {
            if threshold.max_errors == 0 {
                return Err(WorkerError::Config(
                    "error threshold must allow at least 1 error".to_string(),
                ));
            }
            if threshold.period.is_zero() {
                return Err(WorkerError::Config(
                    "error threshold period must not be zero".to_string(),
                ));
            }
        }
        Ok(())
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::new("queue-worker")
    }
}

impl FromEnv for WorkerConfig {
    /// Load from the environment:
    ///
    /// - `QUEUE_WORKER_NAME` (default `queue-worker`)
    /// - `QUEUE_WORKER_CONCURRENCY` (default 1)
    /// - `QUEUE_WORKER_CHANNEL_CAPACITY` (default 1)
    /// - `QUEUE_WORKER_ERROR_THRESHOLD` (default 3, 0 disables)
    /// - `QUEUE_WORKER_ERROR_PERIOD_SECS` (default 120)
    /// - `QUEUE_WORKER_BACKOFF_MS` (default 0, exponential up to 30s otherwise)
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = ErrorThreshold::default();

        let max_errors = env_parse("QUEUE_WORKER_ERROR_THRESHOLD", defaults.max_errors)?;
        let period_secs =
            env_parse("QUEUE_WORKER_ERROR_PERIOD_SECS", defaults.period.as_secs())?;
        let error_threshold = (max_errors > 0)
            .then(|| ErrorThreshold::new(max_errors, Duration::from_secs(period_secs)));

        let backoff = match env_parse("QUEUE_WORKER_BACKOFF_MS", 0u64)? {
            0 => Backoff::None,
            ms => Backoff::exponential(Duration::from_millis(ms), MAX_BACKOFF),
        };

        let config = Self {
            name: env_or_default("QUEUE_WORKER_NAME", "queue-worker"),
            concurrency: env_parse("QUEUE_WORKER_CONCURRENCY", 1)?,
            channel_capacity: env_parse("QUEUE_WORKER_CHANNEL_CAPACITY", 1)?,
            error_threshold,
            backoff,
        };

        config
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        Ok(config)
    }
}
