use crate::core::{IndexError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Retry behavior of a workflow queue handler when a batch fails.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkflowRetryPolicy {
    /// Attempts per batch before the queue is parked until the next append.
    pub max_attempts: u32,
    /// Initial backoff duration in milliseconds.
    pub initial_backoff_ms: u64,
    /// Maximum backoff duration in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for WorkflowRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 5,
            max_backoff_ms: 250,
        }
    }
}

impl WorkflowRetryPolicy {
    /// Exponential backoff for the given 1-based attempt, capped at
    /// `max_backoff_ms`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let base = self.initial_backoff_ms.max(1);
        let max = self.max_backoff_ms.max(base);
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(base.saturating_mul(factor).min(max))
    }
}

/// Top-level indexing configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexingConfig {
    /// Workflow queues per indexed interface on each silo.
    pub queues_per_interface: u32,
    /// Keys per bucket before a chained bucket is created.
    pub default_bucket_capacity: usize,
    #[serde(default)]
    pub retry: WorkflowRetryPolicy,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            queues_per_interface: 4,
            default_bucket_capacity: 1024,
            retry: WorkflowRetryPolicy::default(),
        }
    }
}

impl IndexingConfig {
    pub fn with_queues_per_interface(mut self, queues: u32) -> Self {
        self.queues_per_interface = queues;
        self
    }

    pub fn with_default_bucket_capacity(mut self, capacity: usize) -> Self {
        self.default_bucket_capacity = capacity;
        self
    }

    pub fn with_retry(mut self, retry: WorkflowRetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// # Errors
    ///
    /// Returns `IndexError::Configuration` for values that cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.queues_per_interface == 0 {
            return Err(IndexError::Configuration(
                "queues_per_interface must be at least 1".to_string(),
            ));
        }
        if self.default_bucket_capacity == 0 {
            return Err(IndexError::Configuration(
                "default_bucket_capacity must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(IndexError::Configuration(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw).map_err(|err| {
            IndexError::Configuration(format!("parse indexing config: {}", err))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await.map_err(|err| {
            IndexError::Configuration(format!(
                "Failed to read indexing config '{}': {}",
                path.display(),
                err
            ))
        })?;
        Self::from_json_str(&raw)
    }
}
