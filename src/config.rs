use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_workers() -> usize {
    1
}

fn default_max_batch() -> usize {
    64
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_fetch_timeout_ms() -> u64 {
    100
}

/// Construction parameters of a pipeline stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageConfig {
    /// Process-wide unique stage name
    pub name: String,
    /// Number of worker threads, fixed for the stage's lifetime
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Maximum number of events a worker handles per iteration
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,
    /// Capacity of each input queue built by [`crate::QueueSet::from_config`]
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// How long a fetch helper blocks before reporting no work
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
}

impl StageConfig {
    /// Create a config with default sizes
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            workers: default_workers(),
            max_batch: default_max_batch(),
            queue_capacity: default_queue_capacity(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
        }
    }

    /// Fetch timeout as a duration
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    /// Check the create-time preconditions
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(PipelineError::InvalidArgs("stage name is empty".into()));
        }
        if self.workers == 0 {
            return Err(PipelineError::InvalidArgs("worker count must be > 0".into()));
        }
        if self.max_batch == 0 {
            return Err(PipelineError::InvalidArgs("max batch size must be > 0".into()));
        }
        if self.queue_capacity == 0 {
            return Err(PipelineError::InvalidArgs("queue capacity must be > 0".into()));
        }
        Ok(())
    }
}

/// Fluent builder for [`StageConfig`]
#[derive(Debug, Clone)]
pub struct StageBuilder {
    config: StageConfig,
}

impl StageBuilder {
    /// Start a builder for the named stage
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            config: StageConfig::new(name),
        }
    }

    /// Set the worker count
    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    /// Set the per-iteration batch size
    pub fn max_batch(mut self, max_batch: usize) -> Self {
        self.config.max_batch = max_batch;
        self
    }

    /// Set the input queue capacity
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    /// Set the fetch timeout
    pub fn fetch_timeout(mut self, timeout: Duration) -> Self {
        self.config.fetch_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Validate and return the config
    pub fn build(self) -> Result<StageConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
