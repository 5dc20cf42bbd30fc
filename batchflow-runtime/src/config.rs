//! Runtime configuration loaded from YAML or JSON.

use crate::executor::{ThreadPoolConfig, ThreadPoolTaskExecutor};
use crate::repeat::{
    RepeatOperations, RepeatTemplate, SimpleCompletionPolicy, TaskExecutorRepeatTemplate,
};
use anyhow::{Context, Result};
use batchflow_core::{BatchResult, SyncTaskExecutor, TaskExecutor};
use batchflow_logger::{Logger, LoggingConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub task_executor: TaskExecutorConfig,
    pub repeat: RepeatConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskExecutorKind {
    /// Run tasks on the calling thread.
    #[default]
    Sync,
    /// Run tasks on a bounded thread pool.
    Pool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskExecutorConfig {
    pub kind: TaskExecutorKind,
    pub pool_size: usize,
    pub thread_name_prefix: String,
}

impl Default for TaskExecutorConfig {
    fn default() -> Self {
        let pool = ThreadPoolConfig::default();
        Self {
            kind: TaskExecutorKind::Sync,
            pool_size: pool.pool_size,
            thread_name_prefix: pool.thread_name_prefix,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepeatConfig {
    /// Most callbacks in flight at once in a concurrent repeat loop.
    pub throttle_limit: usize,
    /// Iterations per chunk.
    pub chunk_size: usize,
}

impl Default for RepeatConfig {
    fn default() -> Self {
        Self {
            throttle_limit: TaskExecutorRepeatTemplate::DEFAULT_THROTTLE_LIMIT,
            chunk_size: 5,
        }
    }
}

impl BatchConfig {
    /// Builds the configured task executor.
    pub fn task_executor(&self) -> BatchResult<Arc<dyn TaskExecutor>> {
        match self.task_executor.kind {
            TaskExecutorKind::Sync => Ok(Arc::new(SyncTaskExecutor::new())),
            TaskExecutorKind::Pool => {
                let executor = ThreadPoolTaskExecutor::with_config(ThreadPoolConfig {
                    pool_size: self.task_executor.pool_size,
                    thread_name_prefix: self.task_executor.thread_name_prefix.clone(),
                })?;
                Ok(Arc::new(executor))
            }
        }
    }

    /// Repeat operations for the chunks of a step: sequential for a
    /// synchronous executor, throttled and concurrent for a pool.
    pub fn step_operations(&self) -> BatchResult<Arc<dyn RepeatOperations>> {
        match self.task_executor.kind {
            TaskExecutorKind::Sync => Ok(Arc::new(RepeatTemplate::new())),
            TaskExecutorKind::Pool => Ok(Arc::new(
                TaskExecutorRepeatTemplate::new(self.task_executor()?)
                    .with_throttle_limit(self.repeat.throttle_limit),
            )),
        }
    }

    /// Completion policy that ends a loop after `chunk_size` iterations.
    pub fn chunk_completion_policy(&self) -> Arc<SimpleCompletionPolicy> {
        Arc::new(SimpleCompletionPolicy::new(self.repeat.chunk_size))
    }

    /// Installs the global tracing subscriber described by `logging`.
    pub fn init_logging(&self) -> Result<()> {
        Logger::init_from_config(&self.logging)
    }
}

/// Loads and validates [`BatchConfig`].
pub struct ConfigLoader;

impl ConfigLoader {
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<BatchConfig> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read YAML file: {:?}", path.as_ref()))?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<BatchConfig> {
        let config: BatchConfig =
            serde_yaml::from_str(content).with_context(|| "Failed to parse YAML content")?;
        Self::validate(&config)?;
        Ok(config)
    }

    pub fn from_json_str(content: &str) -> Result<BatchConfig> {
        let config: BatchConfig =
            serde_json::from_str(content).with_context(|| "Failed to parse JSON content")?;
        Self::validate(&config)?;
        Ok(config)
    }

    pub fn to_yaml_string(config: &BatchConfig) -> Result<String> {
        serde_yaml::to_string(config).with_context(|| "Failed to serialize config to YAML")
    }

    pub fn validate(config: &BatchConfig) -> Result<()> {
        if config.task_executor.pool_size == 0 {
            return Err(anyhow::anyhow!("task_executor.pool_size must be greater than 0"));
        }
        if config.repeat.throttle_limit == 0 {
            return Err(anyhow::anyhow!("repeat.throttle_limit must be greater than 0"));
        }
        if config.repeat.chunk_size == 0 {
            return Err(anyhow::anyhow!("repeat.chunk_size must be greater than 0"));
        }
        Ok(())
    }
}
