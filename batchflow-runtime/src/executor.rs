//! Task executors backed by a tokio runtime.

use batchflow_core::{BatchError, BatchResult, Task, TaskExecutor};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::runtime::{Builder, Handle, Runtime};

/// Settings for [`ThreadPoolTaskExecutor`].
#[derive(Debug, Clone)]
pub struct ThreadPoolConfig {
    /// Maximum number of tasks running at once.
    pub pool_size: usize,
    pub thread_name_prefix: String,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            thread_name_prefix: "batch-worker".to_string(),
        }
    }
}

/// Runs tasks on the blocking pool of a dedicated tokio runtime.
///
/// Tasks beyond `pool_size` queue inside the runtime until a thread frees
/// up. After [`shutdown`](Self::shutdown) new tasks are rejected.
pub struct ThreadPoolTaskExecutor {
    runtime: Option<Runtime>,
    handle: Handle,
    config: ThreadPoolConfig,
    active: Arc<AtomicUsize>,
    shutdown: AtomicBool,
}

impl ThreadPoolTaskExecutor {
    pub fn new(pool_size: usize) -> BatchResult<Self> {
        Self::with_config(ThreadPoolConfig {
            pool_size,
            ..ThreadPoolConfig::default()
        })
    }

    pub fn with_config(config: ThreadPoolConfig) -> BatchResult<Self> {
        let pool_size = config.pool_size.max(1);
        let prefix = config.thread_name_prefix.clone();
        let counter = AtomicUsize::new(0);
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(pool_size)
            .thread_name_fn(move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                format!("{prefix}-{n}")
            })
            .build()
            .map_err(|e| BatchError::Other(anyhow::Error::new(e).context("failed to build task executor runtime")))?;

        tracing::debug!(pool_size, prefix = %config.thread_name_prefix, "thread pool task executor started");
        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Some(runtime),
            config: ThreadPoolConfig { pool_size, ..config },
            active: Arc::new(AtomicUsize::new(0)),
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn pool_size(&self) -> usize {
        self.config.pool_size
    }

    /// Number of tasks currently running.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Stops accepting tasks. Tasks already submitted still run.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl TaskExecutor for ThreadPoolTaskExecutor {
    fn execute(&self, task: Task) -> BatchResult<()> {
        if self.is_shutdown() {
            return Err(BatchError::TaskRejected(format!(
                "executor '{}' is shut down",
                self.config.thread_name_prefix
            )));
        }
        let active = self.active.clone();
        self.handle.spawn_blocking(move || {
            active.fetch_add(1, Ordering::SeqCst);
            let _guard = ActiveGuard(active);
            task();
        });
        Ok(())
    }
}

impl Drop for ThreadPoolTaskExecutor {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl std::fmt::Debug for ThreadPoolTaskExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPoolTaskExecutor")
            .field("pool_size", &self.config.pool_size)
            .field("active", &self.active_count())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}
