use crate::error::BatchResult;

/// A unit of work handed to a [`TaskExecutor`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs tasks either inline or on other threads.
pub trait TaskExecutor: Send + Sync {
    fn execute(&self, task: Task) -> BatchResult<()>;
}

/// Runs every task on the calling thread before returning.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncTaskExecutor;

impl SyncTaskExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl TaskExecutor for SyncTaskExecutor {
    fn execute(&self, task: Task) -> BatchResult<()> {
        task();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_sync_executor_runs_inline() {
        let counter = Arc::new(AtomicUsize::new(0));
        let executor = SyncTaskExecutor::new();
        let c = counter.clone();
        executor
            .execute(Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
