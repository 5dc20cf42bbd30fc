use super::context::{RepeatContext, RepeatSynchronizationManager};
use super::exception::ExceptionHandler;
use super::listener::RepeatListener;
use super::policy::CompletionPolicy;
use super::result_queue::{ResultHolder, ResultHolderQueue};
use super::status::RepeatStatus;
use super::template::{IterationStrategy, RepeatCallback, RepeatCore, RepeatOperations};
use batchflow_core::{BatchResult, TaskExecutor};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Repeat template that hands each iteration to a [`TaskExecutor`].
///
/// Up to `throttle_limit` iterations are in flight at once. Once the
/// completion policy is satisfied no new work is dispatched, but every
/// iteration already running is waited for before `iterate` returns.
#[derive(Clone)]
pub struct TaskExecutorRepeatTemplate {
    core: RepeatCore,
    task_executor: Arc<dyn TaskExecutor>,
    throttle_limit: usize,
}

impl TaskExecutorRepeatTemplate {
    pub const DEFAULT_THROTTLE_LIMIT: usize = 4;

    pub fn new(task_executor: Arc<dyn TaskExecutor>) -> Self {
        Self {
            core: RepeatCore::default(),
            task_executor,
            throttle_limit: Self::DEFAULT_THROTTLE_LIMIT,
        }
    }

    pub fn with_throttle_limit(mut self, throttle_limit: usize) -> Self {
        self.throttle_limit = throttle_limit.max(1);
        self
    }

    pub fn with_completion_policy(mut self, policy: Arc<dyn CompletionPolicy>) -> Self {
        self.core.completion_policy = policy;
        self
    }

    pub fn with_exception_handler(mut self, handler: Arc<dyn ExceptionHandler>) -> Self {
        self.core.exception_handler = handler;
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn RepeatListener>) -> Self {
        self.core.listeners.push(listener);
        self
    }

    pub fn throttle_limit(&self) -> usize {
        self.throttle_limit
    }
}

/// One dispatched iteration. Always reports back to the queue, even when
/// the callback panics.
struct ExecutingRunnable {
    callback: Arc<dyn RepeatCallback>,
    context: Arc<RepeatContext>,
    queue: Arc<ResultHolderQueue>,
}

impl ExecutingRunnable {
    fn run(self) {
        let registered = RepeatSynchronizationManager::get_context().is_none();
        if registered {
            RepeatSynchronizationManager::register(self.context.clone());
        }

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            self.callback.do_in_iteration(&self.context)
        }))
        .unwrap_or_else(|payload| Err(panic_error(payload)));

        if registered {
            RepeatSynchronizationManager::clear();
        }
        if let Err(e) = self.queue.put(ResultHolder::new(result, self.context)) {
            tracing::error!(error = %e, "dropped repeat result");
        }
    }
}

fn panic_error(payload: Box<dyn std::any::Any + Send>) -> anyhow::Error {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    anyhow::anyhow!("repeat callback panicked: {message}")
}

impl IterationStrategy for TaskExecutorRepeatTemplate {
    type State = Arc<ResultHolderQueue>;

    fn create_state(&self) -> BatchResult<Self::State> {
        Ok(Arc::new(ResultHolderQueue::new(self.throttle_limit)))
    }

    fn get_next_result(
        &self,
        context: &Arc<RepeatContext>,
        callback: &Arc<dyn RepeatCallback>,
        queue: &mut Self::State,
    ) -> anyhow::Result<RepeatStatus> {
        loop {
            queue.expect()?;
            let runnable = ExecutingRunnable {
                callback: callback.clone(),
                context: context.clone(),
                queue: queue.clone(),
            };
            if let Err(e) = self.task_executor.execute(Box::new(move || runnable.run())) {
                queue.unexpect();
                return Err(e.into());
            }
            self.core.completion_policy.update(context);

            if !queue.is_empty() || self.core.completion_policy.is_complete(context) {
                break;
            }
        }

        let holder = queue.take()?;
        holder.result
    }

    fn wait_for_results(&self, queue: &mut Self::State) -> (RepeatStatus, Vec<anyhow::Error>) {
        let mut status = RepeatStatus::Continuable;
        let mut errors = Vec::new();
        while queue.is_expecting() {
            match queue.take() {
                Ok(ResultHolder {
                    result: Ok(result),
                    context,
                }) => {
                    status = status.and(result);
                    self.core.after(&context, result);
                }
                Ok(ResultHolder { result: Err(e), .. }) => {
                    status = RepeatStatus::Finished;
                    errors.push(e);
                }
                Err(e) => {
                    errors.push(e.into());
                    break;
                }
            }
        }
        (status, errors)
    }
}

impl RepeatOperations for TaskExecutorRepeatTemplate {
    #[tracing::instrument(level = "debug", skip(self, callback), fields(throttle_limit = self.throttle_limit))]
    fn iterate(&self, callback: Arc<dyn RepeatCallback>) -> BatchResult<RepeatStatus> {
        self.core.execute(callback, self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ThreadPoolTaskExecutor;
    use crate::repeat::policy::SimpleCompletionPolicy;
    use batchflow_core::{BatchError, SyncTaskExecutor};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter_until(limit: usize) -> (Arc<AtomicUsize>, Arc<dyn RepeatCallback>) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let callback: Arc<dyn RepeatCallback> =
            Arc::new(move |_: &Arc<RepeatContext>| -> anyhow::Result<RepeatStatus> {
                let n = seen.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(RepeatStatus::continue_if(n < limit))
            });
        (count, callback)
    }

    #[test]
    fn test_sync_executor_behaves_like_plain_template() {
        let template = TaskExecutorRepeatTemplate::new(Arc::new(SyncTaskExecutor::new()));
        let (count, callback) = counter_until(5);
        assert_eq!(template.iterate(callback).unwrap(), RepeatStatus::Finished);
        assert_eq!(count.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_pool_runs_until_finished() {
        let executor = Arc::new(ThreadPoolTaskExecutor::new(4).unwrap());
        let template = TaskExecutorRepeatTemplate::new(executor).with_throttle_limit(3);
        let (count, callback) = counter_until(20);

        assert_eq!(template.iterate(callback).unwrap(), RepeatStatus::Finished);
        let total = count.load(Ordering::SeqCst);
        assert!(total >= 20, "only {total} iterations ran");
        assert!(total <= 20 + 2 * 3, "{total} iterations overshot the throttle");
    }

    #[test]
    fn test_pool_respects_chunk_policy() {
        let executor = Arc::new(ThreadPoolTaskExecutor::new(4).unwrap());
        let template = TaskExecutorRepeatTemplate::new(executor)
            .with_completion_policy(Arc::new(SimpleCompletionPolicy::new(10)));
        let (count, callback) = counter_until(usize::MAX);

        let status = template.iterate(callback).unwrap();
        assert!(status.is_continuable());
        assert_eq!(count.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_worker_sees_loop_context() {
        let executor = Arc::new(ThreadPoolTaskExecutor::new(2).unwrap());
        let template = TaskExecutorRepeatTemplate::new(executor);
        let matched = Arc::new(AtomicUsize::new(0));
        let seen = matched.clone();
        let callback: Arc<dyn RepeatCallback> =
            Arc::new(move |context: &Arc<RepeatContext>| -> anyhow::Result<RepeatStatus> {
                let current = RepeatSynchronizationManager::get_context();
                if current.is_some_and(|c| Arc::ptr_eq(&c, context)) {
                    seen.fetch_add(1, Ordering::SeqCst);
                }
                Ok(RepeatStatus::Finished)
            });

        template.iterate(callback).unwrap();
        assert!(matched.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn test_panicking_callback_becomes_error() {
        let executor = Arc::new(ThreadPoolTaskExecutor::new(2).unwrap());
        let template = TaskExecutorRepeatTemplate::new(executor).with_throttle_limit(1);
        let callback: Arc<dyn RepeatCallback> =
            Arc::new(|_: &Arc<RepeatContext>| -> anyhow::Result<RepeatStatus> {
                panic!("chunk exploded")
            });

        let err = template.iterate(callback).unwrap_err();
        assert!(matches!(err, BatchError::RepeatFailed(_)));
        assert!(err.to_string().contains("chunk exploded"));
    }

    #[test]
    fn test_rejected_dispatch_is_reported() {
        let executor = Arc::new(ThreadPoolTaskExecutor::new(1).unwrap());
        executor.shutdown();
        let template = TaskExecutorRepeatTemplate::new(executor);
        let (count, callback) = counter_until(3);

        let err = template.iterate(callback).unwrap_err();
        assert!(matches!(err, BatchError::TaskRejected(_)));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
