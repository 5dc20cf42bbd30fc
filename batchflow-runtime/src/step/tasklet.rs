//! Tasklet steps: a step whose work is one tasklet called once per chunk
//! until it reports that it is finished.

use crate::repeat::{RepeatCallback, RepeatContext, RepeatOperations, RepeatStatus, RepeatTemplate};
use batchflow_core::{
    step_synchronization_manager, BatchError, BatchResult, BatchStatus, CompositeStepExecutionListener,
    ExitStatus, JobRepository, ScopeAttributes, SharedStepExecution, Step, StepContext,
    StepContribution, StepExecutionListener, StepSynchronizationManager,
};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Work done by a [`TaskletStep`], one call per chunk.
pub trait Tasklet: Send + Sync {
    fn execute(
        &self,
        contribution: &mut StepContribution,
        chunk_context: &ChunkContext,
    ) -> anyhow::Result<RepeatStatus>;

    /// Called when an operator stops the running step.
    fn stop(&self) {}
}

/// Adapts a closure into a [`Tasklet`].
pub struct FnTasklet<F> {
    f: F,
}

impl<F> FnTasklet<F>
where
    F: Fn(&mut StepContribution, &ChunkContext) -> anyhow::Result<RepeatStatus> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> Tasklet for FnTasklet<F>
where
    F: Fn(&mut StepContribution, &ChunkContext) -> anyhow::Result<RepeatStatus> + Send + Sync,
{
    fn execute(
        &self,
        contribution: &mut StepContribution,
        chunk_context: &ChunkContext,
    ) -> anyhow::Result<RepeatStatus> {
        (self.f)(contribution, chunk_context)
    }
}

/// State carried between the chunks of a step until it is marked complete.
pub struct ChunkContext {
    step_context: Arc<StepContext>,
    complete: AtomicBool,
    attributes: ScopeAttributes,
}

impl ChunkContext {
    pub fn new(step_context: Arc<StepContext>) -> Self {
        Self {
            step_context,
            complete: AtomicBool::new(false),
            attributes: ScopeAttributes::default(),
        }
    }

    pub fn step_context(&self) -> &Arc<StepContext> {
        &self.step_context
    }

    pub fn step_execution(&self) -> &SharedStepExecution {
        self.step_context.step_execution()
    }

    pub fn attributes(&self) -> &ScopeAttributes {
        &self.attributes
    }

    /// The next chunk starts from a fresh context.
    pub fn set_complete(&self) {
        self.complete.store(true, Ordering::SeqCst);
    }

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::SeqCst)
    }
}

/// A step that runs a [`Tasklet`] through a repeat loop.
pub struct TaskletStep {
    name: String,
    tasklet: Arc<dyn Tasklet>,
    repository: Arc<dyn JobRepository>,
    step_operations: Arc<dyn RepeatOperations>,
    listener: CompositeStepExecutionListener,
    synchronization_manager: Arc<StepSynchronizationManager>,
    start_limit: u32,
    allow_start_if_complete: bool,
}

impl TaskletStep {
    pub fn new(
        name: impl Into<String>,
        tasklet: Arc<dyn Tasklet>,
        repository: Arc<dyn JobRepository>,
    ) -> Self {
        Self {
            name: name.into(),
            tasklet,
            repository,
            step_operations: Arc::new(RepeatTemplate::new()),
            listener: CompositeStepExecutionListener::new(),
            synchronization_manager: Arc::new(step_synchronization_manager()),
            start_limit: u32::MAX,
            allow_start_if_complete: false,
        }
    }

    /// Repeat operations driving the chunks, e.g. a task executor template
    /// for a multi-threaded step.
    pub fn with_step_operations(mut self, operations: Arc<dyn RepeatOperations>) -> Self {
        self.step_operations = operations;
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn StepExecutionListener>) -> Self {
        self.listener.register(listener);
        self
    }

    pub fn with_start_limit(mut self, start_limit: u32) -> Self {
        self.start_limit = start_limit;
        self
    }

    pub fn allow_start_if_complete(mut self, allow: bool) -> Self {
        self.allow_start_if_complete = allow;
        self
    }

    pub fn with_synchronization_manager(mut self, manager: Arc<StepSynchronizationManager>) -> Self {
        self.synchronization_manager = manager;
        self
    }

    pub fn synchronization_manager(&self) -> &Arc<StepSynchronizationManager> {
        &self.synchronization_manager
    }

    fn open_and_execute(&self, step_execution: &SharedStepExecution) -> BatchResult<()> {
        {
            let mut step = step_execution.lock();
            self.listener.before_step(&mut step)?;
            self.repository.update_step_execution_context(&mut step)?;
        }

        let callback = Arc::new(ChunkCallback {
            step_execution: step_execution.clone(),
            tasklet: self.tasklet.clone(),
            repository: self.repository.clone(),
            synchronization_manager: self.synchronization_manager.clone(),
            chunk_contexts: Mutex::new(VecDeque::new()),
        });
        self.step_operations.iterate(callback)?;
        Ok(())
    }
}

fn interrupted() -> BatchError {
    BatchError::interrupted("Job interrupted status detected.", BatchStatus::Stopped)
}

impl Step for TaskletStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn start_limit(&self) -> u32 {
        self.start_limit
    }

    fn is_allow_start_if_complete(&self) -> bool {
        self.allow_start_if_complete
    }

    #[tracing::instrument(level = "info", skip(self, step_execution), fields(step = %self.name))]
    fn execute(&self, step_execution: &SharedStepExecution) -> BatchResult<()> {
        {
            let mut step = step_execution.lock();
            step.start_time = Utc::now();
            step.status = BatchStatus::Started;
            self.repository.update_step_execution(&mut step)?;
        }

        self.synchronization_manager.register(Some(step_execution));
        let outcome = self.open_and_execute(step_execution);

        let mut step = step_execution.lock();
        let outcome = match outcome {
            Ok(()) if step.is_terminate_only() => Err(interrupted()),
            other => other,
        };

        let mut exit_status = match outcome {
            Ok(()) => {
                step.upgrade_status(BatchStatus::Completed);
                ExitStatus::completed().and(&step.exit_status)
            }
            Err(e) => {
                let stopped = e.status_if_interrupted();
                let cause = match e {
                    BatchError::RepeatFailed(cause) => cause,
                    other => other.into_anyhow(),
                };
                let exit_status = match stopped {
                    Some(status) => {
                        step.upgrade_status(status);
                        tracing::info!(step = %self.name, "step interrupted");
                        ExitStatus::stopped().add_exit_description("JobInterrupted")
                    }
                    None => {
                        step.upgrade_status(BatchStatus::Failed);
                        tracing::error!(step = %self.name, error = %format!("{cause:#}"), "step failed");
                        ExitStatus::failed().add_exit_description_from_error(&cause)
                    }
                };
                step.add_failure_exception(cause);
                exit_status
            }
        };

        exit_status = exit_status.and(&step.exit_status);
        step.exit_status = exit_status.clone();
        match self.listener.after_step(&mut step) {
            Ok(Some(listener_status)) => exit_status = exit_status.and(&listener_status),
            Ok(None) => {}
            Err(e) => tracing::error!(step = %self.name, error = %e, "exception in after_step callback"),
        }

        if let Err(e) = self.repository.update_step_execution_context(&mut step) {
            tracing::error!(step = %self.name, error = %e, "failed to save step execution context");
            step.status = BatchStatus::Unknown;
            exit_status = exit_status.and(&ExitStatus::unknown());
            step.add_failure_exception(e.into_anyhow());
        }

        step.end_time = Some(Utc::now());
        step.exit_status = exit_status.clone();
        if let Err(e) = self.repository.update_step_execution(&mut step) {
            tracing::error!(step = %self.name, error = %e, "failed to save step execution");
            step.status = BatchStatus::Unknown;
            step.exit_status = exit_status.and(&ExitStatus::unknown());
            step.add_failure_exception(e.into_anyhow());
        }

        tracing::info!(
            step = %self.name,
            status = %step.status,
            exit_code = %step.exit_status.exit_code,
            "step execution complete"
        );
        drop(step);

        if let Err(e) = self.synchronization_manager.release() {
            tracing::error!(step = %self.name, error = %e, "failed to close step scope");
            step_execution.lock().add_failure_exception(e);
        }
        Ok(())
    }

    fn stop(&self) {
        self.tasklet.stop();
    }
}

/// Runs one chunk inside the step scope.
struct ChunkCallback {
    step_execution: SharedStepExecution,
    tasklet: Arc<dyn Tasklet>,
    repository: Arc<dyn JobRepository>,
    synchronization_manager: Arc<StepSynchronizationManager>,
    chunk_contexts: Mutex<VecDeque<Arc<ChunkContext>>>,
}

impl ChunkCallback {
    fn check_interrupted(&self) -> BatchResult<()> {
        if self.step_execution.lock().is_terminate_only() {
            return Err(interrupted());
        }
        Ok(())
    }

    fn run_chunk(&self, chunk_context: &ChunkContext) -> anyhow::Result<RepeatStatus> {
        self.check_interrupted()?;

        let mut contribution = StepContribution::new();
        let status = match self.tasklet.execute(&mut contribution, chunk_context) {
            Ok(status) => status,
            Err(e) => {
                self.step_execution.lock().increment_rollback_count();
                return Err(e);
            }
        };

        {
            let mut step = self.step_execution.lock();
            step.apply(&contribution);
            step.increment_commit_count();
            self.repository.update_step_execution_context(&mut step)?;
            self.repository.update_step_execution(&mut step)?;
        }

        self.check_interrupted()?;
        if !status.is_continuable() {
            chunk_context.set_complete();
        }
        Ok(status)
    }
}

impl RepeatCallback for ChunkCallback {
    fn do_in_iteration(&self, _context: &Arc<RepeatContext>) -> anyhow::Result<RepeatStatus> {
        let Some(step_context) = self.synchronization_manager.register(Some(&self.step_execution)) else {
            anyhow::bail!("step scope could not be registered");
        };
        let chunk_context = self
            .chunk_contexts
            .lock()
            .pop_front()
            .unwrap_or_else(|| Arc::new(ChunkContext::new(step_context)));

        let result = self.run_chunk(&chunk_context);

        if !chunk_context.is_complete() {
            self.chunk_contexts.lock().push_back(chunk_context);
        }
        self.synchronization_manager.close();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryJobRepository;
    use crate::repeat::{SimpleCompletionPolicy, TaskExecutorRepeatTemplate};
    use crate::executor::ThreadPoolTaskExecutor;
    use batchflow_core::{JobExecution, JobParameters, StepExecution};
    use std::sync::atomic::AtomicUsize;

    fn setup() -> (Arc<InMemoryJobRepository>, JobExecution, SharedStepExecution) {
        let repository = Arc::new(InMemoryJobRepository::new());
        let params = JobParameters::builder().string("file", "in.csv").build();
        let mut job = repository.create_job_execution("import", &params).unwrap();
        let mut step = job.create_step_execution("load");
        repository.add_step_execution(&mut step).unwrap();
        (repository, job, step.into_shared())
    }

    fn counting_tasklet(chunks: usize) -> (Arc<AtomicUsize>, Arc<dyn Tasklet>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let tasklet = FnTasklet::new(move |contribution: &mut StepContribution, _: &ChunkContext| {
            let n = seen.fetch_add(1, Ordering::SeqCst) + 1;
            contribution.increment_read_count(10);
            contribution.increment_write_count(10);
            Ok(RepeatStatus::continue_if(n < chunks))
        });
        (calls, Arc::new(tasklet))
    }

    fn snapshot(shared: &SharedStepExecution) -> StepExecution {
        shared.lock().clone()
    }

    #[test]
    fn test_completes_after_tasklet_finishes() {
        let (repository, _job, shared) = setup();
        let (calls, tasklet) = counting_tasklet(3);
        let step = TaskletStep::new("load", tasklet, repository.clone());

        step.execute(&shared).unwrap();
        let execution = snapshot(&shared);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(execution.status, BatchStatus::Completed);
        assert_eq!(execution.exit_status.exit_code, ExitStatus::COMPLETED);
        assert_eq!(execution.read_count, 30);
        assert_eq!(execution.commit_count, 3);
        assert!(execution.end_time.is_some());
        assert_eq!(step.synchronization_manager().active_contexts(), 0);

        let stored = repository.get_step_executions(execution.job_execution_id);
        assert_eq!(stored[0].status, BatchStatus::Completed);
        assert_eq!(stored[0].version, execution.version);
    }

    #[test]
    fn test_tasklet_error_fails_step() {
        let (repository, _job, shared) = setup();
        let tasklet = FnTasklet::new(|_: &mut StepContribution, _: &ChunkContext| -> anyhow::Result<RepeatStatus> {
            anyhow::bail!("disk full")
        });
        let step = TaskletStep::new("load", Arc::new(tasklet), repository);

        step.execute(&shared).unwrap();
        let execution = snapshot(&shared);
        assert_eq!(execution.status, BatchStatus::Failed);
        assert_eq!(execution.exit_status.exit_code, ExitStatus::FAILED);
        assert!(execution.exit_status.exit_description.contains("disk full"));
        assert_eq!(execution.rollback_count, 1);
        assert_eq!(execution.failure_exceptions.len(), 1);
        assert_eq!(execution.failure_exceptions[0].to_string(), "disk full");
    }

    #[test]
    fn test_terminate_only_stops_step() {
        let (repository, _job, shared) = setup();
        let flagged = shared.clone();
        let tasklet = FnTasklet::new(move |_: &mut StepContribution, _: &ChunkContext| {
            flagged.lock().set_terminate_only();
            Ok(RepeatStatus::Continuable)
        });
        let step = TaskletStep::new("load", Arc::new(tasklet), repository);

        step.execute(&shared).unwrap();
        let execution = snapshot(&shared);
        assert_eq!(execution.status, BatchStatus::Stopped);
        assert_eq!(execution.exit_status.exit_code, ExitStatus::STOPPED);
        assert_eq!(execution.commit_count, 1);
    }

    struct ExitOverride;

    impl StepExecutionListener for ExitOverride {
        fn after_step(&self, _: &mut StepExecution) -> anyhow::Result<Option<ExitStatus>> {
            Ok(Some(ExitStatus::new("COMPLETED WITH SKIPS")))
        }
    }

    #[test]
    fn test_listener_exit_status_combined() {
        let (repository, _job, shared) = setup();
        let (_, tasklet) = counting_tasklet(1);
        let step = TaskletStep::new("load", tasklet, repository).with_listener(Arc::new(ExitOverride));

        step.execute(&shared).unwrap();
        assert_eq!(snapshot(&shared).exit_status.exit_code, "COMPLETED WITH SKIPS");
    }

    #[test]
    fn test_chunk_context_shared_until_complete() {
        let (repository, _job, shared) = setup();
        let tasklet = FnTasklet::new(|_: &mut StepContribution, chunk: &ChunkContext| {
            let seen = chunk
                .attributes()
                .get_or_insert_with("chunks", || -> batchflow_core::Attribute { Arc::new(AtomicUsize::new(0)) })
                .downcast::<AtomicUsize>()
                .map_err(|_| anyhow::anyhow!("unexpected attribute type"))?;
            let n = seen.fetch_add(1, Ordering::SeqCst) + 1;
            assert!(chunk.step_context().step_name() == "load");
            Ok(RepeatStatus::continue_if(n < 4))
        });
        let step = TaskletStep::new("load", Arc::new(tasklet), repository);

        step.execute(&shared).unwrap();
        let execution = snapshot(&shared);
        assert_eq!(execution.status, BatchStatus::Completed);
        assert_eq!(execution.commit_count, 4);
    }

    #[test]
    fn test_finished_chunk_context_is_discarded() {
        let (repository, _job, shared) = setup();
        let (calls, tasklet) = counting_tasklet(2);
        let callback = ChunkCallback {
            step_execution: shared.clone(),
            tasklet,
            repository,
            synchronization_manager: Arc::new(step_synchronization_manager()),
            chunk_contexts: Mutex::new(VecDeque::new()),
        };
        let repeat_context = Arc::new(RepeatContext::new(None));

        let first = callback.do_in_iteration(&repeat_context).unwrap();
        assert_eq!(first, RepeatStatus::Continuable);
        let pending = callback.chunk_contexts.lock().front().cloned().unwrap();
        assert!(!pending.is_complete());

        let second = callback.do_in_iteration(&repeat_context).unwrap();
        assert_eq!(second, RepeatStatus::Finished);
        assert!(pending.is_complete());
        assert!(callback.chunk_contexts.lock().is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(snapshot(&shared).commit_count, 2);
    }

    #[test]
    fn test_multi_threaded_chunks() {
        let (repository, _job, shared) = setup();
        let (calls, tasklet) = counting_tasklet(usize::MAX);
        let executor = Arc::new(ThreadPoolTaskExecutor::new(4).unwrap());
        let operations = TaskExecutorRepeatTemplate::new(executor)
            .with_completion_policy(Arc::new(SimpleCompletionPolicy::new(8)));
        let step = TaskletStep::new("load", tasklet, repository).with_step_operations(Arc::new(operations));

        step.execute(&shared).unwrap();
        let execution = snapshot(&shared);
        assert_eq!(calls.load(Ordering::SeqCst), 8);
        assert_eq!(execution.commit_count, 8);
        assert_eq!(execution.write_count, 80);
        assert_eq!(execution.status, BatchStatus::Completed);
    }
}
