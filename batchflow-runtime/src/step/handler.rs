use batchflow_context::{ExecutionContext, BATCH_EXECUTED, BATCH_RESTART};
use batchflow_core::{
    BatchError, BatchResult, BatchStatus, JobInstance, JobRepository, SharedJobExecution, Step,
    StepExecution,
};
use std::sync::Arc;

/// Decides whether a step runs within a job execution and runs it.
pub trait StepHandler: Send + Sync {
    /// Returns the step execution that represents the step in this job
    /// execution: a new one, or the previous one when the step is skipped.
    fn handle_step(
        &self,
        step: &Arc<dyn Step>,
        job_execution: &SharedJobExecution,
    ) -> BatchResult<StepExecution>;
}

/// Step handler with restart semantics backed by a [`JobRepository`].
pub struct SimpleStepHandler {
    repository: Arc<dyn JobRepository>,
    execution_context: ExecutionContext,
}

impl SimpleStepHandler {
    pub fn new(repository: Arc<dyn JobRepository>) -> Self {
        Self {
            repository,
            execution_context: ExecutionContext::new(),
        }
    }

    /// Entries every fresh step execution starts with.
    pub fn with_execution_context(mut self, execution_context: ExecutionContext) -> Self {
        self.execution_context = execution_context;
        self
    }

    fn should_start(
        &self,
        last: Option<&StepExecution>,
        job_instance: &JobInstance,
        step: &dyn Step,
    ) -> BatchResult<bool> {
        let status = last.map_or(BatchStatus::Starting, |last| last.status);

        if status == BatchStatus::Unknown {
            return Err(BatchError::JobRestart(format!(
                "cannot restart step '{}' from UNKNOWN status; the last execution \
                 ended abnormally and must be fixed by hand",
                step.name()
            )));
        }

        if (status == BatchStatus::Completed && !step.is_allow_start_if_complete())
            || status == BatchStatus::Abandoned
        {
            tracing::info!(
                step = step.name(),
                status = %status,
                "step already complete or not restartable, so no action to execute"
            );
            return Ok(false);
        }

        let count = self
            .repository
            .get_step_execution_count(job_instance, step.name())?;
        if count < step.start_limit() {
            Ok(true)
        } else {
            Err(BatchError::StartLimitExceeded {
                step: step.name().to_string(),
                limit: step.start_limit(),
            })
        }
    }
}

impl StepHandler for SimpleStepHandler {
    #[tracing::instrument(level = "info", skip(self, step, job_execution), fields(step = %step.name()))]
    fn handle_step(
        &self,
        step: &Arc<dyn Step>,
        job_execution: &SharedJobExecution,
    ) -> BatchResult<StepExecution> {
        let (job_instance, job_execution_id) = {
            let job = job_execution.lock();
            if job.is_stopping() {
                return Err(BatchError::interrupted(
                    "JobExecution interrupted.",
                    BatchStatus::Stopped,
                ));
            }
            (job.job_instance.clone(), job.id)
        };

        let mut last = self
            .repository
            .get_last_step_execution(&job_instance, step.name())?;
        if last
            .as_ref()
            .is_some_and(|last| last.job_execution_id == job_execution_id)
        {
            tracing::info!(
                step = step.name(),
                job_execution_id,
                "duplicate step detected in job execution; running it again"
            );
            last = None;
        }

        if !self.should_start(last.as_ref(), &job_instance, step.as_ref())? {
            return match last {
                Some(previous) => {
                    // skipped steps keep their earlier outcome in this run's history
                    job_execution
                        .lock()
                        .add_or_replace_step_execution(previous.clone());
                    Ok(previous)
                }
                None => Err(BatchError::FlowExecution(format!(
                    "step '{}' was skipped without a previous execution",
                    step.name()
                ))),
            };
        }

        let mut current = job_execution.lock().create_step_execution(step.name());
        let is_restart = last
            .as_ref()
            .is_some_and(|last| last.status != BatchStatus::Completed);
        current.execution_context = match &last {
            Some(last) if is_restart => {
                let mut context = last.execution_context.clone();
                context.remove(BATCH_EXECUTED);
                context.put(BATCH_RESTART, true);
                context
            }
            _ => self.execution_context.clone(),
        };

        self.repository.add_step_execution(&mut current)?;
        job_execution
            .lock()
            .add_or_replace_step_execution(current.clone());
        tracing::debug!(step = step.name(), restart = is_restart, "executing step");

        let shared = current.into_shared();
        if let Err(e) = step.execute(&shared) {
            let executed = shared.lock().clone();
            let mut job = job_execution.lock();
            job.add_or_replace_step_execution(executed);
            if e.is_interruption() {
                job.status = BatchStatus::Stopping;
            }
            return Err(e);
        }

        let mut current = {
            let mut executed = shared.lock();
            executed.execution_context.put(BATCH_EXECUTED, true);
            executed.clone()
        };
        self.repository.update_step_execution_context(&mut current)?;

        let mut job = job_execution.lock();
        job.add_or_replace_step_execution(current.clone());
        self.repository.update_job_execution_context(&mut job)?;

        if matches!(current.status, BatchStatus::Stopping | BatchStatus::Stopped) {
            job.status = BatchStatus::Stopping;
            return Err(BatchError::interrupted(
                "Job interrupted by step execution",
                BatchStatus::Stopped,
            ));
        }
        Ok(current)
    }
}
