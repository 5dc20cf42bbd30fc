use crate::step::{SimpleStepHandler, StepHandler};
use batchflow_core::{
    job_synchronization_manager, BatchError, BatchResult, BatchStatus,
    CompositeJobExecutionListener, ExitStatus, JobExecution, JobExecutionListener,
    JobParametersValidator, JobRepository, JobSynchronizationManager, SharedJobExecution,
};
use chrono::Utc;
use std::sync::Arc;

/// Lifecycle shared by every job: parameter validation, status bookkeeping,
/// listeners, the job scope and the final save.
pub struct JobSupport {
    name: String,
    restartable: bool,
    repository: Arc<dyn JobRepository>,
    listener: CompositeJobExecutionListener,
    validator: Option<Arc<dyn JobParametersValidator>>,
    step_handler: Arc<dyn StepHandler>,
    synchronization_manager: Arc<JobSynchronizationManager>,
}

impl JobSupport {
    pub fn new(name: impl Into<String>, repository: Arc<dyn JobRepository>) -> Self {
        Self {
            name: name.into(),
            restartable: true,
            step_handler: Arc::new(SimpleStepHandler::new(repository.clone())),
            repository,
            listener: CompositeJobExecutionListener::new(),
            validator: None,
            synchronization_manager: Arc::new(job_synchronization_manager()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_restartable(&self) -> bool {
        self.restartable
    }

    pub fn set_restartable(&mut self, restartable: bool) {
        self.restartable = restartable;
    }

    pub fn repository(&self) -> &Arc<dyn JobRepository> {
        &self.repository
    }

    pub fn register_listener(&mut self, listener: Arc<dyn JobExecutionListener>) {
        self.listener.register(listener);
    }

    pub fn validator(&self) -> Option<Arc<dyn JobParametersValidator>> {
        self.validator.clone()
    }

    pub fn set_validator(&mut self, validator: Arc<dyn JobParametersValidator>) {
        self.validator = Some(validator);
    }

    pub fn step_handler(&self) -> &Arc<dyn StepHandler> {
        &self.step_handler
    }

    pub fn set_step_handler(&mut self, step_handler: Arc<dyn StepHandler>) {
        self.step_handler = step_handler;
    }

    pub fn synchronization_manager(&self) -> &Arc<JobSynchronizationManager> {
        &self.synchronization_manager
    }

    pub fn set_synchronization_manager(&mut self, manager: Arc<JobSynchronizationManager>) {
        self.synchronization_manager = manager;
    }

    /// Runs `do_execute` inside the job lifecycle. The job execution is not
    /// locked while `do_execute` runs.
    ///
    /// Failures of the job's work are recorded on the execution; only a
    /// failure to save the final state is returned.
    pub fn execute_with<F>(&self, job_execution: &SharedJobExecution, do_execute: F) -> BatchResult<()>
    where
        F: FnOnce(&SharedJobExecution) -> BatchResult<()>,
    {
        tracing::debug!(job = %self.name, "job execution starting");
        self.synchronization_manager.register(Some(job_execution));

        let outcome = self.run(job_execution, do_execute);

        let mut job = job_execution.lock();
        if let Err(e) = outcome {
            self.record_failure(&mut job, e);
        }

        if job.executed_step_executions().next().is_none()
            && !matches!(
                job.status,
                BatchStatus::Failed | BatchStatus::Abandoned | BatchStatus::Unknown
            )
        {
            job.exit_status = job.exit_status.and(
                &ExitStatus::noop()
                    .add_exit_description("All steps already completed or no steps configured for this job."),
            );
        }

        job.end_time = Some(Utc::now());
        if let Err(e) = self.listener.after_job(&mut job) {
            tracing::error!(job = %self.name, error = %format!("{e:#}"), "exception encountered in after_job callback");
        }

        let saved = self.repository.update_job_execution(&mut job);
        tracing::info!(
            job = %self.name,
            job_execution_id = job.id,
            status = %job.status,
            exit_code = %job.exit_status.exit_code,
            "job execution complete"
        );
        drop(job);

        if let Err(e) = self.synchronization_manager.release() {
            tracing::error!(job = %self.name, error = %e, "failed to close job scope");
            job_execution.lock().add_failure_exception(e);
        }
        saved
    }

    fn run<F>(&self, job_execution: &SharedJobExecution, do_execute: F) -> BatchResult<()>
    where
        F: FnOnce(&SharedJobExecution) -> BatchResult<()>,
    {
        {
            let mut job = job_execution.lock();
            if let Some(validator) = &self.validator {
                validator.validate(&job.job_parameters)?;
            }

            if job.status == BatchStatus::Stopping {
                // stopped before it started: nothing left to do
                job.status = BatchStatus::Stopped;
                job.exit_status = ExitStatus::completed();
                tracing::info!(job = %self.name, "job stopped before it started");
                return Ok(());
            }

            job.start_time = Some(Utc::now());
            job.status = BatchStatus::Started;
            self.repository.update_job_execution(&mut job)?;
            self.listener.before_job(&mut job)?;
        }

        do_execute(job_execution)
    }

    fn record_failure(&self, job: &mut JobExecution, error: BatchError) {
        let interrupted = error.status_if_interrupted();
        let cause = match error {
            BatchError::RepeatFailed(cause) => cause,
            other => other.into_anyhow(),
        };

        match interrupted {
            Some(status) => {
                tracing::info!(job = %self.name, error = %cause, "encountered interruption executing job");
                job.exit_status = ExitStatus::stopped().add_exit_description(&cause.to_string());
                job.status = BatchStatus::Stopped.max(status);
            }
            None => {
                tracing::error!(job = %self.name, error = %format!("{cause:#}"), "encountered an error executing job");
                job.exit_status = ExitStatus::failed().add_exit_description_from_error(&cause);
                job.status = BatchStatus::Failed;
            }
        }
        job.add_failure_exception(cause);
    }
}

/// Builder methods every job type shares, forwarded to its [`JobSupport`].
macro_rules! job_support_builders {
    ($job:ty) => {
        impl $job {
            pub fn restartable(mut self, restartable: bool) -> Self {
                self.support.set_restartable(restartable);
                self
            }

            pub fn with_listener(
                mut self,
                listener: ::std::sync::Arc<dyn ::batchflow_core::JobExecutionListener>,
            ) -> Self {
                self.support.register_listener(listener);
                self
            }

            pub fn with_validator(
                mut self,
                validator: ::std::sync::Arc<dyn ::batchflow_core::JobParametersValidator>,
            ) -> Self {
                self.support.set_validator(validator);
                self
            }

            pub fn with_step_handler(
                mut self,
                step_handler: ::std::sync::Arc<dyn $crate::step::StepHandler>,
            ) -> Self {
                self.support.set_step_handler(step_handler);
                self
            }

            pub fn with_synchronization_manager(
                mut self,
                manager: ::std::sync::Arc<::batchflow_core::JobSynchronizationManager>,
            ) -> Self {
                self.support.set_synchronization_manager(manager);
                self
            }

            pub fn support(&self) -> &$crate::job::JobSupport {
                &self.support
            }
        }
    };
}

pub(crate) use job_support_builders;
