use batchflow_core::{
    BatchError, BatchResult, BatchStatus, ExitStatus, Job, JobParameters, JobRepository,
    SharedJobExecution, SyncTaskExecutor, TaskExecutor,
};
use batchflow_logger::Logger;
use std::sync::Arc;

/// Starts job executions after the restart checks pass.
pub struct SimpleJobLauncher {
    repository: Arc<dyn JobRepository>,
    task_executor: Arc<dyn TaskExecutor>,
}

impl SimpleJobLauncher {
    pub fn new(repository: Arc<dyn JobRepository>) -> Self {
        Self {
            repository,
            task_executor: Arc::new(SyncTaskExecutor::new()),
        }
    }

    /// Runs jobs on `task_executor`; with an asynchronous executor `run`
    /// returns while the job is still running.
    pub fn with_task_executor(mut self, task_executor: Arc<dyn TaskExecutor>) -> Self {
        self.task_executor = task_executor;
        self
    }

    fn check_restart(&self, job: &dyn Job, parameters: &JobParameters) -> BatchResult<()> {
        let Some(last) = self.repository.get_last_job_execution(job.name(), parameters)? else {
            return Ok(());
        };

        if !job.is_restartable() {
            return Err(BatchError::JobRestart(format!(
                "job instance '{}' already exists and is not restartable",
                job.name()
            )));
        }

        for step in &last.step_executions {
            if step.status.is_running() || step.status == BatchStatus::Stopping {
                return Err(BatchError::JobExecutionAlreadyRunning(format!(
                    "a job execution for this job is already running: step '{}' is {}",
                    step.step_name, step.status
                )));
            }
            if step.status == BatchStatus::Unknown {
                return Err(BatchError::JobRestart(format!(
                    "cannot restart step '{}' from UNKNOWN status; the last execution \
                     ended abnormally and must be fixed by hand",
                    step.step_name
                )));
            }
        }
        Ok(())
    }

    /// Creates a job execution for `parameters` and hands the job to the task
    /// executor.
    pub fn run(&self, job: Arc<dyn Job>, parameters: &JobParameters) -> BatchResult<SharedJobExecution> {
        self.check_restart(job.as_ref(), parameters)?;

        if let Some(validator) = job.parameters_validator() {
            validator.validate(parameters)?;
        }

        let job_execution = self
            .repository
            .create_job_execution(job.name(), parameters)?
            .into_shared();
        let logger = Logger::new();
        logger.info(&format!(
            "Job: [{}] launched with the following parameters: [{}]",
            job.name(),
            parameters
        ));

        let task_execution = job_execution.clone();
        let task_job = job.clone();
        let dispatched = self.task_executor.execute(Box::new(move || {
            if let Err(e) = task_job.execute(&task_execution) {
                logger.error(&format!("Job: [{}] could not save its final state: {e}", task_job.name()));
            }
            let execution = task_execution.lock();
            logger.log_job_summary(&execution);
            logger.log_step_details(&execution);
        }));

        if let Err(e) = dispatched {
            tracing::error!(job = %job.name(), error = %e, "job execution was rejected by the task executor");
            let mut execution = job_execution.lock();
            execution.upgrade_status(BatchStatus::Failed);
            if execution.exit_status.is_running() {
                execution.exit_status = ExitStatus::failed().add_exit_description(&e.to_string());
            }
            self.repository.update_job_execution(&mut execution)?;
        }
        Ok(job_execution)
    }
}
