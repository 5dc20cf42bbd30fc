use batchflow_core::{
    BatchError, BatchResult, BatchStatus, Job, JobRepository, SharedJobExecution,
};
use chrono::Utc;
use std::sync::Arc;

/// Operator actions on job executions that are already under way.
pub struct SimpleJobOperator {
    repository: Arc<dyn JobRepository>,
}

impl SimpleJobOperator {
    pub fn new(repository: Arc<dyn JobRepository>) -> Self {
        Self { repository }
    }

    /// Asks a running execution to stop. Its steps wind down at their next
    /// chunk boundary and the execution ends `Stopped`.
    pub fn stop(&self, job: &dyn Job, job_execution: &SharedJobExecution) -> BatchResult<()> {
        let running_steps: Vec<String> = {
            let mut execution = job_execution.lock();
            if !matches!(execution.status, BatchStatus::Starting | BatchStatus::Started) {
                return Err(BatchError::JobExecutionNotRunning(format!(
                    "job execution {} of '{}' is {}",
                    execution.id,
                    execution.job_name(),
                    execution.status
                )));
            }

            execution.stop();
            self.repository.update_job_execution(&mut execution)?;
            tracing::info!(job = %execution.job_name(), job_execution_id = execution.id, "job execution stopping");

            execution
                .step_executions
                .iter()
                .filter(|step| step.status.is_running())
                .map(|step| step.step_name.clone())
                .collect()
        };

        for step_name in running_steps {
            if let Some(step) = job.get_step(&step_name) {
                tracing::debug!(step = %step_name, "stopping step");
                step.stop();
            }
        }
        Ok(())
    }

    /// Marks an execution that is stopping or has ended abandoned so it is
    /// never restarted. The status is upgraded, so a completed execution
    /// stays completed.
    pub fn abandon(&self, job_execution: &SharedJobExecution) -> BatchResult<()> {
        let mut execution = job_execution.lock();
        if execution.status < BatchStatus::Stopping {
            return Err(BatchError::JobExecutionNotStopped(format!(
                "job execution {} of '{}' is {}; stop it first",
                execution.id,
                execution.job_name(),
                execution.status
            )));
        }

        execution.upgrade_status(BatchStatus::Abandoned);
        execution.end_time = Some(Utc::now());
        self.repository.update_job_execution(&mut execution)?;
        tracing::info!(job = %execution.job_name(), job_execution_id = execution.id, "job execution abandoned");
        Ok(())
    }
}
