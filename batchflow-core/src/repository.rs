use crate::error::BatchResult;
use crate::execution::{JobExecution, JobInstance, StepExecution};
use crate::parameters::JobParameters;
use batchflow_context::ExecutionContext;

/// Persistence contract for job and step executions.
///
/// Every update checks the stored version against the one carried by the
/// execution and fails with `OptimisticLockingFailure` on a mismatch; a
/// successful update increments the version on both sides.
pub trait JobRepository: Send + Sync {
    fn is_job_instance_exists(&self, job_name: &str, parameters: &JobParameters)
        -> BatchResult<bool>;

    /// Creates a new execution, reusing the instance for known parameters.
    ///
    /// Fails when an execution of the instance is still running or when the
    /// instance already completed.
    fn create_job_execution(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> BatchResult<JobExecution>;

    fn update_job_execution(&self, job_execution: &mut JobExecution) -> BatchResult<()>;

    /// Stores a new step execution and assigns its id.
    fn add_step_execution(&self, step_execution: &mut StepExecution) -> BatchResult<()>;

    /// Stores the step execution. When the owning job execution is stopping
    /// the step is flagged terminate-only so it winds down at its next
    /// chunk boundary.
    fn update_step_execution(&self, step_execution: &mut StepExecution) -> BatchResult<()>;

    fn update_step_execution_context(&self, step_execution: &mut StepExecution)
        -> BatchResult<()>;

    fn update_job_execution_context(&self, job_execution: &mut JobExecution) -> BatchResult<()>;

    fn get_last_step_execution(
        &self,
        job_instance: &JobInstance,
        step_name: &str,
    ) -> BatchResult<Option<StepExecution>>;

    fn get_step_execution_count(&self, job_instance: &JobInstance, step_name: &str)
        -> BatchResult<u32>;

    fn get_last_job_execution(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> BatchResult<Option<JobExecution>>;
}

/// Loads and stores the flat execution contexts of jobs and steps.
pub trait ExecutionContextDao: Send + Sync {
    fn get_job_execution_context(&self, job_execution_id: i64) -> BatchResult<ExecutionContext>;

    fn get_step_execution_context(&self, step_execution_id: i64)
        -> BatchResult<ExecutionContext>;

    fn save_job_execution_context(&self, job_execution: &JobExecution) -> BatchResult<()>;

    fn save_step_execution_context(&self, step_execution: &StepExecution) -> BatchResult<()>;

    fn update_job_execution_context(&self, job_execution: &JobExecution) -> BatchResult<()>;

    fn update_step_execution_context(&self, step_execution: &StepExecution) -> BatchResult<()>;
}
