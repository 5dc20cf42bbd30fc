use crate::error::BatchResult;
use crate::execution::SharedJobExecution;
use crate::parameters::JobParametersValidator;
use crate::step::Step;
use std::sync::Arc;

/// A runnable batch job.
pub trait Job: Send + Sync {
    fn name(&self) -> &str;

    fn is_restartable(&self) -> bool {
        true
    }

    fn parameters_validator(&self) -> Option<Arc<dyn JobParametersValidator>> {
        None
    }

    /// Runs the job against `job_execution`, recording the outcome on it.
    ///
    /// Failures of the job's own work end up in the execution; only a
    /// failure to persist the final state is returned.
    fn execute(&self, job_execution: &SharedJobExecution) -> BatchResult<()>;

    fn step_names(&self) -> Vec<String>;

    fn get_step(&self, step_name: &str) -> Option<Arc<dyn Step>>;
}
