use super::status::{FlowExecution, FlowExecutionStatus};
use crate::error::BatchResult;
use crate::execution::{JobExecution, SharedJobExecution, StepExecution};
use crate::step::Step;
use std::sync::Arc;

/// Services a running flow needs from the job that drives it.
pub trait FlowExecutor: Send + Sync {
    /// Runs the step and returns its exit code.
    fn execute_step(&self, step: &Arc<dyn Step>) -> BatchResult<String>;

    fn job_execution(&self) -> SharedJobExecution;

    /// Last step execution handled on the current thread.
    fn step_execution(&self) -> Option<StepExecution>;

    fn close(&self, result: &FlowExecution);

    /// Marks the last step execution abandoned so it is not replayed on restart.
    fn abandon_step_execution(&self) -> BatchResult<()>;

    fn update_job_execution_status(&self, status: &FlowExecutionStatus);

    /// True when the flow is at the start of a restart.
    fn is_restart(&self) -> bool;

    fn add_exit_status(&self, code: &str);
}

/// Chooses the next transition from the state of the job.
pub trait JobExecutionDecider: Send + Sync {
    fn decide(
        &self,
        job_execution: &JobExecution,
        step_execution: Option<&StepExecution>,
    ) -> FlowExecutionStatus;
}

impl<F> JobExecutionDecider for F
where
    F: Fn(&JobExecution, Option<&StepExecution>) -> FlowExecutionStatus + Send + Sync,
{
    fn decide(
        &self,
        job_execution: &JobExecution,
        step_execution: Option<&StepExecution>,
    ) -> FlowExecutionStatus {
        self(job_execution, step_execution)
    }
}
