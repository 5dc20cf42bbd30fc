use crate::error::BatchResult;
use crate::execution::SharedStepExecution;

/// A unit of work inside a job.
///
/// `execute` records ordinary failures on the step execution itself; an
/// `Err` is reserved for interruption and infrastructure failures.
pub trait Step: Send + Sync {
    fn name(&self) -> &str;

    /// How many times the step may be started for one job instance.
    fn start_limit(&self) -> u32 {
        u32::MAX
    }

    /// Whether a step that already completed runs again on restart.
    fn is_allow_start_if_complete(&self) -> bool {
        false
    }

    fn execute(&self, step_execution: &SharedStepExecution) -> BatchResult<()>;

    /// Out-of-band stop request from an operator.
    fn stop(&self) {}
}
