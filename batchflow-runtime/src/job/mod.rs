//! Jobs, the flow executor that drives flow jobs, and the launcher and
//! operator that start and control job executions.

mod flow_job;
mod launcher;
mod operator;
mod simple_job;
mod support;

pub use flow_job::{FlowJob, JobFlowExecutor};
pub use launcher::SimpleJobLauncher;
pub use operator::SimpleJobOperator;
pub use simple_job::SimpleJob;
pub use support::JobSupport;
