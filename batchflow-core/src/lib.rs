//! # batchflow Core
//!
//! Domain model, collaborator contracts, step and job scopes, and the flow
//! state machine for batchflow.

pub mod error;
pub mod execution;
pub mod flow;
pub mod job;
pub mod listener;
pub mod parameters;
pub mod repository;
pub mod scope;
pub mod status;
pub mod step;
pub mod task_executor;

pub use error::{BatchError, BatchResult};
pub use execution::{
    Failure, JobExecution, JobInstance, SharedJobExecution, SharedStepExecution,
    StepContribution, StepExecution,
};
pub use flow::{
    Flow, FlowBuilder, FlowExecution, FlowExecutionAggregator, FlowExecutionStatus,
    FlowExecutor, JobExecutionDecider, MaxValueFlowExecutionAggregator, SimpleFlow,
    SplitBuilder, State, StateKind, StateSource, StateTransition, TransitionBuilder,
};
pub use job::Job;
pub use listener::{
    CompositeJobExecutionListener, CompositeStepExecutionListener, JobExecutionListener,
    StepExecutionListener,
};
pub use parameters::{
    DefaultJobParametersValidator, JobParameter, JobParameters, JobParametersBuilder,
    JobParametersValidator, ParameterValue,
};
pub use repository::{ExecutionContextDao, JobRepository};
pub use scope::{
    job_synchronization_manager, step_synchronization_manager, Attribute, JobContext,
    JobSynchronizationManager, ScopeAttributes, StepContext, StepSynchronizationManager,
};
pub use status::{BatchStatus, ExitStatus};
pub use step::Step;
pub use task_executor::{SyncTaskExecutor, Task, TaskExecutor};

/// Common imports for implementing steps, jobs and flows.
pub mod prelude {
    pub use crate::error::{BatchError, BatchResult};
    pub use crate::execution::{
        JobExecution, SharedJobExecution, SharedStepExecution, StepContribution, StepExecution,
    };
    pub use crate::flow::{Flow, FlowBuilder, FlowExecutionStatus, JobExecutionDecider};
    pub use crate::job::Job;
    pub use crate::listener::{JobExecutionListener, StepExecutionListener};
    pub use crate::parameters::{JobParameters, JobParametersBuilder};
    pub use crate::repository::JobRepository;
    pub use crate::status::{BatchStatus, ExitStatus};
    pub use crate::step::Step;
    pub use crate::task_executor::TaskExecutor;
    pub use batchflow_context::{ContextValue, ExecutionContext};
}
