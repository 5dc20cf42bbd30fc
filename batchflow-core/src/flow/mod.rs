//! Flow engine: states, transitions, compiled flows and the flow builder.

mod builder;
mod executor;
mod simple_flow;
mod state;
mod status;
mod transition;

pub use builder::{FlowBuilder, SplitBuilder, StateSource, TransitionBuilder};
pub use executor::{FlowExecutor, JobExecutionDecider};
pub use simple_flow::SimpleFlow;
pub use state::{State, StateKind};
pub use status::{
    FlowExecution, FlowExecutionAggregator, FlowExecutionStatus, MaxValueFlowExecutionAggregator,
};
pub use transition::{glob_match, StateTransition};

use crate::error::BatchResult;
use std::sync::Arc;

/// A runnable graph of states.
pub trait Flow: Send + Sync {
    fn name(&self) -> &str;

    fn start(&self, executor: &Arc<dyn FlowExecutor>) -> BatchResult<FlowExecution>;

    fn resume(&self, state_name: &str, executor: &Arc<dyn FlowExecutor>)
        -> BatchResult<FlowExecution>;

    fn get_state(&self, state_name: &str) -> Option<Arc<State>>;

    fn state_names(&self) -> Vec<String>;
}
