//! # batchflow Context
//!
//! Execution contexts, insertion-ordered collections and the thread-scoped
//! synchronization manager shared by job and step scopes.

mod execution_context;
mod linked_map;
mod synchronization;

pub use execution_context::{
    ContextValue, ExecutionContext, BATCH_EXECUTED, BATCH_RESTART,
};
pub use linked_map::{Iter, LinkedMap, LinkedSet};
pub use synchronization::{ScopeContext, ScopedExecution, SynchronizationManager};
