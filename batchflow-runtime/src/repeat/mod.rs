//! Repeat engine: runs a callback until a completion policy, an error or a
//! stop request ends the loop.

mod context;
mod exception;
mod listener;
mod policy;
mod result_queue;
mod status;
mod task_template;
mod template;

pub use context::{RepeatContext, RepeatSynchronizationManager};
pub use exception::{DefaultExceptionHandler, ExceptionHandler, SimpleLimitExceptionHandler};
pub use listener::RepeatListener;
pub use policy::{
    CompletionPolicy, CompositeCompletionPolicy, DefaultResultCompletionPolicy,
    SimpleCompletionPolicy, TimeoutTerminationPolicy,
};
pub use result_queue::{ResultHolder, ResultHolderQueue, ResultQueueError};
pub use status::RepeatStatus;
pub use task_template::TaskExecutorRepeatTemplate;
pub use template::{RepeatCallback, RepeatOperations, RepeatTemplate};
