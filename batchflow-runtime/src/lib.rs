//! # batchflow Runtime
//!
//! Execution machinery for batchflow: the repeat engine in sequential and
//! task-executor flavours, tasklet steps, simple and flow jobs, the launcher
//! and operator, thread-pool task executors and an in-memory job repository.

pub mod collections;
pub mod config;
pub mod executor;
pub mod job;
pub mod repeat;
pub mod repository;
pub mod step;

pub use config::{BatchConfig, ConfigLoader, RepeatConfig, TaskExecutorConfig, TaskExecutorKind};
pub use executor::{ThreadPoolConfig, ThreadPoolTaskExecutor};
pub use job::{FlowJob, JobFlowExecutor, JobSupport, SimpleJob, SimpleJobLauncher, SimpleJobOperator};
pub use repeat::{
    CompletionPolicy, ExceptionHandler, RepeatCallback, RepeatContext, RepeatListener,
    RepeatOperations, RepeatStatus, RepeatTemplate, SimpleCompletionPolicy,
    TaskExecutorRepeatTemplate,
};
pub use repository::{InMemoryExecutionContextDao, InMemoryJobRepository};
pub use step::{ChunkContext, FnTasklet, SimpleStepHandler, StepHandler, Tasklet, TaskletStep};

/// Common imports for assembling and running jobs.
pub mod prelude {
    pub use crate::config::{BatchConfig, ConfigLoader};
    pub use crate::executor::ThreadPoolTaskExecutor;
    pub use crate::job::{FlowJob, SimpleJob, SimpleJobLauncher, SimpleJobOperator};
    pub use crate::repeat::{RepeatOperations, RepeatStatus, RepeatTemplate, TaskExecutorRepeatTemplate};
    pub use crate::repository::InMemoryJobRepository;
    pub use crate::step::{ChunkContext, FnTasklet, Tasklet, TaskletStep};
}
