//! # batchflow - Restartable Batch Jobs
//!
//! batchflow runs jobs made of ordered steps, keeps their execution state in
//! a job repository so failed jobs can be restarted, and coordinates stop,
//! skip and retry semantics across steps.
//!
//! ## Features
//!
//! - `runtime` (default): repeat engine, tasklet steps, simple and flow jobs,
//!   launcher, operator, task executors and the in-memory repository
//! - `logger` (default): tracing subscriber setup and execution summaries
//!
//! ## Quick Start
//!
//! ```rust
//! use batchflow::prelude::*;
//! use std::sync::Arc;
//!
//! fn main() -> anyhow::Result<()> {
//!     let repository = Arc::new(InMemoryJobRepository::new());
//!     let tasklet = FnTasklet::new(|contribution: &mut StepContribution, _: &ChunkContext| {
//!         contribution.increment_write_count(1);
//!         Ok(RepeatStatus::Finished)
//!     });
//!     let step = Arc::new(TaskletStep::new("greet", Arc::new(tasklet), repository.clone()));
//!     let job = Arc::new(SimpleJob::new("hello", repository.clone()).with_step(step));
//!
//!     let launcher = SimpleJobLauncher::new(repository);
//!     let parameters = JobParameters::builder().string("name", "world").build();
//!     let execution = launcher.run(job, &parameters)?;
//!     assert_eq!(execution.lock().status, BatchStatus::Completed);
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

// Re-export core functionality
pub use batchflow_context as context;
pub use batchflow_core::*;

#[cfg(feature = "runtime")]
#[cfg_attr(docsrs, doc(cfg(feature = "runtime")))]
pub use batchflow_runtime as runtime;

#[cfg(feature = "logger")]
#[cfg_attr(docsrs, doc(cfg(feature = "logger")))]
pub use batchflow_logger as logger;

/// Prelude module for easy imports
pub mod prelude {
    pub use batchflow_core::prelude::*;

    #[cfg(feature = "runtime")]
    #[cfg_attr(docsrs, doc(cfg(feature = "runtime")))]
    pub use batchflow_runtime::prelude::*;

    #[cfg(feature = "logger")]
    #[cfg_attr(docsrs, doc(cfg(feature = "logger")))]
    pub use batchflow_logger::{Logger, LoggingConfig};
}
