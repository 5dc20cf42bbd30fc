//! Step implementations and the handler that decides whether a step runs.

mod handler;
mod tasklet;

pub use handler::{SimpleStepHandler, StepHandler};
pub use tasklet::{ChunkContext, FnTasklet, Tasklet, TaskletStep};
