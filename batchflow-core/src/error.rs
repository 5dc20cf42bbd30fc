use crate::status::BatchStatus;
use thiserror::Error;

pub type BatchResult<T> = Result<T, BatchError>;

/// Errors raised by the batch engine itself.
///
/// Arbitrary failures from user work (tasklets, listeners, callbacks) travel
/// as `anyhow::Error` and end up in [`BatchError::Other`].
#[derive(Debug, Error)]
pub enum BatchError {
    /// Cooperative stop signal. Caught at job level and turned into a
    /// `Stopped` status instead of `Failed`.
    #[error("job interrupted ({status}): {message}")]
    JobInterrupted { message: String, status: BatchStatus },

    #[error("job cannot be restarted: {0}")]
    JobRestart(String),

    #[error("maximum start limit exceeded for step {step}: start limit {limit}")]
    StartLimitExceeded { step: String, limit: u32 },

    #[error("a job execution is already running: {0}")]
    JobExecutionAlreadyRunning(String),

    #[error("job instance already complete: {0}")]
    JobInstanceAlreadyComplete(String),

    #[error("invalid job parameters: {0}")]
    InvalidJobParameters(String),

    #[error("optimistic locking failure: {0}")]
    OptimisticLockingFailure(String),

    #[error("flow execution failed: {0}")]
    FlowExecution(String),

    #[error("invalid flow definition: {0}")]
    FlowDefinition(String),

    #[error("repeat failed: {0:#}")]
    RepeatFailed(#[source] anyhow::Error),

    #[error("job execution is not running: {0}")]
    JobExecutionNotRunning(String),

    #[error("job execution is not stopped: {0}")]
    JobExecutionNotStopped(String),

    #[error("task rejected: {0}")]
    TaskRejected(String),

    #[error(transparent)]
    Other(anyhow::Error),
}

impl BatchError {
    pub fn interrupted(message: impl Into<String>, status: BatchStatus) -> Self {
        BatchError::JobInterrupted {
            message: message.into(),
            status,
        }
    }

    pub fn is_interruption(&self) -> bool {
        matches!(self, BatchError::JobInterrupted { .. })
    }

    /// Converts back into an `anyhow::Error` without adding a wrapper around
    /// errors that already came from `anyhow`.
    pub fn into_anyhow(self) -> anyhow::Error {
        match self {
            BatchError::Other(error) => error,
            other => anyhow::Error::new(other),
        }
    }

    /// Status of the interruption this error stands for, if it is one,
    /// looking through wrapped `anyhow` errors.
    pub fn status_if_interrupted(&self) -> Option<BatchStatus> {
        match self {
            BatchError::JobInterrupted { status, .. } => Some(*status),
            BatchError::Other(error) | BatchError::RepeatFailed(error) => {
                Self::interruption_status(error)
            }
            _ => None,
        }
    }

    /// Status carried by an interruption anywhere in the error's cause chain.
    pub fn interruption_status(error: &anyhow::Error) -> Option<BatchStatus> {
        error.chain().find_map(|cause| match cause.downcast_ref::<BatchError>() {
            Some(BatchError::JobInterrupted { status, .. }) => Some(*status),
            Some(BatchError::Other(inner)) => Self::interruption_status(inner),
            _ => None,
        })
    }
}

impl From<anyhow::Error> for BatchError {
    fn from(error: anyhow::Error) -> Self {
        match error.downcast::<BatchError>() {
            Ok(batch) => batch,
            Err(error) => BatchError::Other(error),
        }
    }
}
