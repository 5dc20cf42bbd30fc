use anyhow::Context;
use batchflow_context::ExecutionContext;
use batchflow_core::{BatchError, BatchResult, ExecutionContextDao, JobExecution, StepExecution};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Keeps execution contexts as serialized JSON, the way a table-backed DAO
/// would, so callers never share a live context with the store.
#[derive(Default)]
pub struct InMemoryExecutionContextDao {
    job_contexts: RwLock<HashMap<i64, String>>,
    step_contexts: RwLock<HashMap<i64, String>>,
}

impl InMemoryExecutionContextDao {
    pub fn new() -> Self {
        Self::default()
    }

    fn serialize(context: &ExecutionContext) -> BatchResult<String> {
        serde_json::to_string(context)
            .context("failed to serialize execution context")
            .map_err(BatchError::Other)
    }

    fn deserialize(stored: Option<&String>) -> BatchResult<ExecutionContext> {
        match stored {
            Some(json) => {
                let mut context: ExecutionContext = serde_json::from_str(json)
                    .context("failed to deserialize execution context")
                    .map_err(BatchError::Other)?;
                context.clear_dirty_flag();
                Ok(context)
            }
            None => Ok(ExecutionContext::new()),
        }
    }

    fn step_id(step_execution: &StepExecution) -> BatchResult<i64> {
        step_execution.id.ok_or_else(|| {
            BatchError::Other(anyhow::anyhow!(
                "step execution '{}' has no id; save it before its context",
                step_execution.step_name
            ))
        })
    }
}

impl ExecutionContextDao for InMemoryExecutionContextDao {
    fn get_job_execution_context(&self, job_execution_id: i64) -> BatchResult<ExecutionContext> {
        Self::deserialize(self.job_contexts.read().get(&job_execution_id))
    }

    fn get_step_execution_context(&self, step_execution_id: i64) -> BatchResult<ExecutionContext> {
        Self::deserialize(self.step_contexts.read().get(&step_execution_id))
    }

    fn save_job_execution_context(&self, job_execution: &JobExecution) -> BatchResult<()> {
        let json = Self::serialize(&job_execution.execution_context)?;
        self.job_contexts.write().insert(job_execution.id, json);
        Ok(())
    }

    fn save_step_execution_context(&self, step_execution: &StepExecution) -> BatchResult<()> {
        let id = Self::step_id(step_execution)?;
        let json = Self::serialize(&step_execution.execution_context)?;
        self.step_contexts.write().insert(id, json);
        Ok(())
    }

    fn update_job_execution_context(&self, job_execution: &JobExecution) -> BatchResult<()> {
        self.save_job_execution_context(job_execution)
    }

    fn update_step_execution_context(&self, step_execution: &StepExecution) -> BatchResult<()> {
        self.save_step_execution_context(step_execution)
    }
}
