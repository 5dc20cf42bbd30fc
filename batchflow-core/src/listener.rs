//! Job and step lifecycle listeners.
//!
//! Composites call `before_*` callbacks in registration order and `after_*`
//! callbacks in reverse order, so the last listener registered wraps the
//! others.

use crate::execution::{JobExecution, StepExecution};
use crate::status::ExitStatus;
use std::sync::Arc;

pub trait JobExecutionListener: Send + Sync {
    fn before_job(&self, _job_execution: &mut JobExecution) -> anyhow::Result<()> {
        Ok(())
    }

    fn after_job(&self, _job_execution: &mut JobExecution) -> anyhow::Result<()> {
        Ok(())
    }
}

pub trait StepExecutionListener: Send + Sync {
    fn before_step(&self, _step_execution: &mut StepExecution) -> anyhow::Result<()> {
        Ok(())
    }

    /// May return an exit status that is combined with the step's own.
    fn after_step(&self, _step_execution: &mut StepExecution) -> anyhow::Result<Option<ExitStatus>> {
        Ok(None)
    }
}

#[derive(Default, Clone)]
pub struct CompositeJobExecutionListener {
    listeners: Vec<Arc<dyn JobExecutionListener>>,
}

impl CompositeJobExecutionListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, listener: Arc<dyn JobExecutionListener>) {
        self.listeners.push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

impl JobExecutionListener for CompositeJobExecutionListener {
    fn before_job(&self, job_execution: &mut JobExecution) -> anyhow::Result<()> {
        for listener in &self.listeners {
            listener.before_job(job_execution)?;
        }
        Ok(())
    }

    fn after_job(&self, job_execution: &mut JobExecution) -> anyhow::Result<()> {
        for listener in self.listeners.iter().rev() {
            listener.after_job(job_execution)?;
        }
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct CompositeStepExecutionListener {
    listeners: Vec<Arc<dyn StepExecutionListener>>,
}

impl CompositeStepExecutionListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, listener: Arc<dyn StepExecutionListener>) {
        self.listeners.push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

impl StepExecutionListener for CompositeStepExecutionListener {
    fn before_step(&self, step_execution: &mut StepExecution) -> anyhow::Result<()> {
        for listener in &self.listeners {
            listener.before_step(step_execution)?;
        }
        Ok(())
    }

    fn after_step(&self, step_execution: &mut StepExecution) -> anyhow::Result<Option<ExitStatus>> {
        let mut combined: Option<ExitStatus> = None;
        for listener in self.listeners.iter().rev() {
            if let Some(status) = listener.after_step(step_execution)? {
                combined = Some(match combined {
                    Some(current) => current.and(&status),
                    None => status,
                });
            }
        }
        Ok(combined)
    }
}
