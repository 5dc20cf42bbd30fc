//! Step and job scope contexts shared across worker threads.
//!
//! A context wraps the live execution and carries scope attributes plus
//! destruction callbacks, which run once when the scope is released.

use crate::execution::{SharedJobExecution, SharedStepExecution};
use crate::parameters::JobParameters;
use batchflow_context::{ExecutionContext, LinkedMap, ScopeContext, SynchronizationManager};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

pub type Attribute = Arc<dyn Any + Send + Sync>;
type DestructionCallback = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

#[derive(Default)]
struct AttributeState {
    attributes: HashMap<String, Attribute>,
    callbacks: LinkedMap<String, DestructionCallback>,
}

/// Attribute map with named destruction callbacks.
#[derive(Default)]
pub struct ScopeAttributes {
    state: Mutex<AttributeState>,
}

impl ScopeAttributes {
    pub fn set(&self, name: impl Into<String>, value: Attribute) {
        self.state.lock().attributes.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<Attribute> {
        self.state.lock().attributes.get(name).cloned()
    }

    pub fn get_as<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.get(name)?.downcast::<T>().ok()
    }

    /// Returns the attribute, creating it under the same lock when absent.
    pub fn get_or_insert_with(&self, name: &str, create: impl FnOnce() -> Attribute) -> Attribute {
        self.state
            .lock()
            .attributes
            .entry(name.to_string())
            .or_insert_with(create)
            .clone()
    }

    pub fn has(&self, name: &str) -> bool {
        self.state.lock().attributes.contains_key(name)
    }

    /// Removes the attribute together with its destruction callback.
    pub fn remove(&self, name: &str) -> Option<Attribute> {
        let mut state = self.state.lock();
        state.callbacks.remove(name);
        state.attributes.remove(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().attributes.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn register_destruction_callback(
        &self,
        name: impl Into<String>,
        callback: impl FnOnce() -> anyhow::Result<()> + Send + 'static,
    ) {
        self.state
            .lock()
            .callbacks
            .insert(name.into(), Box::new(callback));
    }

    /// Runs every destruction callback once, in registration order, and
    /// returns the first failure after all of them ran.
    pub fn close(&self) -> anyhow::Result<()> {
        let mut callbacks = {
            let mut state = self.state.lock();
            std::mem::take(&mut state.callbacks)
        };

        let mut first_error = None;
        while let Some((name, callback)) = callbacks.pop_front() {
            if let Err(e) = callback() {
                tracing::warn!(attribute = %name, error = %e, "destruction callback failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Scope context of a running step execution.
pub struct StepContext {
    step_execution: SharedStepExecution,
    attributes: ScopeAttributes,
}

impl StepContext {
    pub fn new(step_execution: SharedStepExecution) -> Self {
        Self {
            step_execution,
            attributes: ScopeAttributes::default(),
        }
    }

    pub fn step_execution(&self) -> &SharedStepExecution {
        &self.step_execution
    }

    pub fn step_name(&self) -> String {
        self.step_execution.lock().step_name.clone()
    }

    pub fn job_name(&self) -> String {
        self.step_execution.lock().job_name().to_string()
    }

    pub fn job_parameters(&self) -> JobParameters {
        self.step_execution.lock().job_parameters.clone()
    }

    /// Snapshot of the step's execution context.
    pub fn step_execution_context(&self) -> ExecutionContext {
        self.step_execution.lock().execution_context.clone()
    }

    pub fn attributes(&self) -> &ScopeAttributes {
        &self.attributes
    }

    pub fn register_destruction_callback(
        &self,
        name: impl Into<String>,
        callback: impl FnOnce() -> anyhow::Result<()> + Send + 'static,
    ) {
        self.attributes.register_destruction_callback(name, callback);
    }
}

impl ScopeContext for StepContext {
    fn close(&self) -> anyhow::Result<()> {
        self.attributes.close()
    }
}

/// Scope context of a running job execution.
pub struct JobContext {
    job_execution: SharedJobExecution,
    attributes: ScopeAttributes,
}

impl JobContext {
    pub fn new(job_execution: SharedJobExecution) -> Self {
        Self {
            job_execution,
            attributes: ScopeAttributes::default(),
        }
    }

    pub fn job_execution(&self) -> &SharedJobExecution {
        &self.job_execution
    }

    pub fn job_name(&self) -> String {
        self.job_execution.lock().job_name().to_string()
    }

    pub fn job_parameters(&self) -> JobParameters {
        self.job_execution.lock().job_parameters.clone()
    }

    pub fn job_execution_context(&self) -> ExecutionContext {
        self.job_execution.lock().execution_context.clone()
    }

    pub fn attributes(&self) -> &ScopeAttributes {
        &self.attributes
    }

    pub fn register_destruction_callback(
        &self,
        name: impl Into<String>,
        callback: impl FnOnce() -> anyhow::Result<()> + Send + 'static,
    ) {
        self.attributes.register_destruction_callback(name, callback);
    }
}

impl ScopeContext for JobContext {
    fn close(&self) -> anyhow::Result<()> {
        self.attributes.close()
    }
}

pub type StepSynchronizationManager = SynchronizationManager<SharedStepExecution, StepContext>;
pub type JobSynchronizationManager = SynchronizationManager<SharedJobExecution, JobContext>;

pub fn step_synchronization_manager() -> StepSynchronizationManager {
    SynchronizationManager::new("step", |execution: &SharedStepExecution| {
        StepContext::new(execution.clone())
    })
}

pub fn job_synchronization_manager() -> JobSynchronizationManager {
    SynchronizationManager::new("job", |execution: &SharedJobExecution| {
        JobContext::new(execution.clone())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{JobExecution, JobInstance, StepExecution};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn step_execution() -> SharedStepExecution {
        let params = JobParameters::builder().string("input", "a.csv").build();
        let job = JobExecution::new(1, JobInstance::new(1, "import", &params), params);
        StepExecution::new("load", &job).into_shared()
    }

    #[test]
    fn test_step_context_views() {
        let manager = step_synchronization_manager();
        let execution = step_execution();
        let context = manager.register(Some(&execution)).unwrap();

        assert_eq!(context.step_name(), "load");
        assert_eq!(context.job_name(), "import");
        assert_eq!(context.job_parameters().get_string("input"), Some("a.csv"));
        manager.close();
    }

    #[test]
    fn test_release_runs_destruction_callbacks_once() {
        let manager = step_synchronization_manager();
        let execution = step_execution();
        let runs = Arc::new(AtomicUsize::new(0));

        let context = manager.register(Some(&execution)).unwrap();
        context.attributes().set("reader", Arc::new(42u32));
        let r = runs.clone();
        context.register_destruction_callback("reader", move || {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert_eq!(context.attributes().get_as::<u32>("reader").as_deref(), Some(&42));
        manager.release().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(context.close().is_ok());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(manager.active_contexts(), 0);
    }

    #[test]
    fn test_removing_attribute_drops_its_callback() {
        let attributes = ScopeAttributes::default();
        let runs = Arc::new(AtomicUsize::new(0));
        attributes.set("cache", Arc::new("x".to_string()));
        let r = runs.clone();
        attributes.register_destruction_callback("cache", move || {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert!(attributes.remove("cache").is_some());
        attributes.close().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_close_reports_first_failure_after_running_all() {
        let attributes = ScopeAttributes::default();
        let runs = Arc::new(AtomicUsize::new(0));
        for name in ["a", "b"] {
            let r = runs.clone();
            attributes.register_destruction_callback(name, move || {
                r.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("{name} failed")
            });
        }

        let err = attributes.close().unwrap_err();
        assert_eq!(err.to_string(), "a failed");
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_job_context_shared_across_threads() {
        let manager = Arc::new(job_synchronization_manager());
        let params = JobParameters::new();
        let job = JobExecution::new(7, JobInstance::new(1, "nightly", &params), params).into_shared();

        let context = manager.register(Some(&job)).unwrap();
        let worker = {
            let manager = manager.clone();
            let job = job.clone();
            std::thread::spawn(move || {
                let ctx = manager.register(Some(&job)).unwrap();
                let name = ctx.job_name();
                manager.close();
                name
            })
        };
        assert_eq!(worker.join().unwrap(), "nightly");
        assert_eq!(context.job_execution().lock().id, 7);
        manager.close();
        assert_eq!(manager.active_contexts(), 0);
    }
}
