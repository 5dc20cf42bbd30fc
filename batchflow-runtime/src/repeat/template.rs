use super::context::{RepeatContext, RepeatSynchronizationManager};
use super::exception::{DefaultExceptionHandler, ExceptionHandler};
use super::listener::RepeatListener;
use super::policy::{CompletionPolicy, DefaultResultCompletionPolicy};
use super::status::RepeatStatus;
use batchflow_core::{BatchError, BatchResult};
use std::sync::Arc;

/// Work done by one iteration of a repeat loop.
pub trait RepeatCallback: Send + Sync {
    fn do_in_iteration(&self, context: &Arc<RepeatContext>) -> anyhow::Result<RepeatStatus>;
}

impl<F> RepeatCallback for F
where
    F: Fn(&Arc<RepeatContext>) -> anyhow::Result<RepeatStatus> + Send + Sync,
{
    fn do_in_iteration(&self, context: &Arc<RepeatContext>) -> anyhow::Result<RepeatStatus> {
        self(context)
    }
}

/// Runs a callback repeatedly until its completion policy says stop.
pub trait RepeatOperations: Send + Sync {
    fn iterate(&self, callback: Arc<dyn RepeatCallback>) -> BatchResult<RepeatStatus>;
}

/// How iterations are produced: inline, or dispatched to other threads.
pub(crate) trait IterationStrategy {
    type State;

    fn create_state(&self) -> BatchResult<Self::State>;

    fn get_next_result(
        &self,
        context: &Arc<RepeatContext>,
        callback: &Arc<dyn RepeatCallback>,
        state: &mut Self::State,
    ) -> anyhow::Result<RepeatStatus>;

    /// Collects work still in flight once the loop stops.
    fn wait_for_results(&self, state: &mut Self::State) -> (RepeatStatus, Vec<anyhow::Error>);
}

/// Policy, error handling and listeners shared by the repeat templates.
#[derive(Clone)]
pub(crate) struct RepeatCore {
    pub(crate) completion_policy: Arc<dyn CompletionPolicy>,
    pub(crate) exception_handler: Arc<dyn ExceptionHandler>,
    pub(crate) listeners: Vec<Arc<dyn RepeatListener>>,
}

impl Default for RepeatCore {
    fn default() -> Self {
        Self {
            completion_policy: Arc::new(DefaultResultCompletionPolicy),
            exception_handler: Arc::new(DefaultExceptionHandler),
            listeners: Vec::new(),
        }
    }
}

impl RepeatCore {
    pub(crate) fn execute<S: IterationStrategy>(
        &self,
        callback: Arc<dyn RepeatCallback>,
        strategy: &S,
    ) -> BatchResult<RepeatStatus> {
        let parent = RepeatSynchronizationManager::get_context();
        let context = self.completion_policy.start(parent);
        let previous = RepeatSynchronizationManager::register(context.clone());

        let outcome = self.run(&context, &callback, strategy);

        for listener in self.listeners.iter().rev() {
            listener.close(&context);
        }
        match previous {
            Some(previous) => {
                RepeatSynchronizationManager::register(previous);
            }
            None => {
                RepeatSynchronizationManager::clear();
            }
        }
        if let Err(e) = context.close() {
            tracing::warn!(error = %e, "failed to close repeat context");
        }

        outcome
    }

    fn run<S: IterationStrategy>(
        &self,
        context: &Arc<RepeatContext>,
        callback: &Arc<dyn RepeatCallback>,
        strategy: &S,
    ) -> BatchResult<RepeatStatus> {
        let mut running = !context.is_marked_complete();
        for listener in &self.listeners {
            listener.open(context);
            running = running && !context.is_marked_complete();
            if !running {
                break;
            }
        }

        let mut state = strategy.create_state()?;
        let mut result = RepeatStatus::Continuable;
        let mut deferred: Vec<anyhow::Error> = Vec::new();

        while running {
            for listener in &self.listeners {
                listener.before(context);
                running = running && !context.is_marked_complete();
            }
            if !running {
                break;
            }

            match strategy.get_next_result(context, callback, &mut state) {
                Ok(status) => {
                    result = status;
                    self.after(context, result);
                }
                Err(error) => self.handle(error, context, &mut deferred),
            }

            if self.completion_policy.is_complete_with(context, result)
                || context.is_marked_complete()
                || !deferred.is_empty()
            {
                running = false;
            }
        }

        let (remaining, errors) = strategy.wait_for_results(&mut state);
        result = result.and(remaining);
        for error in errors {
            self.handle(error, context, &mut deferred);
        }

        match deferred.into_iter().next() {
            Some(error) => Err(escalate(error)),
            None => Ok(result),
        }
    }

    pub(crate) fn after(&self, context: &RepeatContext, result: RepeatStatus) {
        if !result.is_continuable() {
            return;
        }
        for listener in self.listeners.iter().rev() {
            listener.after(context, result);
        }
    }

    fn handle(&self, error: anyhow::Error, context: &RepeatContext, deferred: &mut Vec<anyhow::Error>) {
        for listener in self.listeners.iter().rev() {
            listener.on_error(context, &error);
        }
        if let Err(rethrown) = self.exception_handler.handle_exception(context, error) {
            tracing::debug!(error = %rethrown, "handler rethrew repeat error");
            deferred.push(rethrown);
        }
    }
}

/// Engine errors such as interruptions pass through; anything else is
/// wrapped so the caller can tell the loop failed.
fn escalate(error: anyhow::Error) -> BatchError {
    match error.downcast::<BatchError>() {
        Ok(batch) => batch,
        Err(other) => BatchError::RepeatFailed(other),
    }
}

/// Runs every iteration on the calling thread.
#[derive(Clone, Default)]
pub struct RepeatTemplate {
    core: RepeatCore,
}

impl RepeatTemplate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_completion_policy(mut self, policy: Arc<dyn CompletionPolicy>) -> Self {
        self.core.completion_policy = policy;
        self
    }

    pub fn with_exception_handler(mut self, handler: Arc<dyn ExceptionHandler>) -> Self {
        self.core.exception_handler = handler;
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn RepeatListener>) -> Self {
        self.core.listeners.push(listener);
        self
    }

    pub fn register_listener(&mut self, listener: Arc<dyn RepeatListener>) {
        self.core.listeners.push(listener);
    }
}

impl IterationStrategy for RepeatTemplate {
    type State = ();

    fn create_state(&self) -> BatchResult<()> {
        Ok(())
    }

    fn get_next_result(
        &self,
        context: &Arc<RepeatContext>,
        callback: &Arc<dyn RepeatCallback>,
        _state: &mut (),
    ) -> anyhow::Result<RepeatStatus> {
        self.core.completion_policy.update(context);
        callback.do_in_iteration(context)
    }

    fn wait_for_results(&self, _state: &mut ()) -> (RepeatStatus, Vec<anyhow::Error>) {
        (RepeatStatus::Continuable, Vec::new())
    }
}

impl RepeatOperations for RepeatTemplate {
    #[tracing::instrument(level = "debug", skip(self, callback))]
    fn iterate(&self, callback: Arc<dyn RepeatCallback>) -> BatchResult<RepeatStatus> {
        self.core.execute(callback, self)
    }
}
