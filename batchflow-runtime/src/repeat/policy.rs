//! Completion policies deciding when a repeat loop ends.

use super::context::RepeatContext;
use super::status::RepeatStatus;
use std::sync::Arc;
use std::time::Duration;

pub trait CompletionPolicy: Send + Sync {
    /// Creates the context for a new loop nested in `parent`.
    fn start(&self, parent: Option<Arc<RepeatContext>>) -> Arc<RepeatContext> {
        Arc::new(RepeatContext::new(parent))
    }

    /// Records that another iteration is starting.
    fn update(&self, context: &RepeatContext) {
        context.increment();
    }

    /// Decision after an iteration produced `result`.
    fn is_complete_with(&self, context: &RepeatContext, result: RepeatStatus) -> bool {
        !result.is_continuable() || self.is_complete(context)
    }

    /// Decision without a fresh result, e.g. before dispatching more work.
    fn is_complete(&self, context: &RepeatContext) -> bool;
}

/// Completes as soon as an iteration reports that it is finished.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultResultCompletionPolicy;

impl CompletionPolicy for DefaultResultCompletionPolicy {
    fn is_complete(&self, _context: &RepeatContext) -> bool {
        false
    }
}

/// Completes after a fixed number of iterations.
#[derive(Debug, Clone, Copy)]
pub struct SimpleCompletionPolicy {
    chunk_size: usize,
}

impl SimpleCompletionPolicy {
    pub const DEFAULT_CHUNK_SIZE: usize = 5;

    pub fn new(chunk_size: usize) -> Self {
        Self { chunk_size }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }
}

impl Default for SimpleCompletionPolicy {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CHUNK_SIZE)
    }
}

impl CompletionPolicy for SimpleCompletionPolicy {
    fn is_complete(&self, context: &RepeatContext) -> bool {
        context.started_count() >= self.chunk_size
    }
}

/// Completes once the loop has been running for longer than `timeout`.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutTerminationPolicy {
    timeout: Duration,
}

impl TimeoutTerminationPolicy {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl CompletionPolicy for TimeoutTerminationPolicy {
    fn is_complete(&self, context: &RepeatContext) -> bool {
        context.elapsed() >= self.timeout
    }
}

/// Completes as soon as any member policy does. Each member works on its own
/// child context.
#[derive(Default, Clone)]
pub struct CompositeCompletionPolicy {
    policies: Vec<Arc<dyn CompletionPolicy>>,
}

impl CompositeCompletionPolicy {
    pub fn new(policies: Vec<Arc<dyn CompletionPolicy>>) -> Self {
        Self { policies }
    }

    fn members<'a>(
        &'a self,
        context: &'a RepeatContext,
    ) -> impl Iterator<Item = (&'a Arc<dyn CompletionPolicy>, &'a Arc<RepeatContext>)> {
        self.policies.iter().zip(context.children())
    }
}

impl CompletionPolicy for CompositeCompletionPolicy {
    fn start(&self, parent: Option<Arc<RepeatContext>>) -> Arc<RepeatContext> {
        let children = self
            .policies
            .iter()
            .map(|policy| policy.start(parent.clone()))
            .collect();
        Arc::new(RepeatContext::with_children(parent, children))
    }

    fn update(&self, context: &RepeatContext) {
        context.increment();
        for (policy, child) in self.members(context) {
            policy.update(child);
        }
    }

    fn is_complete_with(&self, context: &RepeatContext, result: RepeatStatus) -> bool {
        self.members(context)
            .any(|(policy, child)| policy.is_complete_with(child, result))
    }

    fn is_complete(&self, context: &RepeatContext) -> bool {
        self.members(context)
            .any(|(policy, child)| policy.is_complete(child))
    }
}
