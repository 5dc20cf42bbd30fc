use batchflow_core::{Attribute, ScopeAttributes};
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// State of one repeat loop, shared with the callbacks it runs.
///
/// Nested loops link to the enclosing loop's context through `parent`.
pub struct RepeatContext {
    parent: Option<Arc<RepeatContext>>,
    children: Vec<Arc<RepeatContext>>,
    started_count: AtomicUsize,
    complete_only: AtomicBool,
    terminate_only: AtomicBool,
    start_time: Instant,
    attributes: ScopeAttributes,
}

impl RepeatContext {
    pub fn new(parent: Option<Arc<RepeatContext>>) -> Self {
        Self::with_children(parent, Vec::new())
    }

    /// Context of a composite policy: one child context per member policy.
    pub fn with_children(parent: Option<Arc<RepeatContext>>, children: Vec<Arc<RepeatContext>>) -> Self {
        Self {
            parent,
            children,
            started_count: AtomicUsize::new(0),
            complete_only: AtomicBool::new(false),
            terminate_only: AtomicBool::new(false),
            start_time: Instant::now(),
            attributes: ScopeAttributes::default(),
        }
    }

    pub fn parent(&self) -> Option<&Arc<RepeatContext>> {
        self.parent.as_ref()
    }

    pub fn children(&self) -> &[Arc<RepeatContext>] {
        &self.children
    }

    pub fn started_count(&self) -> usize {
        self.started_count.load(Ordering::SeqCst)
    }

    pub fn increment(&self) {
        self.started_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Asks the loop to finish after the current iteration.
    pub fn set_complete_only(&self) {
        self.complete_only.store(true, Ordering::SeqCst);
    }

    pub fn is_complete_only(&self) -> bool {
        self.complete_only.load(Ordering::SeqCst)
    }

    /// Asks the loop to stop as soon as possible; implies complete-only.
    pub fn set_terminate_only(&self) {
        self.terminate_only.store(true, Ordering::SeqCst);
        self.set_complete_only();
    }

    pub fn is_terminate_only(&self) -> bool {
        self.terminate_only.load(Ordering::SeqCst)
    }

    /// True when this context or any enclosing one was marked complete.
    pub fn is_marked_complete(&self) -> bool {
        if self.is_complete_only() {
            return true;
        }
        match &self.parent {
            Some(parent) => parent.is_marked_complete(),
            None => false,
        }
    }

    pub fn attributes(&self) -> &ScopeAttributes {
        &self.attributes
    }

    pub fn set_attribute(&self, name: impl Into<String>, value: Attribute) {
        self.attributes.set(name, value);
    }

    pub fn get_attribute(&self, name: &str) -> Option<Attribute> {
        self.attributes.get(name)
    }

    pub fn register_destruction_callback(
        &self,
        name: impl Into<String>,
        callback: impl FnOnce() -> anyhow::Result<()> + Send + 'static,
    ) {
        self.attributes.register_destruction_callback(name, callback);
    }

    /// Runs the destruction callbacks.
    pub fn close(&self) -> anyhow::Result<()> {
        self.attributes.close()
    }
}

impl std::fmt::Debug for RepeatContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepeatContext")
            .field("started_count", &self.started_count())
            .field("complete_only", &self.is_complete_only())
            .field("terminate_only", &self.is_terminate_only())
            .field("has_parent", &self.parent.is_some())
            .finish()
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<RepeatContext>>> = const { RefCell::new(None) };
}

/// Thread-local holder of the repeat context the current thread works in.
pub struct RepeatSynchronizationManager;

impl RepeatSynchronizationManager {
    /// Makes `context` current and returns the one it replaces.
    pub fn register(context: Arc<RepeatContext>) -> Option<Arc<RepeatContext>> {
        CURRENT.with(|current| current.borrow_mut().replace(context))
    }

    pub fn get_context() -> Option<Arc<RepeatContext>> {
        CURRENT.with(|current| current.borrow().clone())
    }

    pub fn clear() -> Option<Arc<RepeatContext>> {
        CURRENT.with(|current| current.borrow_mut().take())
    }

    /// Marks the current context complete.
    pub fn set_complete_only() {
        if let Some(context) = Self::get_context() {
            context.set_complete_only();
        }
    }

    /// Marks the current context and all of its ancestors complete.
    pub fn set_ancestors_complete_only() {
        let mut next = Self::get_context();
        while let Some(context) = next {
            context.set_complete_only();
            next = context.parent().cloned();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marked_complete_through_parent() {
        let parent = Arc::new(RepeatContext::new(None));
        let child = RepeatContext::new(Some(parent.clone()));
        assert!(!child.is_marked_complete());
        parent.set_complete_only();
        assert!(child.is_marked_complete());
        assert!(!child.is_complete_only());
    }

    #[test]
    fn test_terminate_implies_complete() {
        let context = RepeatContext::new(None);
        context.set_terminate_only();
        assert!(context.is_terminate_only());
        assert!(context.is_marked_complete());
    }

    #[test]
    fn test_thread_local_registration() {
        let outer = Arc::new(RepeatContext::new(None));
        let inner = Arc::new(RepeatContext::new(Some(outer.clone())));
        assert!(RepeatSynchronizationManager::register(outer.clone()).is_none());
        let previous = RepeatSynchronizationManager::register(inner.clone());
        assert!(previous.is_some());

        RepeatSynchronizationManager::set_ancestors_complete_only();
        assert!(inner.is_complete_only());
        assert!(outer.is_complete_only());

        let other_thread = std::thread::spawn(RepeatSynchronizationManager::get_context)
            .join()
            .unwrap();
        assert!(other_thread.is_none());

        assert!(RepeatSynchronizationManager::clear().is_some());
        assert!(RepeatSynchronizationManager::get_context().is_none());
    }

    #[test]
    fn test_close_runs_callbacks() {
        let context = RepeatContext::new(None);
        let flag = Arc::new(AtomicBool::new(false));
        let seen = flag.clone();
        context.register_destruction_callback("flag", move || {
            seen.store(true, Ordering::SeqCst);
            Ok(())
        });
        context.close().unwrap();
        assert!(flag.load(Ordering::SeqCst));
    }
}
