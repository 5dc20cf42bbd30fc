//! Thread-scoped, reference-counted registry of execution contexts.
//!
//! Each thread keeps a stack of the executions it has registered. Contexts
//! live in a registry shared by all threads: registering the same execution
//! from several threads hands out the same context, and the context is dropped
//! from the registry when the last registrant closes it.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};
use uuid::Uuid;

/// An execution that can be registered with a [`SynchronizationManager`].
///
/// Clones of the same execution share a scope id and therefore a context.
pub trait ScopedExecution {
    fn scope_id(&self) -> Uuid;
}

impl<T: ScopedExecution> ScopedExecution for Arc<Mutex<T>> {
    fn scope_id(&self) -> Uuid {
        self.lock().scope_id()
    }
}

/// A context with domain-specific cleanup, run by
/// [`SynchronizationManager::release`].
pub trait ScopeContext: Send + Sync {
    fn close(&self) -> anyhow::Result<()>;
}

type ContextSlot<C> = Arc<OnceLock<Arc<C>>>;

struct Registry<C> {
    contexts: HashMap<Uuid, ContextSlot<C>>,
    counts: HashMap<Uuid, usize>,
}

type ContextFactory<E, C> = Box<dyn Fn(&E) -> C + Send + Sync>;

pub struct SynchronizationManager<E, C> {
    name: &'static str,
    stacks: DashMap<ThreadId, Vec<Uuid>>,
    registry: Mutex<Registry<C>>,
    factory: ContextFactory<E, C>,
}

impl<E, C> SynchronizationManager<E, C>
where
    E: ScopedExecution,
    C: Send + Sync,
{
    /// Creates a manager; `factory` builds the context the first time an
    /// execution is registered.
    pub fn new(
        name: &'static str,
        factory: impl Fn(&E) -> C + Send + Sync + 'static,
    ) -> Self {
        Self {
            name,
            stacks: DashMap::new(),
            registry: Mutex::new(Registry {
                contexts: HashMap::new(),
                counts: HashMap::new(),
            }),
            factory: Box::new(factory),
        }
    }

    /// Registers `execution` on the current thread and returns its context.
    ///
    /// A missing execution is a silent no-op so callers may or may not be
    /// inside a scope. The factory runs outside the registry lock, exactly
    /// once per live scope.
    pub fn register(&self, execution: Option<&E>) -> Option<Arc<C>> {
        let execution = execution?;
        let id = execution.scope_id();

        self.stacks
            .entry(thread::current().id())
            .or_default()
            .push(id);

        let slot = {
            let mut registry = self.registry.lock();
            let slot = registry
                .contexts
                .entry(id)
                .or_insert_with(|| Arc::new(OnceLock::new()))
                .clone();
            *registry.counts.entry(id).or_insert(0) += 1;
            slot
        };

        let context = slot
            .get_or_init(|| {
                tracing::debug!(manager = self.name, scope = %id, "creating scope context");
                Arc::new((self.factory)(execution))
            })
            .clone();
        Some(context)
    }

    /// Context of the innermost execution registered on this thread.
    pub fn get_context(&self) -> Option<Arc<C>> {
        let id = self.current_scope_id()?;
        let registry = self.registry.lock();
        registry
            .contexts
            .get(&id)
            .and_then(|slot| slot.get().cloned())
    }

    /// Scope id of the innermost execution registered on this thread.
    pub fn current_scope_id(&self) -> Option<Uuid> {
        self.stacks
            .get(&thread::current().id())
            .and_then(|stack| stack.last().copied())
    }

    /// Pops this thread's innermost registration.
    ///
    /// When no thread holds the execution any more its context is removed
    /// from the registry. The context itself is not closed here.
    pub fn close(&self) {
        self.unregister();
    }

    /// Pops the innermost registration and returns the context if this was
    /// its last registrant.
    fn unregister(&self) -> Option<Arc<C>> {
        let thread = thread::current().id();
        let popped = match self.stacks.get_mut(&thread) {
            Some(mut stack) => stack.pop(),
            None => None,
        };
        self.stacks.remove_if(&thread, |_, stack| stack.is_empty());

        let Some(id) = popped else {
            tracing::debug!(manager = self.name, "close called with no registered execution");
            return None;
        };

        let mut registry = self.registry.lock();
        let remaining = match registry.counts.get_mut(&id) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => 0,
        };
        if remaining > 0 {
            return None;
        }
        registry.counts.remove(&id);
        let released = registry.contexts.remove(&id).and_then(|slot| slot.get().cloned());
        tracing::debug!(manager = self.name, scope = %id, "scope context released");
        released
    }

    /// Number of live registrations (across all threads) for `execution`.
    pub fn registration_count(&self, execution: &E) -> usize {
        let id = execution.scope_id();
        self.registry.lock().counts.get(&id).copied().unwrap_or(0)
    }

    pub fn is_registered(&self, execution: &E) -> bool {
        self.registration_count(execution) > 0
    }

    /// Number of contexts currently held by the registry.
    pub fn active_contexts(&self) -> usize {
        self.registry.lock().contexts.len()
    }
}

impl<E, C> SynchronizationManager<E, C>
where
    E: ScopedExecution,
    C: ScopeContext,
{
    /// Unregisters the current execution. The last registrant to leave also
    /// closes the context.
    pub fn release(&self) -> anyhow::Result<()> {
        match self.unregister() {
            Some(context) => context.close(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;

    #[derive(Clone)]
    struct Exec(Uuid);

    impl ScopedExecution for Exec {
        fn scope_id(&self) -> Uuid {
            self.0
        }
    }

    struct Ctx {
        owner: Uuid,
        closed: AtomicUsize,
    }

    impl ScopeContext for Ctx {
        fn close(&self) -> anyhow::Result<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("close failed")
        }
    }

    fn manager(created: Arc<AtomicUsize>) -> SynchronizationManager<Exec, Ctx> {
        SynchronizationManager::new("test", move |exec: &Exec| {
            created.fetch_add(1, Ordering::SeqCst);
            Ctx {
                owner: exec.0,
                closed: AtomicUsize::new(0),
            }
        })
    }

    #[test]
    fn test_register_none_is_noop() {
        let mgr = manager(Arc::new(AtomicUsize::new(0)));
        assert!(mgr.register(None).is_none());
        assert!(mgr.get_context().is_none());
        mgr.close();
        assert_eq!(mgr.active_contexts(), 0);
    }

    #[test]
    fn test_nested_registration_restores_outer_context() {
        let mgr = manager(Arc::new(AtomicUsize::new(0)));
        let outer = Exec(Uuid::new_v4());
        let inner = Exec(Uuid::new_v4());

        mgr.register(Some(&outer));
        mgr.register(Some(&inner));
        assert_eq!(mgr.get_context().unwrap().owner, inner.0);

        mgr.close();
        assert_eq!(mgr.get_context().unwrap().owner, outer.0);
        mgr.close();
        assert!(mgr.get_context().is_none());
        assert_eq!(mgr.active_contexts(), 0);
    }

    #[test]
    fn test_same_execution_twice_on_one_thread_shares_context() {
        let created = Arc::new(AtomicUsize::new(0));
        let mgr = manager(created.clone());
        let exec = Exec(Uuid::new_v4());

        let first = mgr.register(Some(&exec)).unwrap();
        let second = mgr.register(Some(&exec)).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(mgr.registration_count(&exec), 2);

        mgr.close();
        assert_eq!(mgr.active_contexts(), 1);
        mgr.close();
        assert_eq!(mgr.active_contexts(), 0);
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_registration_creates_one_context() {
        const THREADS: usize = 8;
        let created = Arc::new(AtomicUsize::new(0));
        let mgr = Arc::new(manager(created.clone()));
        let exec = Exec(Uuid::new_v4());
        let registered = Arc::new(Barrier::new(THREADS));
        let closing = Arc::new(Barrier::new(THREADS + 1));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let mgr = mgr.clone();
                let exec = exec.clone();
                let registered = registered.clone();
                let closing = closing.clone();
                thread::spawn(move || {
                    let ctx = mgr.register(Some(&exec)).unwrap();
                    assert_eq!(ctx.owner, exec.0);
                    registered.wait();
                    closing.wait();
                    mgr.close();
                })
            })
            .collect();

        closing.wait();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(mgr.registration_count(&exec), 0);
        assert!(!mgr.is_registered(&exec));
        assert_eq!(mgr.active_contexts(), 0);
    }

    #[test]
    fn test_context_survives_until_last_close() {
        let mgr = Arc::new(manager(Arc::new(AtomicUsize::new(0))));
        let exec = Exec(Uuid::new_v4());
        mgr.register(Some(&exec));

        let worker = {
            let mgr = mgr.clone();
            let exec = exec.clone();
            thread::spawn(move || {
                mgr.register(Some(&exec));
                mgr.close();
            })
        };
        worker.join().unwrap();

        assert_eq!(mgr.active_contexts(), 1);
        assert!(mgr.get_context().is_some());
        mgr.close();
        assert_eq!(mgr.active_contexts(), 0);
    }

    #[test]
    fn test_release_closes_even_when_domain_close_fails() {
        let mgr = manager(Arc::new(AtomicUsize::new(0)));
        let exec = Exec(Uuid::new_v4());
        let ctx = mgr.register(Some(&exec)).unwrap();

        assert!(mgr.release().is_err());
        assert_eq!(ctx.closed.load(Ordering::SeqCst), 1);
        assert!(mgr.get_context().is_none());
        assert_eq!(mgr.active_contexts(), 0);
    }

    #[test]
    fn test_release_by_inner_registrant_keeps_context_open() {
        let mgr = manager(Arc::new(AtomicUsize::new(0)));
        let exec = Exec(Uuid::new_v4());
        let ctx = mgr.register(Some(&exec)).unwrap();
        mgr.register(Some(&exec));

        assert!(mgr.release().is_ok());
        assert_eq!(ctx.closed.load(Ordering::SeqCst), 0);
        assert!(mgr.release().is_err());
        assert_eq!(ctx.closed.load(Ordering::SeqCst), 1);
    }
}
