use super::context::RepeatContext;
use batchflow_core::Attribute;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Decides what happens to an error raised by a repeat callback. Returning
/// the error (or another one) ends the loop with it.
pub trait ExceptionHandler: Send + Sync {
    fn handle_exception(&self, context: &RepeatContext, error: anyhow::Error) -> anyhow::Result<()>;
}

/// Rethrows every error.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultExceptionHandler;

impl ExceptionHandler for DefaultExceptionHandler {
    fn handle_exception(&self, _context: &RepeatContext, error: anyhow::Error) -> anyhow::Result<()> {
        Err(error)
    }
}

const COUNTER_KEY: &str = "SimpleLimitExceptionHandler.count";

/// Swallows up to `limit` errors per loop, then rethrows.
#[derive(Debug, Clone, Copy)]
pub struct SimpleLimitExceptionHandler {
    limit: usize,
    use_parent: bool,
}

impl SimpleLimitExceptionHandler {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            use_parent: false,
        }
    }

    /// Counts errors on the enclosing loop's context, so the limit spans
    /// every inner loop it runs.
    pub fn use_parent(mut self, use_parent: bool) -> Self {
        self.use_parent = use_parent;
        self
    }

    fn counter(&self, context: &RepeatContext) -> Arc<AtomicUsize> {
        let target = match (self.use_parent, context.parent()) {
            (true, Some(parent)) => parent.as_ref(),
            _ => context,
        };
        let counter = target
            .attributes()
            .get_or_insert_with(COUNTER_KEY, || -> Attribute { Arc::new(AtomicUsize::new(0)) });
        match counter.downcast::<AtomicUsize>() {
            Ok(counter) => counter,
            Err(_) => Arc::new(AtomicUsize::new(usize::MAX)),
        }
    }
}

impl Default for SimpleLimitExceptionHandler {
    fn default() -> Self {
        Self::new(0)
    }
}

impl ExceptionHandler for SimpleLimitExceptionHandler {
    fn handle_exception(&self, context: &RepeatContext, error: anyhow::Error) -> anyhow::Result<()> {
        let count = self.counter(context).fetch_add(1, Ordering::SeqCst).saturating_add(1);
        if count > self.limit {
            return Err(error);
        }
        tracing::debug!(count, limit = self.limit, error = %error, "ignoring error within limit");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_rethrows() {
        let context = RepeatContext::new(None);
        let result = DefaultExceptionHandler.handle_exception(&context, anyhow::anyhow!("boom"));
        assert_eq!(result.unwrap_err().to_string(), "boom");
    }

    #[test]
    fn test_limit_swallows_then_rethrows() {
        let handler = SimpleLimitExceptionHandler::new(2);
        let context = RepeatContext::new(None);
        assert!(handler.handle_exception(&context, anyhow::anyhow!("1")).is_ok());
        assert!(handler.handle_exception(&context, anyhow::anyhow!("2")).is_ok());
        assert!(handler.handle_exception(&context, anyhow::anyhow!("3")).is_err());

        let fresh = RepeatContext::new(None);
        assert!(handler.handle_exception(&fresh, anyhow::anyhow!("1")).is_ok());
    }

    #[test]
    fn test_limit_counted_on_parent() {
        let handler = SimpleLimitExceptionHandler::new(1).use_parent(true);
        let parent = Arc::new(RepeatContext::new(None));
        let first = RepeatContext::new(Some(parent.clone()));
        let second = RepeatContext::new(Some(parent));
        assert!(handler.handle_exception(&first, anyhow::anyhow!("a")).is_ok());
        assert!(handler.handle_exception(&second, anyhow::anyhow!("b")).is_err());
    }
}
