use super::context::RepeatContext;
use super::status::RepeatStatus;

/// Hooks around a repeat loop.
///
/// `open` and `before` run in registration order; `after`, `on_error` and
/// `close` run in reverse.
pub trait RepeatListener: Send + Sync {
    fn open(&self, _context: &RepeatContext) {}

    fn before(&self, _context: &RepeatContext) {}

    /// Only called for continuable results.
    fn after(&self, _context: &RepeatContext, _result: RepeatStatus) {}

    fn on_error(&self, _context: &RepeatContext, _error: &anyhow::Error) {}

    fn close(&self, _context: &RepeatContext) {}
}
