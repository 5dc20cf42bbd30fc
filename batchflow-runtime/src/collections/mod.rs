//! Sorted queues used by the repeat engine.

mod blocking_queue;
mod priority_queue;

pub use blocking_queue::{BlockingCursor, BlockingPriorityQueue};
pub use priority_queue::{PriorityQueue, QueueCursor, QueueError};
