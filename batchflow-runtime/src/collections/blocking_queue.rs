use super::priority_queue::{PriorityQueue, QueueCursor, QueueError};
use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering;
use std::time::{Duration, Instant};

/// Thread-safe [`PriorityQueue`] whose `take` blocks until an element is
/// available.
pub struct BlockingPriorityQueue<T> {
    queue: Mutex<PriorityQueue<T>>,
    not_empty: Condvar,
}

impl<T: Ord + 'static> BlockingPriorityQueue<T> {
    pub fn new() -> Self {
        Self::from_queue(PriorityQueue::new())
    }
}

impl<T: Ord + 'static> Default for BlockingPriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> BlockingPriorityQueue<T> {
    pub fn with_comparator(comparator: impl Fn(&T, &T) -> Ordering + Send + Sync + 'static) -> Self {
        Self::from_queue(PriorityQueue::with_comparator(comparator))
    }

    fn from_queue(queue: PriorityQueue<T>) -> Self {
        Self {
            queue: Mutex::new(queue),
            not_empty: Condvar::new(),
        }
    }

    pub fn add(&self, item: T) {
        self.queue.lock().add(item);
        self.not_empty.notify_one();
    }

    pub fn poll(&self) -> Option<T> {
        self.queue.lock().poll()
    }

    /// Waits until the queue is non-empty, then removes its head.
    pub fn take(&self) -> T {
        let mut queue = self.queue.lock();
        loop {
            if let Some(item) = queue.poll() {
                return item;
            }
            self.not_empty.wait(&mut queue);
        }
    }

    /// Like [`take`](Self::take) but gives up after `timeout`.
    pub fn take_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.queue.lock();
        loop {
            if let Some(item) = queue.poll() {
                return Some(item);
            }
            if self.not_empty.wait_until(&mut queue, deadline).timed_out() {
                return queue.poll();
            }
        }
    }

    /// Inspects the head without removing it.
    pub fn peek_with<R>(&self, inspect: impl FnOnce(Option<&T>) -> R) -> R {
        inspect(self.queue.lock().peek())
    }

    pub fn remove(&self, item: &T) -> bool {
        self.queue.lock().remove(item)
    }

    pub fn contains(&self, item: &T) -> bool {
        self.queue.lock().contains(item)
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn clear(&self) {
        self.queue.lock().clear();
    }

    /// Fail-fast enumeration over clones of the elements.
    pub fn cursor(&self) -> BlockingCursor<'_, T> {
        let cursor = self.queue.lock().cursor();
        BlockingCursor {
            queue: self,
            cursor,
        }
    }
}

impl<T: Clone> BlockingPriorityQueue<T> {
    pub fn peek(&self) -> Option<T> {
        self.queue.lock().peek().cloned()
    }
}

pub struct BlockingCursor<'a, T> {
    queue: &'a BlockingPriorityQueue<T>,
    cursor: QueueCursor,
}

impl<T: Clone> BlockingCursor<'_, T> {
    pub fn move_next(&mut self) -> Result<Option<T>, QueueError> {
        let queue = self.queue.queue.lock();
        Ok(self.cursor.move_next(&*queue)?.cloned())
    }
}
