use std::cmp::Ordering;
use std::collections::VecDeque;
use std::fmt;
use thiserror::Error;

const DEFAULT_CAPACITY: usize = 11;
const MAX_CAPACITY: usize = isize::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("queue was modified while it was being enumerated")]
    ConcurrentModification,
}

type Comparator<T> = Box<dyn Fn(&T, &T) -> Ordering + Send + Sync>;

/// Queue kept sorted by a comparator; the head is always the minimum.
///
/// Elements that compare equal leave in insertion order.
pub struct PriorityQueue<T> {
    items: VecDeque<T>,
    comparator: Comparator<T>,
    version: u64,
}

impl<T: Ord + 'static> PriorityQueue<T> {
    /// Queue in natural order.
    pub fn new() -> Self {
        Self::with_comparator(T::cmp)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_comparator(capacity, T::cmp)
    }
}

impl<T: Ord + 'static> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PriorityQueue<T> {
    pub fn with_comparator(comparator: impl Fn(&T, &T) -> Ordering + Send + Sync + 'static) -> Self {
        Self::with_capacity_and_comparator(DEFAULT_CAPACITY, comparator)
    }

    pub fn with_capacity_and_comparator(
        capacity: usize,
        comparator: impl Fn(&T, &T) -> Ordering + Send + Sync + 'static,
    ) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity.min(MAX_CAPACITY)),
            comparator: Box::new(comparator),
            version: 0,
        }
    }

    /// Inserts after every element comparing equal to `item`.
    pub fn add(&mut self, item: T) {
        self.grow_if_full();
        let comparator = &self.comparator;
        let index = self
            .items
            .partition_point(|existing| comparator(existing, &item) != Ordering::Greater);
        self.items.insert(index, item);
        self.version += 1;
    }

    pub fn offer(&mut self, item: T) {
        self.add(item);
    }

    pub fn poll(&mut self) -> Option<T> {
        let item = self.items.pop_front()?;
        self.version += 1;
        Some(item)
    }

    pub fn peek(&self) -> Option<&T> {
        self.items.front()
    }

    /// Removes the first element the comparator considers equal to `item`.
    pub fn remove(&mut self, item: &T) -> bool {
        match self.position(item) {
            Some(index) => {
                self.items.remove(index);
                self.version += 1;
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, item: &T) -> bool {
        self.position(item).is_some()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.items.capacity()
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.version += 1;
    }

    /// Removes every element, smallest first.
    pub fn drain_sorted(&mut self) -> Vec<T> {
        self.version += 1;
        self.items.drain(..).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    /// Starts a fail-fast enumeration; see [`QueueCursor`].
    pub fn cursor(&self) -> QueueCursor {
        QueueCursor {
            version: self.version,
            index: 0,
        }
    }

    pub(crate) fn version(&self) -> u64 {
        self.version
    }

    fn position(&self, item: &T) -> Option<usize> {
        let comparator = &self.comparator;
        let start = self
            .items
            .partition_point(|existing| comparator(existing, item) == Ordering::Less);
        (start < self.items.len() && comparator(&self.items[start], item) == Ordering::Equal)
            .then_some(start)
    }

    fn grow_if_full(&mut self) {
        let len = self.items.len();
        if len < self.items.capacity() {
            return;
        }
        let target = len.saturating_mul(2).clamp(DEFAULT_CAPACITY, MAX_CAPACITY);
        self.items.reserve_exact(target.saturating_sub(len).max(1));
    }
}

impl<T: fmt::Debug> fmt::Debug for PriorityQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.items.iter()).finish()
    }
}

/// Position in a queue enumeration, detached from the queue so the queue can
/// still be mutated; the next `move_next` then reports the modification.
#[derive(Debug, Clone)]
pub struct QueueCursor {
    version: u64,
    index: usize,
}

impl QueueCursor {
    pub fn move_next<'a, T>(&mut self, queue: &'a PriorityQueue<T>) -> Result<Option<&'a T>, QueueError> {
        if queue.version() != self.version {
            return Err(QueueError::ConcurrentModification);
        }
        let item = queue.items.get(self.index);
        if item.is_some() {
            self.index += 1;
        }
        Ok(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_natural_order_poll() {
        let mut queue = PriorityQueue::new();
        for value in [5, 3, 8, 1] {
            queue.add(value);
        }
        let polled: Vec<i32> = std::iter::from_fn(|| queue.poll()).collect();
        assert_eq!(polled, vec![1, 3, 5, 8]);
        assert_eq!(queue.poll(), None);
        assert_eq!(queue.peek(), None);
    }

    #[test]
    fn test_comparator_order_and_remove() {
        let mut queue = PriorityQueue::with_comparator(|a: &i32, b: &i32| b.cmp(a));
        queue.add(2);
        queue.offer(9);
        queue.add(4);
        assert_eq!(queue.peek(), Some(&9));
        assert!(queue.contains(&4));
        assert!(queue.remove(&4));
        assert!(!queue.remove(&4));
        assert_eq!(queue.drain_sorted(), vec![9, 2]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_capacity_grows() {
        let mut queue = PriorityQueue::with_capacity(2);
        for value in 0..100 {
            queue.add(value);
        }
        assert_eq!(queue.len(), 100);
        assert!(queue.capacity() >= 100);
    }

    #[test]
    fn test_cursor_fails_after_mutation() {
        let mut queue = PriorityQueue::new();
        queue.add(1);
        queue.add(2);

        let mut cursor = queue.cursor();
        assert_eq!(cursor.move_next(&queue), Ok(Some(&1)));
        queue.add(0);
        assert_eq!(
            cursor.move_next(&queue),
            Err(QueueError::ConcurrentModification)
        );

        let mut cursor = queue.cursor();
        let mut seen = Vec::new();
        while let Some(item) = cursor.move_next(&queue).unwrap() {
            seen.push(*item);
        }
        assert_eq!(seen, vec![0, 1, 2]);
    }

    proptest! {
        #[test]
        fn prop_poll_yields_sorted_stable_sequence(keys in prop::collection::vec(0u8..16, 0..64)) {
            let mut queue = PriorityQueue::with_comparator(|a: &(u8, usize), b: &(u8, usize)| a.0.cmp(&b.0));
            for (seq, key) in keys.iter().enumerate() {
                queue.add((*key, seq));
            }

            let mut previous: Option<(u8, usize)> = None;
            while let Some(head) = queue.peek().copied() {
                let polled = queue.poll().unwrap();
                prop_assert_eq!(head, polled);
                if let Some(prev) = previous {
                    prop_assert!(prev.0 <= polled.0);
                    if prev.0 == polled.0 {
                        prop_assert!(prev.1 < polled.1);
                    }
                }
                previous = Some(polled);
            }
            prop_assert!(queue.is_empty());
        }
    }
}
