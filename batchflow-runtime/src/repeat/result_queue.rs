use super::context::RepeatContext;
use super::status::RepeatStatus;
use crate::collections::BlockingPriorityQueue;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResultQueueError {
    #[error("no results are expected")]
    NothingExpected,
    #[error("more results were put than expected ({expected})")]
    Unexpected { expected: usize },
    #[error("result queue throttle is closed")]
    Closed,
}

/// Outcome of one dispatched iteration together with the context it ran in.
pub struct ResultHolder {
    pub result: anyhow::Result<RepeatStatus>,
    pub context: Arc<RepeatContext>,
}

impl ResultHolder {
    pub fn new(result: anyhow::Result<RepeatStatus>, context: Arc<RepeatContext>) -> Self {
        Self { result, context }
    }

    fn rank(&self) -> u8 {
        match &self.result {
            Err(_) => 0,
            Ok(RepeatStatus::Finished) => 1,
            Ok(RepeatStatus::Continuable) => 2,
        }
    }

    fn is_continuable(&self) -> bool {
        matches!(self.result, Ok(RepeatStatus::Continuable))
    }
}

/// Collects results of iterations running on other threads.
///
/// At most `throttle_limit` results are outstanding at once: [`expect`]
/// blocks until a slot is free and [`put`] frees it. Errors are taken first,
/// then finished results, then continuable ones. A non-continuable head is
/// only handed out once every expected result has arrived.
///
/// [`expect`]: ResultHolderQueue::expect
/// [`put`]: ResultHolderQueue::put
pub struct ResultHolderQueue {
    results: BlockingPriorityQueue<ResultHolder>,
    expected: Mutex<usize>,
    arrived: Condvar,
    throttle: Semaphore,
}

impl ResultHolderQueue {
    pub fn new(throttle_limit: usize) -> Self {
        Self {
            results: BlockingPriorityQueue::with_comparator(|a: &ResultHolder, b: &ResultHolder| {
                a.rank().cmp(&b.rank())
            }),
            expected: Mutex::new(0),
            arrived: Condvar::new(),
            throttle: Semaphore::new(throttle_limit.max(1)),
        }
    }

    /// Announces a result that will be put later. Blocks while the throttle
    /// limit is reached.
    pub fn expect(&self) -> Result<(), ResultQueueError> {
        let permit = futures::executor::block_on(self.throttle.acquire())
            .map_err(|_| ResultQueueError::Closed)?;
        permit.forget();
        *self.expected.lock() += 1;
        Ok(())
    }

    /// Withdraws an expectation whose work was never dispatched.
    pub fn unexpect(&self) {
        let mut expected = self.expected.lock();
        if *expected > self.results.len() {
            *expected -= 1;
            self.throttle.add_permits(1);
            self.arrived.notify_all();
        }
    }

    pub fn put(&self, holder: ResultHolder) -> Result<(), ResultQueueError> {
        let expected = self.expected.lock();
        if *expected <= self.results.len() {
            return Err(ResultQueueError::Unexpected {
                expected: *expected,
            });
        }
        self.results.add(holder);
        self.throttle.add_permits(1);
        self.arrived.notify_all();
        Ok(())
    }

    pub fn take(&self) -> Result<ResultHolder, ResultQueueError> {
        let mut expected = self.expected.lock();
        if *expected == 0 {
            return Err(ResultQueueError::NothingExpected);
        }
        loop {
            let head_continuable = self
                .results
                .peek_with(|head| head.is_some_and(ResultHolder::is_continuable));
            let all_arrived = *expected <= self.results.len() && !self.results.is_empty();
            if head_continuable || all_arrived {
                break;
            }
            self.arrived.wait(&mut expected);
        }
        match self.results.poll() {
            Some(holder) => {
                *expected -= 1;
                Ok(holder)
            }
            None => Err(ResultQueueError::NothingExpected),
        }
    }

    /// True while results are still owed or waiting to be taken.
    pub fn is_expecting(&self) -> bool {
        *self.expected.lock() > 0
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn holder(result: anyhow::Result<RepeatStatus>) -> ResultHolder {
        ResultHolder::new(result, Arc::new(RepeatContext::new(None)))
    }

    #[test]
    fn test_take_without_expectation_fails() {
        let queue = ResultHolderQueue::new(2);
        assert_eq!(queue.take().err(), Some(ResultQueueError::NothingExpected));
        assert!(queue.put(holder(Ok(RepeatStatus::Finished))).is_err());
    }

    #[test]
    fn test_continuable_taken_immediately() {
        let queue = ResultHolderQueue::new(2);
        queue.expect().unwrap();
        queue.expect().unwrap();
        queue.put(holder(Ok(RepeatStatus::Continuable))).unwrap();

        let taken = queue.take().unwrap();
        assert!(taken.is_continuable());
        assert!(queue.is_expecting());
    }

    #[test]
    fn test_errors_ordered_first_once_all_arrived() {
        let queue = Arc::new(ResultHolderQueue::new(3));
        for _ in 0..3 {
            queue.expect().unwrap();
        }
        queue.put(holder(Ok(RepeatStatus::Finished))).unwrap();

        let producer = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                queue.put(holder(Err(anyhow::anyhow!("broken")))).unwrap();
                queue.put(holder(Ok(RepeatStatus::Continuable))).unwrap();
            })
        };

        let mut ranks = vec![queue.take().unwrap().rank()];
        producer.join().unwrap();
        while queue.is_expecting() {
            ranks.push(queue.take().unwrap().rank());
        }
        assert_eq!(ranks, vec![0, 1, 2]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_throttle_blocks_until_put() {
        let queue = Arc::new(ResultHolderQueue::new(1));
        queue.expect().unwrap();

        let waiter = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                queue.expect().unwrap();
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());

        queue.put(holder(Ok(RepeatStatus::Finished))).unwrap();
        waiter.join().unwrap();
        queue.put(holder(Ok(RepeatStatus::Finished))).unwrap();
        assert_eq!(queue.take().unwrap().rank(), 1);
        assert_eq!(queue.take().unwrap().rank(), 1);
        assert!(!queue.is_expecting());
    }

    #[test]
    fn test_unexpect_releases_slot() {
        let queue = ResultHolderQueue::new(1);
        queue.expect().unwrap();
        queue.unexpect();
        assert!(!queue.is_expecting());
        queue.expect().unwrap();
        assert!(queue.is_expecting());
    }
}
