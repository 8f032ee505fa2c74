//! Condition Queue
//!
//! A FIFO queue whose `take` blocks until an element satisfying a
//! caller-supplied predicate is enqueued. Insertion order is preserved
//! among elements matching the same predicate.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Predicate over queue elements. Implemented for any
/// `Fn(&T) -> bool`, so richer criteria types are passed as closures
/// over their own `matches`.
pub trait Matcher<T> {
    fn matches(&self, item: &T) -> bool;
}

impl<T, F> Matcher<T> for F
where
    F: Fn(&T) -> bool,
{
    fn matches(&self, item: &T) -> bool {
        self(item)
    }
}

/// FIFO queue with predicate-gated blocking removal.
///
/// Waiters are woken whenever an element is added; a waiter completes
/// only when an element matching its own predicate is present, so a
/// later waiter may finish before an earlier one if a matching element
/// arrives for it first.
pub struct ConditionQueue<T> {
    items: Mutex<VecDeque<T>>,
    notify: Notify,
}

impl<T> ConditionQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    /// Append an element, waking all pending waiters.
    pub fn add(&self, item: T) {
        self.items.lock().push_back(item);
        self.notify.notify_waiters();
    }

    /// Append an element, first removing any element satisfying
    /// `matcher`. Returns the displaced element, if any.
    pub fn add_unique<M: Matcher<T>>(&self, matcher: &M, item: T) -> Option<T> {
        let displaced = {
            let mut items = self.items.lock();
            let pos = items.iter().position(|existing| matcher.matches(existing));
            let displaced = pos.and_then(|pos| items.remove(pos));
            items.push_back(item);
            displaced
        };
        self.notify.notify_waiters();
        displaced
    }

    /// Remove and return the earliest-inserted element satisfying
    /// `matcher`, blocking until one exists.
    pub async fn take<M: Matcher<T>>(&self, matcher: &M) -> T {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register for wakeups before scanning, so an add between the
            // scan and the await is not missed.
            notified.as_mut().enable();
            if let Some(item) = self.take_if(matcher) {
                return item;
            }
            notified.await;
        }
    }

    /// As `take`, bounded by `timeout`. Returns `None` on expiry.
    pub async fn poll<M: Matcher<T>>(&self, timeout: Duration, matcher: &M) -> Option<T> {
        tokio::time::timeout(timeout, self.take(matcher)).await.ok()
    }

    /// Remove and return the earliest-inserted element satisfying
    /// `matcher` without blocking.
    pub fn take_if<M: Matcher<T>>(&self, matcher: &M) -> Option<T> {
        let mut items = self.items.lock();
        let pos = items.iter().position(|item| matcher.matches(item));
        pos.and_then(|pos| items.remove(pos))
    }

    /// Whether any element satisfies `matcher`.
    pub fn contains<M: Matcher<T>>(&self, matcher: &M) -> bool {
        self.items.lock().iter().any(|item| matcher.matches(item))
    }

    pub fn size(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

impl<T: PartialEq> ConditionQueue<T> {
    /// Remove the first element equal to `item`. Returns whether an
    /// element was removed.
    pub fn remove(&self, item: &T) -> bool {
        let mut items = self.items.lock();
        if let Some(pos) = items.iter().position(|existing| existing == item) {
            items.remove(pos);
            true
        } else {
            false
        }
    }
}

impl<T: Clone> ConditionQueue<T> {
    /// Snapshot of the queue contents in insertion order.
    pub fn get_copy(&self) -> Vec<T> {
        self.items.lock().iter().cloned().collect()
    }
}

impl<T> Default for ConditionQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn any() -> impl Fn(&i32) -> bool {
        |_: &i32| true
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = ConditionQueue::new();
        queue.add(1);
        queue.add(2);
        queue.add(3);
        assert_eq!(queue.take(&any()).await, 1);
        assert_eq!(queue.take(&any()).await, 2);
        assert_eq!(queue.take(&any()).await, 3);
    }

    #[tokio::test]
    async fn test_take_respects_predicate() {
        let queue = ConditionQueue::new();
        queue.add(1);
        queue.add(2);
        let even = |item: &i32| item % 2 == 0;
        assert_eq!(queue.take(&even).await, 2);
        assert_eq!(queue.size(), 1);
        assert_eq!(queue.get_copy(), vec![1]);
    }

    #[tokio::test]
    async fn test_take_blocks_until_add() {
        let queue = Arc::new(ConditionQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.take(&any()).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        queue.add(7);
        assert_eq!(waiter.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_poll_times_out() {
        let queue: ConditionQueue<i32> = ConditionQueue::new();
        assert_eq!(queue.poll(Duration::from_millis(50), &any()).await, None);
    }

    #[tokio::test]
    async fn test_later_waiter_can_complete_first() {
        let queue = Arc::new(ConditionQueue::new());
        let first = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.take(&|item: &i32| *item == 1).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.take(&|item: &i32| *item == 2).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        queue.add(2);
        assert_eq!(second.await.unwrap(), 2);
        assert!(!first.is_finished());

        queue.add(1);
        assert_eq!(first.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_add_unique_displaces_match() {
        let queue = ConditionQueue::new();
        queue.add(10);
        queue.add(20);
        let displaced = queue.add_unique(&|item: &i32| *item == 10, 11);
        assert_eq!(displaced, Some(10));
        assert_eq!(queue.size(), 2);
        assert_eq!(queue.get_copy(), vec![20, 11]);
    }

    #[tokio::test]
    async fn test_add_unique_without_match_appends() {
        let queue = ConditionQueue::new();
        queue.add(10);
        let displaced = queue.add_unique(&|item: &i32| *item == 99, 11);
        assert_eq!(displaced, None);
        assert_eq!(queue.get_copy(), vec![10, 11]);
    }

    #[tokio::test]
    async fn test_remove_and_contains() {
        let queue = ConditionQueue::new();
        queue.add(5);
        assert!(queue.contains(&|item: &i32| *item == 5));
        assert!(queue.remove(&5));
        assert!(!queue.remove(&5));
        assert!(queue.is_empty());
    }
}
