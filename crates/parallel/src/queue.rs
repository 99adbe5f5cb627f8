//! Shared work queue

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

/// FIFO of work items shared by a pool of workers.
///
/// Each idle worker pops the next item until the queue is empty, so uneven
/// items balance out across workers.
#[derive(Debug)]
pub struct WorkQueue<T> {
    items: Mutex<VecDeque<T>>,
}

impl<T> WorkQueue<T> {
    pub fn new<I: IntoIterator<Item = T>>(items: I) -> Self {
        Self {
            items: Mutex::new(items.into_iter().collect()),
        }
    }

    /// Take the next item, `None` once the queue is drained
    pub fn pop(&self) -> Option<T> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner).pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> FromIterator<T> for WorkQueue<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self::new(iter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_fifo_order() {
        let queue = WorkQueue::new(1..=3);
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(3));
        assert_eq!(queue.pop(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_each_item_taken_once() {
        let queue: WorkQueue<usize> = (0..1000).collect();
        let sum = AtomicUsize::new(0);
        let taken = AtomicUsize::new(0);
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    while let Some(item) = queue.pop() {
                        sum.fetch_add(item, Ordering::Relaxed);
                        taken.fetch_add(1, Ordering::Relaxed);
                    }
                });
            }
        });
        assert_eq!(taken.into_inner(), 1000);
        assert_eq!(sum.into_inner(), 999 * 1000 / 2);
    }
}
