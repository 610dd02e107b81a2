//! FIFO of deferred work.

use std::collections::VecDeque;
use tokio::time::Instant;

#[derive(Debug)]
struct Entry<T> {
    item: T,
    not_before: Option<Instant>,
}

/// Deferred items waiting for the breaker's next admission window.
///
/// Strict FIFO: only the head is ever offered, so an entry that is not yet
/// ready holds back everything behind it.
#[derive(Debug)]
pub struct RetryQueue<T> {
    entries: VecDeque<Entry<T>>,
}

impl<T> RetryQueue<T> {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    /// Append an item that may be retried immediately.
    pub fn push(&mut self, item: T) {
        self.entries.push_back(Entry {
            item,
            not_before: None,
        });
    }

    /// Append an item that must not be retried before `not_before`.
    pub fn push_delayed(&mut self, item: T, not_before: Instant) {
        self.entries.push_back(Entry {
            item,
            not_before: Some(not_before),
        });
    }

    /// Return an item to the head after a denied admission.
    pub fn push_front(&mut self, item: T) {
        self.entries.push_front(Entry {
            item,
            not_before: None,
        });
    }

    /// Pop the head if it is ready at `now`.
    pub fn pop_ready(&mut self, now: Instant) -> Option<T> {
        let ready = self
            .entries
            .front()
            .is_some_and(|e| e.not_before.map_or(true, |t| t <= now));
        if ready {
            self.entries.pop_front().map(|e| e.item)
        } else {
            None
        }
    }

    /// Peek at the head item, ready or not.
    pub fn front(&self) -> Option<&T> {
        self.entries.front().map(|e| &e.item)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> Default for RetryQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
