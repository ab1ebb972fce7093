/*!
Bounded hand-off between the acquisition thread and the consumer.

The producer never waits for the consumer: when the queue is full the oldest
entry is evicted to make room, so the newest data always wins over backlog.
Evictions and empty polls are counted so sustained overload is visible.
*/

use crate::error::{PipelineError, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Bounded FIFO with evict-oldest overflow
#[derive(Debug)]
pub struct BufferQueue<T> {
    capacity: usize,
    items: Mutex<VecDeque<T>>,
    pushed: AtomicU64,
    popped: AtomicU64,
    evictions: AtomicU64,
    empty_polls: AtomicU64,
}

impl<T> BufferQueue<T> {
    /// Create a queue holding at most `capacity` entries
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(PipelineError::config("queue capacity must be at least 1"));
        }
        Ok(Self {
            capacity,
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            pushed: AtomicU64::new(0),
            popped: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            empty_polls: AtomicU64::new(0),
        })
    }

    // A panic while holding the lock cannot leave the deque half-updated,
    // so a poisoned lock is still safe to use.
    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append an entry. Returns the evicted oldest entry if the queue was full.
    pub fn push(&self, item: T) -> Option<T> {
        let evicted = {
            let mut items = self.lock();
            let evicted = if items.len() >= self.capacity {
                items.pop_front()
            } else {
                None
            };
            items.push_back(item);
            evicted
        };
        self.pushed.fetch_add(1, Ordering::Relaxed);
        if evicted.is_some() {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        evicted
    }

    /// Take the oldest entry, if any
    pub fn pop(&self) -> Option<T> {
        let item = self.lock().pop_front();
        match item {
            Some(_) => self.popped.fetch_add(1, Ordering::Relaxed),
            None => self.empty_polls.fetch_add(1, Ordering::Relaxed),
        };
        item
    }

    /// Remove every queued entry in FIFO order
    pub fn drain(&self) -> Vec<T> {
        let drained: Vec<T> = self.lock().drain(..).collect();
        self.popped.fetch_add(drained.len() as u64, Ordering::Relaxed);
        drained
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    pub fn popped(&self) -> u64 {
        self.popped.load(Ordering::Relaxed)
    }

    /// Entries dropped because the queue was full
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Pops that found the queue empty
    pub fn empty_polls(&self) -> u64 {
        self.empty_polls.load(Ordering::Relaxed)
    }
}
