//! A producer/consumer list with producer counting.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// A shared FIFO of items with counted producers.
///
/// Consumers block in [`consume`] while the queue is empty and at least one
/// producer is still registered; once the last producer leaves, `consume`
/// drains the remaining items and then returns `None`.
///
/// Cloning a `Queue` clones the handle, not the contents. Cloning does *not*
/// register a producer; call [`add_producer`] for that.
///
/// [`consume`]: Queue::consume
/// [`add_producer`]: Queue::add_producer
pub struct Queue<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    cond: Condvar,
}

struct State<T> {
    items: VecDeque<T>,
    producers: usize,
}

impl<T> Queue<T> {
    pub fn new() -> Queue<T> {
        Queue {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    items: VecDeque::new(),
                    producers: 0,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    /// Register a producer. While any producers are registered, consumers
    /// block on an empty queue instead of giving up.
    pub fn add_producer(&self) {
        self.lock().producers += 1;
    }

    /// Remove a producer registered with [`add_producer`]. When the count
    /// drops to zero, blocked consumers are released.
    ///
    /// [`add_producer`]: Queue::add_producer
    pub fn remove_producer(&self) {
        let mut state = self.lock();
        assert!(state.producers > 0, "removing a producer that was never added");
        state.producers -= 1;
        if state.producers == 0 {
            drop(state);
            self.inner.cond.notify_all();
        }
    }

    /// Append an item and wake one blocked consumer.
    pub fn produce(&self, item: T) {
        self.lock().items.push_back(item);
        self.inner.cond.notify_one();
    }

    /// Take the oldest item, blocking while the queue is empty and producers
    /// remain. Returns `None` only when the queue is empty and the last
    /// producer has left.
    pub fn consume(&self) -> Option<T> {
        let mut state = self.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            if state.producers == 0 {
                return None;
            }
            state = self.inner.cond.wait(state).expect("queue lock poisoned");
        }
    }

    /// Like [`consume`], but gives up after `timeout`.
    ///
    /// [`consume`]: Queue::consume
    pub fn consume_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            if state.producers == 0 {
                return None;
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return None;
            }
            state = self
                .inner
                .cond
                .wait_timeout(state, left)
                .expect("queue lock poisoned")
                .0;
        }
    }

    /// Take the oldest item if one is immediately available.
    pub fn try_consume(&self) -> Option<T> {
        self.lock().items.pop_front()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State<T>> {
        self.inner.state.lock().expect("queue lock poisoned")
    }
}

impl<T> Queue<Arc<T>> {
    /// Remove every queued item that is the same allocation as `item`
    /// (pointer identity, not `PartialEq`). Returns how many were removed:
    /// 0 means a consumer already took the item and now owns it.
    pub fn delete_equal(&self, item: &Arc<T>) -> usize {
        let mut state = self.lock();
        let before = state.items.len();
        state.items.retain(|queued| !Arc::ptr_eq(queued, item));
        before - state.items.len()
    }
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Queue<T> {
        Queue {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for Queue<T> {
    fn default() -> Queue<T> {
        Queue::new()
    }
}
