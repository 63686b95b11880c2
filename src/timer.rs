//! Sets of timers driven by a watcher thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::thread::{self, Thread};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use std::fmt;

use log::trace;
use slab::Slab;

use crate::Queue;

/// How long the watcher sleeps when it has nothing to watch. Only a wakeup
/// cuts this short.
const IDLE_SLEEP: Duration = Duration::from_secs(1_000_000);

/// A set of timers sharing one watcher thread.
///
/// Each timer is set to elapse at an absolute time; when that time is
/// reached, the watcher clones the timer's event and produces the clone on
/// the set's output queue. The timer is not considered done with the event
/// until the clone has been consumed from that queue, which is why stopping
/// or restarting a timer retracts a clone that is still queued: the caller
/// never sees an elapse from a timer it already stopped.
///
/// Dropping the set stops every timer still in its heap, then shuts down
/// the watcher. [`Timer`] handles stay valid after the set is dropped, but
/// starting one then is a programmer error and panics.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use gwio::{Queue, TimerSet};
///
/// let output = Queue::new();
/// let set = TimerSet::new(output.clone());
///
/// let timer = set.new_timer();
/// timer.start(Duration::ZERO, Some("ping"));
///
/// let event = output.consume_timeout(Duration::from_secs(2)).unwrap();
/// assert_eq!(*event, "ping");
/// ```
pub struct TimerSet<T> {
    inner: Arc<SetInner<T>>,
    watcher: Option<thread::JoinHandle<()>>,
}

/// A handle to one timer inside a [`TimerSet`].
///
/// Created with [`TimerSet::new_timer`]. The handle owns the timer: dropping
/// it stops the timer and retracts any elapse event still on the output
/// queue.
pub struct Timer<T> {
    set: Arc<SetInner<T>>,
    key: usize,
}

struct SetInner<T> {
    // Read by the watcher without the lock.
    stopping: AtomicBool,
    // One lock covers the whole set. Not as expensive as it sounds: a set
    // is typically shared by one caller thread and the watcher, and the
    // watcher does not wake up very often.
    state: Mutex<SetState<T>>,
    output: Queue<Arc<T>>,
    watcher: OnceLock<Thread>,
}

struct SetState<T> {
    timers: Slab<TimerState<T>>,
    // Slab keys of the active timers, kept partially ordered: element i
    // never elapses before its parent (i - 1) / 2, so element 0 is always
    // the next timer to elapse. Maintaining the partial order is much
    // cheaper than maintaining a sorted list.
    heap: Vec<usize>,
}

struct TimerState<T> {
    // The absolute Unix time at which the timer elapses; `None` while the
    // timer is inactive (not in the heap).
    elapses: Option<i64>,
    // Cloned onto the output queue on elapse. `None` only before the first
    // start.
    event: Option<T>,
    // The clone currently sitting on the output queue, if any. Cleared when
    // the clone is retracted or once it is known to have been consumed.
    elapsed: Option<Arc<T>>,
    // Position in the heap, maintained by the heap operations. `None` while
    // not in the heap.
    index: Option<usize>,
}

impl<T: Clone + Send + Sync + 'static> TimerSet<T> {
    /// Create a timer set producing elapse events onto `output`.
    ///
    /// The set registers itself as a producer of `output` for as long as it
    /// lives, and spawns the watcher thread.
    pub fn new(output: Queue<Arc<T>>) -> TimerSet<T> {
        output.add_producer();
        let inner = Arc::new(SetInner {
            stopping: AtomicBool::new(false),
            state: Mutex::new(SetState {
                timers: Slab::new(),
                heap: Vec::new(),
            }),
            output,
            watcher: OnceLock::new(),
        });

        let watcher = {
            let inner = Arc::clone(&inner);
            thread::Builder::new()
                .name("timer-watcher".to_owned())
                .spawn(move || watch_timers(&inner))
                .expect("failed to spawn timer watcher")
        };
        inner
            .watcher
            .set(watcher.thread().clone())
            .expect("watcher registered twice");

        TimerSet {
            inner,
            watcher: Some(watcher),
        }
    }

    /// Create a new, inactive timer belonging to this set.
    pub fn new_timer(&self) -> Timer<T> {
        let mut state = self.inner.lock();
        let key = state.timers.insert(TimerState {
            elapses: None,
            event: None,
            elapsed: None,
            index: None,
        });
        Timer {
            set: Arc::clone(&self.inner),
            key,
        }
    }
}

impl<T> Drop for TimerSet<T> {
    fn drop(&mut self) {
        // Stop all timers.
        let mut state = self.inner.lock();
        while let Some(&top) = state.heap.first() {
            stop_timer(&self.inner, &mut state, top);
        }
        drop(state);

        // Shut down the watcher thread.
        self.inner.stopping.store(true, Ordering::Release);
        self.inner.wakeup();
        if let Some(watcher) = self.watcher.take() {
            let _ = watcher.join();
        }

        self.inner.output.remove_producer();
    }
}

impl<T> fmt::Debug for TimerSet<T> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        fmt.debug_struct("TimerSet")
            .field("timers", &state.timers.len())
            .field("active", &state.heap.len())
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> Timer<T> {
    /// Start, or restart, the timer so that it elapses `interval` from now
    /// (rounded down to whole seconds).
    ///
    /// If `event` is `Some`, it replaces the timer's event; `None` keeps the
    /// event from an earlier start. The first start must supply an event.
    ///
    /// Restarting an elapsed timer whose event is still on the output queue
    /// retracts that event first, so at most one elapse per start is ever
    /// observed.
    ///
    /// # Panics
    ///
    /// Panics if no event has ever been supplied, or if the set's watcher
    /// has been stopped.
    pub fn start(&self, interval: Duration, event: Option<T>) {
        assert!(
            !self.set.stopping.load(Ordering::Acquire),
            "starting a timer on a stopped set"
        );

        let mut wakeup = false;
        let mut state = self.set.lock();
        assert!(
            event.is_some() || state.timers[self.key].event.is_some(),
            "timer started without an event"
        );

        // Convert to absolute time.
        let elapses = unix_now() + interval.as_secs() as i64;
        trace!("starting timer; elapses={}", elapses);

        if let Some(old) = state.timers[self.key].elapses {
            // Resetting an active timer. Move it to its new position in
            // the heap.
            let index = state.timers[self.key].index.expect("active timer not in heap");
            if elapses < old && index == 0 {
                wakeup = true;
            }
            state.timers[self.key].elapses = Some(elapses);
            debug_assert_eq!(state.heap[index], self.key);
            wakeup |= state.adjust(index);
        } else {
            // Setting a new timer, or restarting an elapsed one. First deal
            // with an elapse event that may still be on the output queue.
            abort_elapsed(&self.set, &mut state, self.key);

            // Then activate the timer.
            state.timers[self.key].elapses = Some(elapses);
            debug_assert!(state.timers[self.key].index.is_none());
            state.insert(self.key);
            // Do we have a new top?
            wakeup = state.timers[self.key].index == Some(0);
        }

        if let Some(event) = event {
            state.timers[self.key].event = Some(event);
        }

        drop(state);

        if wakeup {
            self.set.wakeup();
        }
    }
}

impl<T> Timer<T> {
    /// Stop the timer.
    ///
    /// If the timer already elapsed but its event has not been consumed from
    /// the output queue, the event is retracted, so a stopped timer is never
    /// observed to elapse. Stopping an inactive timer is a no-op.
    pub fn stop(&self) {
        let mut state = self.set.lock();
        stop_timer(&self.set, &mut state, self.key);
    }
}

impl<T> Drop for Timer<T> {
    fn drop(&mut self) {
        let mut state = self.set.lock();
        stop_timer(&self.set, &mut state, self.key);
        state.timers.remove(self.key);
    }
}

impl<T> fmt::Debug for Timer<T> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.set.lock();
        fmt.debug_struct("Timer")
            .field("elapses", &state.timers[self.key].elapses)
            .finish()
    }
}

impl<T> SetInner<T> {
    fn lock(&self) -> MutexGuard<'_, SetState<T>> {
        self.state.lock().expect("timer set lock poisoned")
    }

    fn wakeup(&self) {
        if let Some(watcher) = self.watcher.get() {
            watcher.unpark();
        }
    }
}

/// Deactivate `key` and retract a queued elapse event, if there is one.
fn stop_timer<T>(set: &SetInner<T>, state: &mut SetState<T>, key: usize) {
    if state.timers[key].elapses.is_some() {
        state.timers[key].elapses = None;
        let index = state.timers[key].index.expect("active timer not in heap");
        debug_assert_eq!(state.heap[index], key);
        state.delete(index);
    }
    abort_elapsed(set, state, key);
}

/// Go back and remove this timer's elapse event from the output queue, to
/// pretend that it didn't elapse after all. This is what closes the races
/// between the watcher and the caller's start/stop actions.
fn abort_elapsed<T>(set: &SetInner<T>, state: &mut SetState<T>, key: usize) {
    if let Some(elapsed) = state.timers[key].elapsed.take() {
        let count = set.output.delete_equal(&elapsed);
        // count == 0 means a consumer already took the event and owns it
        // now; either way our handle is dropped here.
        trace!("retracted {} queued elapse event(s)", count);
    }
}

/// The timer at `key` has elapsed and has already been deleted from the
/// heap. The set is locked.
fn elapse_timer<T: Clone>(set: &SetInner<T>, state: &mut SetState<T>, key: usize) {
    let timer = &mut state.timers[key];
    // abort_elapsed runs before every activation, so there cannot be an
    // earlier event still outstanding.
    debug_assert!(timer.elapsed.is_none());

    let event = timer.event.as_ref().expect("started timer has no event");
    let elapsed = Arc::new(event.clone());
    timer.elapsed = Some(Arc::clone(&elapsed));
    timer.elapses = None;
    set.output.produce(elapsed);
    trace!("timer elapsed; produced event");
}

/// Main function for the watcher thread.
fn watch_timers<T: Clone>(set: &SetInner<T>) {
    while !set.stopping.load(Ordering::Acquire) {
        let mut state = set.lock();

        // Are there any timers to watch?
        if state.heap.is_empty() {
            drop(state);
            thread::park_timeout(IDLE_SLEEP);
            continue;
        }

        // Does the top timer elapse?
        let top = state.heap[0];
        let top_time = state.elapses_at(0);
        let now = unix_now();
        if top_time <= now {
            state.delete(0);
            elapse_timer(set, &mut state, top);
            continue;
        }

        // Sleep until the top timer elapses, or we get woken up.
        drop(state);
        trace!("watcher sleeping for {}s", top_time - now);
        thread::park_timeout(Duration::from_secs((top_time - now) as u64));
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_secs() as i64
}

impl<T> SetState<T> {
    fn elapses_at(&self, index: usize) -> i64 {
        let key = self.heap[index];
        self.timers[key].elapses.expect("inactive timer in heap")
    }

    /// Swap two elements of the heap, and update their index fields. This
    /// is the basic heap operation.
    fn swap(&mut self, index1: usize, index2: usize) {
        self.heap.swap(index1, index2);
        let key = self.heap[index1];
        self.timers[key].index = Some(index1);
        let key = self.heap[index2];
        self.timers[key].index = Some(index2);
    }

    /// Add a timer to the heap: append it, then move it up as necessary to
    /// restore the partial ordering.
    fn insert(&mut self, key: usize) {
        self.heap.push(key);
        self.timers[key].index = Some(self.heap.len() - 1);
        self.adjust(self.heap.len() - 1);
    }

    /// Remove the timer at `index` from the heap: swap it with the last
    /// element, shorten the heap, then move the swapped element up or down
    /// to restore the partial ordering.
    fn delete(&mut self, index: usize) {
        let key = self.heap[index];
        let last = self.heap.len() - 1;
        if index == last {
            self.heap.pop();
        } else {
            self.swap(index, last);
            self.heap.pop();
            self.adjust(index);
        }
        self.timers[key].index = None;
    }

    /// The element at `index` may have broken the partial ordering; move it
    /// up or down until the ordering is restored. Returns true if the timer
    /// at the top of the heap is now earlier than before.
    fn adjust(&mut self, mut index: usize) -> bool {
        // Move toward the top?
        if index > 0 {
            let mut parent = (index - 1) / 2;
            if self.elapses_at(index) < self.elapses_at(parent) {
                while self.elapses_at(index) < self.elapses_at(parent) {
                    self.swap(index, parent);
                    index = parent;
                    if index == 0 {
                        break;
                    }
                    parent = (index - 1) / 2;
                }
                // We're done. Did we change the top?
                return index == 0;
            }
        }

        // Move toward the bottom?
        loop {
            let mut child = 2 * index + 1;
            if child >= self.heap.len() {
                return false; // Already at the bottom.
            }
            if child == self.heap.len() - 1 {
                // Only one child.
                if self.elapses_at(child) < self.elapses_at(index) {
                    self.swap(index, child);
                }
                return false;
            }

            // Find the earlier child.
            if self.elapses_at(child + 1) < self.elapses_at(child) {
                child += 1;
            }

            if self.elapses_at(child) < self.elapses_at(index) {
                self.swap(index, child);
                index = child;
            } else {
                return false;
            }
        }
    }
}
