//! Single-slot coalescing event bus with callback fan-out.
//!
//! An [`EventBus`] runs a dispatch loop on its own [`Task`]. Publishers
//! overwrite one value slot and wake the loop; the loop hands the latest
//! value to every registered callback. It is not a queue: values published
//! while callbacks are running collapse into the most recent one.
//!
//! ```text
//! publish(v1) ─┐
//! publish(v2) ─┼─▶ [slot: v3, pending] ──wake──▶ dispatch ──▶ cb_a(&v3), cb_b(&v3)
//! publish(v3) ─┘
//! ```
//!
//! The callback list is copied out under its lock before each dispatch, so
//! callbacks may be added or removed from any thread, including from inside
//! a callback. A callback removed while a dispatch is in flight may still see
//! that one value.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use super::task::{Lifecycle, Task, TaskError, TaskState};
use crate::trace::{debug, error, trace};

/// Default upper bound on how long the dispatch loop sleeps between checks.
pub const DEFAULT_WAKE_INTERVAL: Duration = Duration::from_secs(1);

/// Handle returned by [`EventBus::add_callback`], used to remove it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(u64);

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Counters describing a bus's traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    /// Values accepted by [`EventBus::publish`].
    pub published: u64,
    /// Dispatch rounds (one per wake that found a pending value).
    pub dispatched: u64,
    /// Callback invocations that panicked.
    pub callback_failures: u64,
}

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// The coalescing slot, guarded together with the running flag.
struct Slot<T> {
    value: Option<T>,
    pending: bool,
    published: u64,
}

/// Callback registry shared with the dispatch thread.
struct Dispatch<T> {
    name: String,
    callbacks: Mutex<Vec<(CallbackId, Callback<T>)>>,
    next_id: AtomicU64,
    dispatched: AtomicU64,
    failures: AtomicU64,
}

impl<T> Dispatch<T> {
    fn fire(&self, value: &T) {
        let snapshot = self.callbacks.lock().clone();
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        trace!(bus = %self.name, callbacks = snapshot.len(), "dispatching");

        for (id, callback) in snapshot {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback(value))) {
                self.failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    bus = %self.name,
                    callback = %id,
                    panic = panic_message(payload.as_ref()),
                    "callback panicked"
                );
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// Coalescing single-slot event bus.
///
/// Dropping the bus signals its loop but does not wait for it; call
/// [`signal`](Self::signal) and [`join`](Self::join) for an orderly stop.
pub struct EventBus<T> {
    task: Task<Slot<T>>,
    dispatch: Arc<Dispatch<T>>,
    wake_interval: Duration,
}

impl<T: Clone + Send + 'static> EventBus<T> {
    /// Creates a stopped bus with the default wake interval.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_wake_interval(name, DEFAULT_WAKE_INTERVAL)
    }

    /// Creates a stopped bus whose loop re-checks its state at least every
    /// `wake_interval`.
    pub fn with_wake_interval(name: impl Into<String>, wake_interval: Duration) -> Self {
        let name = name.into();
        Self {
            task: Task::new(
                format!("event-{name}"),
                Slot {
                    value: None,
                    pending: false,
                    published: 0,
                },
            ),
            dispatch: Arc::new(Dispatch {
                name,
                callbacks: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
                dispatched: AtomicU64::new(0),
                failures: AtomicU64::new(0),
            }),
            wake_interval,
        }
    }

    /// Bus name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.dispatch.name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TaskState {
        self.task.state()
    }

    /// Starts the dispatch loop.
    ///
    /// # Errors
    ///
    /// Fails if the bus was already started or stopped, or the thread cannot
    /// be spawned.
    pub fn start(&self) -> Result<(), TaskError> {
        let dispatch = Arc::clone(&self.dispatch);
        let interval = self.wake_interval;
        self.task
            .start(move |lifecycle| run_dispatch(lifecycle, &dispatch, interval))
    }

    /// Requests the loop to stop. A callback already running completes first.
    pub fn signal(&self) {
        self.task.signal();
    }

    /// Waits for the dispatch loop to exit.
    ///
    /// # Errors
    ///
    /// [`TaskError::Panicked`] if the loop itself panicked.
    pub fn join(&self) -> Result<(), TaskError> {
        self.task.join()
    }

    /// Stores `value` in the slot and wakes the loop.
    ///
    /// Returns `false` (dropping the value) unless the bus is running. A value
    /// still pending from an earlier publish is overwritten.
    pub fn publish(&self, value: T) -> bool {
        let lifecycle = self.task.lifecycle();
        {
            let mut guard = lifecycle.lock();
            if !guard.is_running() {
                return false;
            }
            let slot = &mut guard.data;
            slot.value = Some(value);
            slot.pending = true;
            slot.published += 1;
        }
        lifecycle.notify();
        true
    }

    /// Registers a callback invoked with each dispatched value.
    pub fn add_callback<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = CallbackId(self.dispatch.next_id.fetch_add(1, Ordering::Relaxed));
        self.dispatch.callbacks.lock().push((id, Arc::new(callback)));
        debug!(bus = %self.dispatch.name, callback = %id, "callback added");
        id
    }

    /// Unregisters a callback. Returns `false` if `id` was not registered.
    pub fn remove_callback(&self, id: CallbackId) -> bool {
        let mut callbacks = self.dispatch.callbacks.lock();
        let before = callbacks.len();
        callbacks.retain(|(cid, _)| *cid != id);
        let removed = callbacks.len() != before;
        if removed {
            debug!(bus = %self.dispatch.name, callback = %id, "callback removed");
        }
        removed
    }

    /// Number of registered callbacks.
    #[must_use]
    pub fn callback_count(&self) -> usize {
        self.dispatch.callbacks.lock().len()
    }

    /// Traffic counters.
    #[must_use]
    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.task.lifecycle().lock().data.published,
            dispatched: self.dispatch.dispatched.load(Ordering::Relaxed),
            callback_failures: self.dispatch.failures.load(Ordering::Relaxed),
        }
    }
}

/// Dispatch loop body: wait for a pending value or a stop request.
fn run_dispatch<T: Clone>(
    lifecycle: &Lifecycle<Slot<T>>,
    dispatch: &Dispatch<T>,
    interval: Duration,
) {
    loop {
        let value = {
            let mut guard = lifecycle.lock();
            if guard.is_running() && !guard.data.pending {
                lifecycle.wait_for(&mut guard, interval);
            }
            if !guard.is_running() {
                break;
            }
            if !guard.data.pending {
                continue;
            }
            guard.data.pending = false;
            guard.data.value.clone()
        };
        if let Some(value) = value {
            dispatch.fire(&value);
        }
    }
}

impl<T> Drop for EventBus<T> {
    fn drop(&mut self) {
        self.task.lifecycle().request_stop();
    }
}

impl<T> fmt::Debug for EventBus<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("name", &self.dispatch.name)
            .field("state", &self.task.lifecycle().state())
            .field("callbacks", &self.dispatch.callbacks.lock().len())
            .finish()
    }
}
