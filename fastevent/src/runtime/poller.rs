//! Polling task: run a step in a loop and republish each result.
//!
//! A [`Poller`] owns a background [`Task`] and an [`EventBus`]. Its loop calls
//! [`Iterate::iterate`] repeatedly and publishes every produced value to the
//! bus, whose own dispatch thread fans it out to callbacks. The poller starts
//! its bus before its loop and stops and joins it before the loop thread
//! exits, so no dispatch thread outlives the poller.

use std::error::Error as StdError;
use std::sync::Arc;

use parking_lot::Mutex;

use super::event::{BusStats, CallbackId, EventBus};
use super::task::{Lifecycle, Task, TaskError, TaskState};
use crate::trace::{debug, error, warn};

/// Outcome of one [`Iterate::iterate`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Iteration<T> {
    /// Publish this value to the poller's bus.
    Publish(T),
    /// Nothing to publish this round.
    Skip,
    /// Stop the poller.
    Stop,
}

/// The step a [`Poller`] runs on every loop iteration.
pub trait Iterate: Send + 'static {
    /// Values published to the poller's bus.
    type Output: Clone + Send + 'static;
    /// Failures that are logged and skipped.
    type Error: StdError + Send + 'static;

    /// Runs one step. May block.
    ///
    /// An `Err` is logged and the loop continues with the next call.
    fn iterate(&mut self) -> Result<Iteration<Self::Output>, Self::Error>;
}

/// Background loop over an [`Iterate`] step with an owned [`EventBus`].
pub struct Poller<I: Iterate> {
    task: Task<()>,
    events: Arc<EventBus<I::Output>>,
    step: Mutex<Option<I>>,
}

impl<I: Iterate> Poller<I> {
    /// Creates a stopped poller around `step`.
    pub fn new(name: impl Into<String>, step: I) -> Self {
        Self::with_events(step, EventBus::new(name))
    }

    /// Creates a stopped poller publishing to a preconfigured `events` bus.
    /// The bus must not have been started.
    pub fn with_events(step: I, events: EventBus<I::Output>) -> Self {
        Self {
            task: Task::new(format!("poll-{}", events.name()), ()),
            events: Arc::new(events),
            step: Mutex::new(Some(step)),
        }
    }

    /// Poller name (shared with its bus).
    #[must_use]
    pub fn name(&self) -> &str {
        self.events.name()
    }

    /// Lifecycle state of the polling loop.
    pub fn state(&self) -> TaskState {
        self.task.state()
    }

    /// Lifecycle state of the owned bus.
    pub fn events_state(&self) -> TaskState {
        self.events.state()
    }

    /// Starts the bus, then the polling loop.
    ///
    /// # Errors
    ///
    /// Fails if the poller was already started or a thread cannot be spawned.
    pub fn start(&self) -> Result<(), TaskError> {
        let Some(step) = self.step.lock().take() else {
            return Err(TaskError::NotStartable {
                name: self.task.name().to_owned(),
                state: self.task.state(),
            });
        };

        self.events.start()?;
        let events = Arc::clone(&self.events);
        if let Err(e) = self
            .task
            .start(move |lifecycle| run_poll(lifecycle, step, &events))
        {
            self.events.signal();
            if let Err(join) = self.events.join() {
                error!(
                    poller = %self.events.name(),
                    error = %join,
                    "event bus did not stop cleanly"
                );
            }
            return Err(e);
        }
        Ok(())
    }

    /// Requests both the loop and the bus to stop.
    ///
    /// Does not interrupt an `iterate()` call that is blocked; the loop sees
    /// the request when that call returns.
    pub fn signal(&self) {
        self.task.signal();
        self.events.signal();
    }

    /// Waits for the loop (and, through it, the bus) to exit.
    ///
    /// # Errors
    ///
    /// [`TaskError::Panicked`] if the loop or the bus panicked.
    pub fn join(&self) -> Result<(), TaskError> {
        let looped = self.task.join();
        // Normally already joined by the loop; covers a loop that panicked.
        self.events.signal();
        self.events.join()?;
        looped
    }

    /// Registers a callback on the owned bus.
    pub fn add_callback<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&I::Output) + Send + Sync + 'static,
    {
        self.events.add_callback(callback)
    }

    /// Unregisters a callback from the owned bus.
    pub fn remove_callback(&self, id: CallbackId) -> bool {
        self.events.remove_callback(id)
    }

    /// Traffic counters of the owned bus.
    #[must_use]
    pub fn stats(&self) -> BusStats {
        self.events.stats()
    }
}

fn run_poll<I: Iterate>(lifecycle: &Lifecycle<()>, mut step: I, events: &EventBus<I::Output>) {
    let mut failures: u64 = 0;
    while lifecycle.is_running() {
        match step.iterate() {
            Ok(Iteration::Publish(value)) => {
                failures = 0;
                if lifecycle.is_running() {
                    events.publish(value);
                }
            }
            Ok(Iteration::Skip) => failures = 0,
            Ok(Iteration::Stop) => {
                debug!(poller = %events.name(), "step requested stop");
                lifecycle.request_stop();
            }
            Err(e) => {
                failures += 1;
                warn!(
                    poller = %events.name(),
                    error = %e,
                    consecutive = failures,
                    "iteration failed"
                );
            }
        }
    }

    events.signal();
    if let Err(e) = events.join() {
        error!(poller = %events.name(), error = %e, "event bus did not stop cleanly");
    }
}

/// Dropping a poller only signals it. A loop blocked inside `iterate()` keeps
/// its thread until that call returns, so owners whose step blocks must
/// release it first (see [`Reader`](crate::session::Reader)).
impl<I: Iterate> Drop for Poller<I> {
    fn drop(&mut self) {
        self.signal();
    }
}

impl<I: Iterate> std::fmt::Debug for Poller<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller")
            .field("task", &self.task)
            .field("events", &self.events)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    use thiserror::Error;

    use super::*;

    #[derive(Debug, Error)]
    #[error("odd step {0}")]
    struct OddStep(u32);

    /// Counts up, failing on odd numbers and stopping at `limit`.
    struct Counter {
        next: u32,
        limit: Option<u32>,
        fail_odd: bool,
    }

    impl Iterate for Counter {
        type Output = u32;
        type Error = OddStep;

        fn iterate(&mut self) -> Result<Iteration<u32>, OddStep> {
            thread::sleep(Duration::from_millis(2));
            let n = self.next;
            self.next += 1;
            if self.limit.is_some_and(|limit| n > limit) {
                return Ok(Iteration::Stop);
            }
            if self.fail_odd && n % 2 == 1 {
                return Err(OddStep(n));
            }
            Ok(Iteration::Publish(n))
        }
    }

    fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn step_stop_ends_loop_and_bus() {
        let poller = Poller::new(
            "limited",
            Counter {
                next: 0,
                limit: Some(10),
                fail_odd: false,
            },
        );
        let last = Arc::new(AtomicU32::new(u32::MAX));
        let l = Arc::clone(&last);
        poller.add_callback(move |v| l.store(*v, Ordering::SeqCst));

        poller.start().unwrap();
        assert!(wait_until(Duration::from_secs(2), || {
            poller.state() == TaskState::Stopped
        }));
        poller.join().unwrap();

        assert_eq!(poller.events_state(), TaskState::Stopped);
        assert_eq!(poller.stats().published, 11);
    }

    #[test]
    fn last_value_is_eventually_observed() {
        let poller = Poller::new(
            "observe",
            Counter {
                next: 0,
                limit: None,
                fail_odd: false,
            },
        );
        let last = Arc::new(AtomicU32::new(0));
        let l = Arc::clone(&last);
        poller.add_callback(move |v| l.store(*v, Ordering::SeqCst));

        poller.start().unwrap();
        assert!(wait_until(Duration::from_secs(2), || last.load(Ordering::SeqCst) >= 20));
        poller.signal();
        poller.join().unwrap();
        assert_eq!(poller.state(), TaskState::Stopped);
        assert_eq!(poller.events_state(), TaskState::Stopped);
    }

    #[test]
    fn iteration_errors_do_not_stop_loop() {
        let poller = Poller::new(
            "flaky",
            Counter {
                next: 0,
                limit: Some(9),
                fail_odd: true,
            },
        );
        let evens = Arc::new(AtomicUsize::new(0));
        let e = Arc::clone(&evens);
        poller.add_callback(move |v: &u32| {
            assert_eq!(v % 2, 0);
            e.fetch_add(1, Ordering::SeqCst);
        });

        poller.start().unwrap();
        assert!(wait_until(Duration::from_secs(2), || {
            poller.state() == TaskState::Stopped
        }));
        poller.join().unwrap();
        // 0, 2, 4, 6, 8 published; odd steps failed without stopping the loop
        assert_eq!(poller.stats().published, 5);
        assert!(evens.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn start_twice_is_rejected() {
        let poller = Poller::new(
            "dup",
            Counter {
                next: 0,
                limit: None,
                fail_odd: false,
            },
        );
        poller.start().unwrap();
        assert!(matches!(
            poller.start(),
            Err(TaskError::NotStartable { .. })
        ));
        poller.signal();
        poller.join().unwrap();
    }

    #[test]
    fn failed_loop_start_stops_the_bus() {
        let poller = Poller::new(
            "refused",
            Counter {
                next: 0,
                limit: None,
                fail_odd: false,
            },
        );
        poller.task.signal();

        assert!(matches!(
            poller.start(),
            Err(TaskError::NotStartable { .. })
        ));
        assert_eq!(poller.events_state(), TaskState::Stopped);
        assert_eq!(poller.state(), TaskState::Stopped);
    }

    #[test]
    fn join_without_start_is_ok() {
        let poller = Poller::new(
            "unused",
            Counter {
                next: 0,
                limit: None,
                fail_odd: false,
            },
        );
        poller.signal();
        poller.join().unwrap();
    }
}
