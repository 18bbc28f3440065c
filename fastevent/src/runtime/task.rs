//! Lifecycle-managed background task.
//!
//! A [`Task`] owns one named thread and a [`Lifecycle`]: the task state plus
//! whatever data the loop shares with other threads, guarded by a single
//! mutex and paired with a condition variable. The state moves
//!
//! ```text
//! Created ──start()──▶ Running ──signal()──▶ Stopping ──loop exits──▶ Stopped
//!    └────────────────────signal()───────────────────────────────────────┘
//! ```
//!
//! `signal()` is cooperative: it flips the state under the lock and wakes
//! every waiter, so a loop blocked in [`Lifecycle::wait_for`] re-checks the
//! state immediately. The lock is never held across user code or I/O, which
//! keeps `signal()` bounded from any thread.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};
use thiserror::Error;

use crate::trace::{debug, warn};

/// Lifecycle state of a [`Task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Constructed, not started.
    Created,
    /// Loop is executing.
    Running,
    /// Stop requested; loop has not exited yet.
    Stopping,
    /// Loop has exited (or the task was stopped before it started).
    Stopped,
}

impl TaskState {
    /// Whether the loop should keep going.
    #[inline]
    #[must_use]
    pub const fn is_running(self) -> bool {
        matches!(self, Self::Running)
    }
}

/// Errors from starting or joining a [`Task`].
#[derive(Debug, Error)]
pub enum TaskError {
    /// `start()` called on a task that is not in [`TaskState::Created`].
    #[error("task `{name}` cannot start from state {state:?}")]
    NotStartable { name: String, state: TaskState },
    /// The OS refused to spawn the thread.
    #[error("failed to spawn thread for task `{name}`: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },
    /// The task body panicked.
    #[error("task `{0}` panicked")]
    Panicked(String),
}

/// State and loop data behind the lifecycle lock.
#[derive(Debug)]
pub struct Guarded<S> {
    state: TaskState,
    /// Data shared between the loop and other threads.
    pub data: S,
}

impl<S> Guarded<S> {
    /// Current state.
    #[inline]
    #[must_use]
    pub const fn state(&self) -> TaskState {
        self.state
    }

    /// Whether the loop should keep going.
    #[inline]
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.state.is_running()
    }
}

/// Running flag plus loop data under one mutex, with a condition variable
/// for wakeups.
#[derive(Debug)]
pub struct Lifecycle<S> {
    guarded: Mutex<Guarded<S>>,
    wake: Condvar,
}

impl<S> Lifecycle<S> {
    /// Creates a lifecycle in [`TaskState::Created`].
    pub fn new(data: S) -> Self {
        Self {
            guarded: Mutex::new(Guarded {
                state: TaskState::Created,
                data,
            }),
            wake: Condvar::new(),
        }
    }

    /// Current state.
    pub fn state(&self) -> TaskState {
        self.guarded.lock().state
    }

    /// Whether the loop should keep going.
    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    /// Locks state and data together.
    pub fn lock(&self) -> MutexGuard<'_, Guarded<S>> {
        self.guarded.lock()
    }

    /// Wakes every thread waiting in [`wait_for`](Self::wait_for).
    pub fn notify(&self) {
        self.wake.notify_all();
    }

    /// Waits for a notification or until `timeout` elapses.
    ///
    /// Returns `true` if the wait timed out. Callers must re-check their
    /// condition either way.
    pub fn wait_for(&self, guard: &mut MutexGuard<'_, Guarded<S>>, timeout: Duration) -> bool {
        self.wake.wait_for(guard, timeout).timed_out()
    }

    /// Requests a cooperative stop and wakes the loop.
    ///
    /// `Running` becomes `Stopping`; a task that never started goes straight
    /// to `Stopped`. Returns the state observed before the request.
    pub fn request_stop(&self) -> TaskState {
        let previous = {
            let mut guard = self.guarded.lock();
            let previous = guard.state;
            guard.state = match previous {
                TaskState::Created => TaskState::Stopped,
                TaskState::Running => TaskState::Stopping,
                other => other,
            };
            previous
        };
        self.wake.notify_all();
        previous
    }

    fn begin(&self) -> Result<(), TaskState> {
        let mut guard = self.guarded.lock();
        match guard.state {
            TaskState::Created => {
                guard.state = TaskState::Running;
                Ok(())
            }
            other => Err(other),
        }
    }

    fn finish(&self) {
        self.guarded.lock().state = TaskState::Stopped;
        self.wake.notify_all();
    }
}

/// Marks the lifecycle stopped when the task thread exits, including by panic.
struct StopOnExit<'a, S>(&'a Lifecycle<S>);

impl<S> Drop for StopOnExit<'_, S> {
    fn drop(&mut self) {
        self.0.finish();
    }
}

/// A background loop on a dedicated, named thread.
pub struct Task<S> {
    name: String,
    lifecycle: Arc<Lifecycle<S>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<S> Task<S> {
    /// Creates a task in [`TaskState::Created`]. `name` also names the thread.
    pub fn new(name: impl Into<String>, data: S) -> Self {
        Self {
            name: name.into(),
            lifecycle: Arc::new(Lifecycle::new(data)),
            handle: Mutex::new(None),
        }
    }

    /// Task name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Shared lifecycle (state + loop data).
    #[must_use]
    pub fn lifecycle(&self) -> &Arc<Lifecycle<S>> {
        &self.lifecycle
    }

    /// Current state.
    pub fn state(&self) -> TaskState {
        self.lifecycle.state()
    }

    /// Moves to `Running` and runs `body` on a new thread.
    ///
    /// The body should loop while [`Lifecycle::is_running`] holds. When it
    /// returns (or panics) the task becomes `Stopped`.
    ///
    /// # Errors
    ///
    /// [`TaskError::NotStartable`] unless the task is `Created`;
    /// [`TaskError::Spawn`] if the thread cannot be created.
    pub fn start<F>(&self, body: F) -> Result<(), TaskError>
    where
        S: Send + 'static,
        F: FnOnce(&Lifecycle<S>) + Send + 'static,
    {
        let mut handle = self.handle.lock();
        self.lifecycle
            .begin()
            .map_err(|state| TaskError::NotStartable {
                name: self.name.clone(),
                state,
            })?;

        let lifecycle = Arc::clone(&self.lifecycle);
        let name = self.name.clone();
        let spawned = thread::Builder::new()
            .name(format!("fe-{}", self.name))
            .spawn(move || {
                let _stop = StopOnExit(&*lifecycle);
                debug!(task = %name, "task started");
                body(&*lifecycle);
                debug!(task = %name, "task exiting");
            });

        match spawned {
            Ok(h) => {
                *handle = Some(h);
                Ok(())
            }
            Err(source) => {
                self.lifecycle.finish();
                Err(TaskError::Spawn {
                    name: self.name.clone(),
                    source,
                })
            }
        }
    }

    /// Requests a cooperative stop. Callable from any thread; never blocks on
    /// the loop itself.
    pub fn signal(&self) {
        self.lifecycle.request_stop();
    }

    /// Waits for the loop thread to exit.
    ///
    /// Idempotent: joining a task that never started or was already joined
    /// returns `Ok(())`. Joining from the task's own thread is skipped and
    /// leaves the handle in place for an outside caller.
    ///
    /// # Errors
    ///
    /// [`TaskError::Panicked`] if the body panicked.
    pub fn join(&self) -> Result<(), TaskError> {
        let handle = {
            let mut slot = self.handle.lock();
            match slot.as_ref() {
                None => return Ok(()),
                Some(handle) if handle.thread().id() == thread::current().id() => {
                    warn!(
                        task = %self.name,
                        "join requested from the task's own thread, skipping"
                    );
                    return Ok(());
                }
                Some(_) => slot.take(),
            }
        };
        let Some(handle) = handle else {
            return Ok(());
        };
        handle
            .join()
            .map_err(|_| TaskError::Panicked(self.name.clone()))
    }
}

impl<S> std::fmt::Debug for Task<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("state", &self.lifecycle.guarded.lock().state)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Instant;

    use super::*;

    /// Body that parks on the condvar until signalled.
    fn parked(lifecycle: &Lifecycle<()>) {
        let mut guard = lifecycle.lock();
        while guard.is_running() {
            lifecycle.wait_for(&mut guard, Duration::from_secs(60));
        }
    }

    #[test]
    fn start_signal_join_transitions() {
        let task = Task::new("parked", ());
        assert_eq!(task.state(), TaskState::Created);

        task.start(parked).unwrap();
        assert_eq!(task.state(), TaskState::Running);

        task.signal();
        task.join().unwrap();
        assert_eq!(task.state(), TaskState::Stopped);
    }

    #[test]
    fn signal_wakes_waiting_loop_promptly() {
        let task = Task::new("prompt", ());
        task.start(parked).unwrap();
        thread::sleep(Duration::from_millis(20));

        let started = Instant::now();
        task.signal();
        task.join().unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn join_is_idempotent() {
        let task = Task::new("twice", ());
        task.join().unwrap();
        task.start(parked).unwrap();
        task.signal();
        task.join().unwrap();
        task.join().unwrap();
    }

    #[test]
    fn join_from_own_thread_leaves_handle_for_outside_join() {
        let task = Arc::new(Task::new("selfjoin", ()));
        let this = Arc::new(Mutex::new(Some(Arc::clone(&task))));
        let exited = Arc::new(AtomicBool::new(false));

        let (t, e) = (Arc::clone(&this), Arc::clone(&exited));
        task.start(move |lifecycle| {
            let me = t.lock().take().expect("task handle");
            assert!(me.join().is_ok());
            parked(lifecycle);
            thread::sleep(Duration::from_millis(50));
            e.store(true, Ordering::SeqCst);
        })
        .unwrap();

        thread::sleep(Duration::from_millis(20));
        task.signal();
        task.join().unwrap();
        assert!(exited.load(Ordering::SeqCst));
    }

    #[test]
    fn signal_before_start_prevents_start() {
        let task = Task::new("never", ());
        task.signal();
        assert_eq!(task.state(), TaskState::Stopped);
        assert!(matches!(
            task.start(parked),
            Err(TaskError::NotStartable {
                state: TaskState::Stopped,
                ..
            })
        ));
    }

    #[test]
    fn start_twice_is_rejected() {
        let task = Task::new("dup", ());
        task.start(parked).unwrap();
        assert!(matches!(
            task.start(parked),
            Err(TaskError::NotStartable {
                state: TaskState::Running,
                ..
            })
        ));
        task.signal();
        task.join().unwrap();
    }

    #[test]
    fn body_returning_marks_stopped() {
        let runs = Arc::new(AtomicUsize::new(0));
        let task = Task::new("oneshot", ());
        let r = Arc::clone(&runs);
        task.start(move |_| {
            r.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        task.join().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(task.state(), TaskState::Stopped);
    }

    #[test]
    fn panicking_body_reports_on_join() {
        let task = Task::new("boom", ());
        task.start(|_| panic!("boom")).unwrap();
        assert!(matches!(task.join(), Err(TaskError::Panicked(name)) if name == "boom"));
        assert_eq!(task.state(), TaskState::Stopped);
    }

    #[test]
    fn shared_data_is_visible_to_loop() {
        let task = Task::new("data", 0u32);
        task.start(|lifecycle| {
            let mut guard = lifecycle.lock();
            while guard.is_running() && guard.data == 0 {
                lifecycle.wait_for(&mut guard, Duration::from_secs(60));
            }
            guard.data += 1;
        })
        .unwrap();

        {
            let mut guard = task.lifecycle().lock();
            guard.data = 41;
        }
        task.lifecycle().notify();
        task.join().unwrap();
        assert_eq!(task.lifecycle().lock().data, 42);
    }
}
