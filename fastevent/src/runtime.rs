//! Threaded runtime primitives.
//!
//! - `task`: lifecycle-managed background thread (start / signal / join).
//! - `event`: single-slot coalescing event bus with callback fan-out.
//! - `poller`: loop that runs a step and republishes its results on a bus.

pub mod event;
pub mod poller;
pub mod task;

pub use event::{BusStats, CallbackId, DEFAULT_WAKE_INTERVAL, EventBus};
pub use poller::{Iterate, Iteration, Poller};
pub use task::{Lifecycle, Task, TaskError, TaskState};
