//! Single-slot blocking hand-off between two threads.

use parking_lot::{Condvar, Mutex};

#[derive(Debug)]
struct Slot<T> {
    value: Option<T>,
    closed: bool,
}

/// A bounded channel of capacity one that can be closed from either side.
///
/// `put` blocks while the slot is occupied, `take` blocks while it is empty.
/// After [`close`](Self::close) every blocked or future `put` fails and
/// `take` drains the remaining value before returning `None`.
#[derive(Debug)]
pub struct Handoff<T> {
    slot: Mutex<Slot<T>>,
    changed: Condvar,
}

impl<T> Handoff<T> {
    /// Creates an empty, open hand-off.
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                value: None,
                closed: false,
            }),
            changed: Condvar::new(),
        }
    }

    /// Places `value` in the slot, waiting for it to be free.
    ///
    /// Returns the value back if the hand-off is closed.
    pub fn put(&self, value: T) -> Result<(), T> {
        let mut slot = self.slot.lock();
        while slot.value.is_some() && !slot.closed {
            self.changed.wait(&mut slot);
        }
        if slot.closed {
            return Err(value);
        }
        slot.value = Some(value);
        drop(slot);
        self.changed.notify_all();
        Ok(())
    }

    /// Takes the value from the slot, waiting for one to arrive.
    ///
    /// Returns `None` once the hand-off is closed and empty.
    pub fn take(&self) -> Option<T> {
        let mut slot = self.slot.lock();
        loop {
            if let Some(value) = slot.value.take() {
                drop(slot);
                self.changed.notify_all();
                return Some(value);
            }
            if slot.closed {
                return None;
            }
            self.changed.wait(&mut slot);
        }
    }

    /// Closes the hand-off and wakes every waiter.
    pub fn close(&self) {
        self.slot.lock().closed = true;
        self.changed.notify_all();
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.slot.lock().closed
    }
}

impl<T> Default for Handoff<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn values_pass_in_order() {
        let handoff = Arc::new(Handoff::new());
        let producer = {
            let handoff = Arc::clone(&handoff);
            thread::spawn(move || {
                for i in 0..100u32 {
                    handoff.put(i).unwrap();
                }
                handoff.close();
            })
        };

        let mut seen = Vec::new();
        while let Some(v) = handoff.take() {
            seen.push(v);
        }
        producer.join().unwrap();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn close_releases_blocked_take() {
        let handoff: Arc<Handoff<u8>> = Arc::new(Handoff::new());
        let taker = {
            let handoff = Arc::clone(&handoff);
            thread::spawn(move || handoff.take())
        };
        thread::sleep(Duration::from_millis(20));
        handoff.close();
        assert_eq!(taker.join().unwrap(), None);
    }

    #[test]
    fn close_releases_blocked_put() {
        let handoff = Arc::new(Handoff::new());
        handoff.put(1u8).unwrap();
        let putter = {
            let handoff = Arc::clone(&handoff);
            thread::spawn(move || handoff.put(2))
        };
        thread::sleep(Duration::from_millis(20));
        handoff.close();
        assert_eq!(putter.join().unwrap(), Err(2));
    }

    #[test]
    fn take_drains_after_close() {
        let handoff = Handoff::new();
        handoff.put('a').unwrap();
        handoff.close();
        assert!(handoff.is_closed());
        assert_eq!(handoff.put('b'), Err('b'));
        assert_eq!(handoff.take(), Some('a'));
        assert_eq!(handoff.take(), None);
    }
}
