//! Writer: synchronous sends with a wraparound sequence index.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::net::{TransportError, UdpSocket};
use crate::protocol::{Packet, SeqIndex};
use crate::runtime::{BusStats, CallbackId, DEFAULT_WAKE_INTERVAL, EventBus, TaskError, TaskState};
use crate::trace::{info, trace, warn};

/// Sends packets on the caller's thread and republishes each sent packet
/// to write callbacks through an owned [`EventBus`].
///
/// The writer has no loop of its own; `start`/`signal`/`join` drive its bus.
pub struct Writer {
    socket: Arc<UdpSocket>,
    /// Held across encode + send + publish so concurrent senders never share
    /// an index.
    index: Mutex<SeqIndex>,
    events: EventBus<Packet>,
}

impl Writer {
    /// Creates a writer starting at index 0.
    #[must_use]
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self::with_wake_interval(socket, DEFAULT_WAKE_INTERVAL)
    }

    /// Creates a writer whose bus uses the given wake interval.
    #[must_use]
    pub fn with_wake_interval(socket: Arc<UdpSocket>, wake_interval: Duration) -> Self {
        Self {
            socket,
            index: Mutex::new(SeqIndex::ZERO),
            events: EventBus::with_wake_interval("writer", wake_interval),
        }
    }

    /// Starts the write bus.
    ///
    /// # Errors
    ///
    /// Fails if already started or the thread cannot be spawned.
    pub fn start(&self) -> Result<(), TaskError> {
        self.events.start()
    }

    /// Requests the write bus to stop.
    pub fn signal(&self) {
        self.events.signal();
    }

    /// Waits for the write bus to exit.
    ///
    /// # Errors
    ///
    /// [`TaskError::Panicked`] if the bus thread panicked.
    pub fn join(&self) -> Result<(), TaskError> {
        self.events.join()
    }

    /// Lifecycle state of the write bus.
    pub fn state(&self) -> TaskState {
        self.events.state()
    }

    /// Index the next successful send will use.
    #[must_use]
    pub fn next_index(&self) -> SeqIndex {
        *self.index.lock()
    }

    /// Sends `payload` with the current index and returns that index.
    ///
    /// On success the packet is published to write callbacks and the index
    /// advances (255 wraps to 0). On failure nothing is published and the
    /// index stays put.
    ///
    /// # Errors
    ///
    /// [`TransportError::Closed`] after the socket was closed, otherwise the
    /// I/O error from the send.
    pub fn send(&self, payload: u8) -> Result<SeqIndex, TransportError> {
        let mut index = self.index.lock();
        let packet = Packet::new(index.get(), payload);

        if let Err(e) = self.socket.send(&packet.encode()) {
            if e.is_closed() {
                info!(%packet, "socket closed for writing");
            } else {
                warn!(%packet, error = %e, "send failed");
            }
            return Err(e);
        }

        trace!(%packet, "packet sent");
        self.events.publish(packet);
        let sent = *index;
        *index = index.next();
        Ok(sent)
    }

    /// Registers a write callback.
    pub fn add_callback<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&Packet) + Send + Sync + 'static,
    {
        self.events.add_callback(callback)
    }

    /// Unregisters a write callback.
    pub fn remove_callback(&self, id: CallbackId) -> bool {
        self.events.remove_callback(id)
    }

    /// Traffic counters of the write bus.
    #[must_use]
    pub fn stats(&self) -> BusStats {
        self.events.stats()
    }
}

impl std::fmt::Debug for Writer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Writer")
            .field("next_index", &self.next_index())
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Instant;

    use super::*;
    use crate::net::{Endpoint, Receiver};

    /// A writer connected to a sink socket that nobody reads.
    fn writer() -> (Writer, Arc<UdpSocket>, UdpSocket) {
        let sink = UdpSocket::bind(Endpoint::localhost(0)).unwrap();
        let socket = Arc::new(UdpSocket::connect(sink.local_addr().unwrap()).unwrap());
        (Writer::new(Arc::clone(&socket)), socket, sink)
    }

    #[test]
    fn indices_increase_and_wrap() {
        let (writer, _socket, _sink) = writer();
        writer.start().unwrap();

        for expected in (0..300u32).map(|n| (n % 256) as u8) {
            assert_eq!(writer.send(b'A').unwrap().get(), expected);
        }
        assert_eq!(writer.next_index(), SeqIndex::new(44));

        writer.signal();
        writer.join().unwrap();
    }

    #[test]
    fn failed_send_keeps_index_and_publishes_nothing() {
        let (writer, socket, _sink) = writer();
        writer.start().unwrap();

        assert_eq!(writer.send(b'A').unwrap(), SeqIndex::ZERO);
        socket.close();
        assert!(writer.send(b'A').unwrap_err().is_closed());
        assert_eq!(writer.next_index(), SeqIndex::new(1));
        assert_eq!(writer.stats().published, 1);
        // The bus keeps running after a transport failure.
        assert_eq!(writer.state(), TaskState::Running);

        writer.signal();
        writer.join().unwrap();
    }

    #[test]
    fn write_callbacks_see_sent_packet() {
        let (writer, _socket, sink) = writer();
        let seen = Arc::new(Mutex::new(None));
        let s = Arc::clone(&seen);
        writer.add_callback(move |p| *s.lock() = Some(*p));
        writer.start().unwrap();

        writer.send(b'D').unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while seen.lock().is_none() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(*seen.lock(), Some(Packet::new(0, b'D')));

        let mut buf = [0u8; 8];
        let n = Receiver::new(Arc::new(sink)).unwrap().recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], [0, b'D']);

        writer.signal();
        writer.join().unwrap();
    }

    #[test]
    fn concurrent_senders_never_share_an_index() {
        let (writer, _socket, _sink) = writer();
        let writer = Arc::new(writer);
        writer.start().unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let writer = Arc::clone(&writer);
                thread::spawn(move || {
                    (0..64)
                        .map(|_| writer.send(b'A').unwrap().get())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all: Vec<u8> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        assert_eq!(all, (0..=255u8).collect::<Vec<_>>());

        writer.signal();
        writer.join().unwrap();
    }
}
