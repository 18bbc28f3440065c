//! Reader: a poller whose step is a blocking receive plus packet decode.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;

use crate::net::{Receiver, TransportError, UdpSocket};
use crate::protocol::Packet;
use crate::runtime::{
    BusStats, CallbackId, DEFAULT_WAKE_INTERVAL, EventBus, Iterate, Iteration, Poller, TaskError,
    TaskState,
};
use crate::trace::{info, trace, warn};

/// Receive buffer size; anything longer than a packet is malformed anyway.
const MAX_DATAGRAM: usize = 64;

/// Failure of one read iteration.
#[derive(Debug, Error)]
pub enum ReadError {
    /// Receive failed for a reason other than the socket being closed.
    #[error("receive failed: {0}")]
    Transport(#[from] TransportError),
}

/// Read step: one datagram per iteration.
pub struct ReadStep {
    receiver: Receiver,
    buf: [u8; MAX_DATAGRAM],
    malformed: Arc<AtomicU64>,
}

impl Iterate for ReadStep {
    type Output = Packet;
    type Error = ReadError;

    fn iterate(&mut self) -> Result<Iteration<Packet>, ReadError> {
        match self.receiver.recv(&mut self.buf) {
            Ok(len) => match Packet::decode(&self.buf[..len]) {
                Ok(packet) => {
                    trace!(%packet, "packet received");
                    Ok(Iteration::Publish(packet))
                }
                Err(e) => {
                    self.malformed.fetch_add(1, Ordering::Relaxed);
                    warn!(len, error = %e, "dropping malformed datagram");
                    Ok(Iteration::Skip)
                }
            },
            Err(TransportError::Closed) => {
                info!("socket closed for reading, stopping reader");
                Ok(Iteration::Stop)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Background reader publishing every received [`Packet`].
///
/// A pending receive has no timeout: [`signal`](Self::signal) alone does not
/// interrupt it. The reader exits once the socket is closed (or after the
/// next datagram arrives).
///
/// Dropping a reader closes its socket and joins the loop, so a reader never
/// outlives its owner. Other holders of the socket see it closed.
pub struct Reader {
    socket: Arc<UdpSocket>,
    poller: Poller<ReadStep>,
    malformed: Arc<AtomicU64>,
}

impl Reader {
    /// Creates a stopped reader on `socket`.
    ///
    /// # Errors
    ///
    /// Returns an error if the receive poller cannot be registered.
    pub fn new(socket: Arc<UdpSocket>) -> io::Result<Self> {
        Self::with_wake_interval(socket, DEFAULT_WAKE_INTERVAL)
    }

    /// Creates a stopped reader whose bus uses the given wake interval.
    ///
    /// # Errors
    ///
    /// Returns an error if the receive poller cannot be registered.
    pub fn with_wake_interval(socket: Arc<UdpSocket>, wake_interval: Duration) -> io::Result<Self> {
        let malformed = Arc::new(AtomicU64::new(0));
        let step = ReadStep {
            receiver: Receiver::new(Arc::clone(&socket))?,
            buf: [0u8; MAX_DATAGRAM],
            malformed: Arc::clone(&malformed),
        };
        let events = EventBus::with_wake_interval("reader", wake_interval);
        Ok(Self {
            socket,
            poller: Poller::with_events(step, events),
            malformed,
        })
    }

    /// Starts the reader loop and its bus.
    ///
    /// # Errors
    ///
    /// Fails if already started or a thread cannot be spawned.
    pub fn start(&self) -> Result<(), TaskError> {
        self.poller.start()
    }

    /// Requests a stop; see the type-level note on pending receives.
    pub fn signal(&self) {
        self.poller.signal();
    }

    /// Waits for the reader loop and its bus to exit.
    ///
    /// # Errors
    ///
    /// [`TaskError::Panicked`] if a thread panicked.
    pub fn join(&self) -> Result<(), TaskError> {
        self.poller.join()
    }

    /// Lifecycle state of the reader loop.
    pub fn state(&self) -> TaskState {
        self.poller.state()
    }

    /// Registers a read callback.
    pub fn add_callback<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&Packet) + Send + Sync + 'static,
    {
        self.poller.add_callback(callback)
    }

    /// Unregisters a read callback.
    pub fn remove_callback(&self, id: CallbackId) -> bool {
        self.poller.remove_callback(id)
    }

    /// Datagrams dropped because they were not exactly one packet long.
    #[must_use]
    pub fn malformed_count(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    /// Traffic counters of the read bus.
    #[must_use]
    pub fn stats(&self) -> BusStats {
        self.poller.stats()
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        self.poller.signal();
        self.socket.close();
        if let Err(e) = self.poller.join() {
            warn!(error = %e, "reader did not stop cleanly");
        }
    }
}

impl std::fmt::Debug for Reader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reader")
            .field("state", &self.state())
            .field("malformed", &self.malformed_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Instant;

    use parking_lot::Mutex;

    use super::*;
    use crate::net::Endpoint;

    fn pair() -> (UdpSocket, Arc<UdpSocket>) {
        let peer = UdpSocket::bind(Endpoint::localhost(0)).unwrap();
        let local = UdpSocket::bind(Endpoint::localhost(0)).unwrap();
        peer.connect_to(local.local_addr().unwrap()).unwrap();
        local.connect_to(peer.local_addr().unwrap()).unwrap();
        (peer, Arc::new(local))
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
    fn publishes_decoded_packets() {
        let (peer, local) = pair();
        let reader = Reader::new(Arc::clone(&local)).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        reader.add_callback(move |p| s.lock().push(*p));
        reader.start().unwrap();

        peer.send(&Packet::new(9, b'Z').encode()).unwrap();
        assert!(wait_until(Duration::from_secs(2), || {
            seen.lock().as_slice() == [Packet::new(9, b'Z')]
        }));

        local.close();
        reader.signal();
        reader.join().unwrap();
    }

    #[test]
    fn malformed_datagrams_are_counted_and_skipped() {
        let (peer, local) = pair();
        let reader = Reader::new(Arc::clone(&local)).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        reader.add_callback(move |p| s.lock().push(*p));
        reader.start().unwrap();

        peer.send(b"abc").unwrap();
        assert!(wait_until(Duration::from_secs(2), || reader.malformed_count() == 1));
        peer.send(&Packet::new(1, b'A').encode()).unwrap();
        assert!(wait_until(Duration::from_secs(2), || !seen.lock().is_empty()));

        assert_eq!(seen.lock().as_slice(), [Packet::new(1, b'A')]);
        assert_eq!(reader.state(), TaskState::Running);

        local.close();
        reader.signal();
        reader.join().unwrap();
    }

    #[test]
    fn socket_close_stops_reader_without_signal() {
        let (_peer, local) = pair();
        let reader = Reader::new(Arc::clone(&local)).unwrap();
        reader.start().unwrap();
        thread::sleep(Duration::from_millis(20));

        local.close();
        assert!(wait_until(Duration::from_secs(2), || {
            reader.state() == TaskState::Stopped
        }));
        reader.join().unwrap();
    }

    #[test]
    fn dropping_started_reader_releases_socket() {
        let (_peer, local) = pair();
        let reader = Reader::new(Arc::clone(&local)).unwrap();
        reader.start().unwrap();
        thread::sleep(Duration::from_millis(20));
        assert!(Arc::strong_count(&local) > 1);

        let started = Instant::now();
        drop(reader);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(local.is_closed());
        assert_eq!(Arc::strong_count(&local), 1);
    }

    #[test]
    fn signal_alone_leaves_receive_pending() {
        let (peer, local) = pair();
        let reader = Reader::new(Arc::clone(&local)).unwrap();
        reader.start().unwrap();
        thread::sleep(Duration::from_millis(20));

        reader.signal();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(reader.state(), TaskState::Stopping);

        // New data releases the receive; the loop then sees the stop request.
        peer.send(&Packet::new(0, b'A').encode()).unwrap();
        assert!(wait_until(Duration::from_secs(2), || {
            reader.state() == TaskState::Stopped
        }));
        reader.join().unwrap();
    }
}
