//! Session: one reader and one writer over one shared UDP socket.
//!
//! Per session three background loops run once opened: the reader's receive
//! loop, the reader's dispatch loop and the writer's dispatch loop. Sends run
//! on the caller's thread.
//!
//! Teardown order matters. The reader may be parked in a receive that only
//! data or a socket close can release, so [`Session::close`] signals both
//! sides, closes the socket, and only then joins.

pub mod reader;
pub mod writer;

use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::config::{ConfigError, ServiceConfig};
use crate::net::{Endpoint, TransportError, UdpSocket};
use crate::protocol::{Command, Packet, SeqIndex};
use crate::runtime::{BusStats, CallbackId, DEFAULT_WAKE_INTERVAL, TaskError};
use crate::trace::{error, info};

pub use reader::{ReadError, Reader};
pub use writer::Writer;

/// Errors opening a [`Session`].
#[derive(Debug, Error)]
pub enum SessionError {
    /// The socket could not be provisioned from configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The reader's receive poller could not be set up.
    #[error("failed to set up reader: {0}")]
    Io(#[from] io::Error),
    /// A background thread could not be started.
    #[error(transparent)]
    Task(#[from] TaskError),
}

/// A reader + writer pair over one socket with a single teardown path.
///
/// Dropping a session closes it.
pub struct Session {
    socket: Arc<UdpSocket>,
    reader: Reader,
    writer: Writer,
    open: bool,
}

impl Session {
    /// Opens a session over an already bound or connected socket and starts
    /// its reader and writer.
    ///
    /// # Errors
    ///
    /// Fails if the reader cannot register its receive poller or a thread
    /// cannot be spawned. Anything already started is torn down.
    pub fn new(socket: UdpSocket) -> Result<Self, SessionError> {
        Self::with_wake_interval(socket, DEFAULT_WAKE_INTERVAL)
    }

    /// Like [`new`](Self::new) with a custom dispatch wake interval.
    ///
    /// # Errors
    ///
    /// See [`new`](Self::new).
    pub fn with_wake_interval(
        socket: UdpSocket,
        wake_interval: Duration,
    ) -> Result<Self, SessionError> {
        let socket = Arc::new(socket);
        let session = Self {
            reader: Reader::with_wake_interval(Arc::clone(&socket), wake_interval)?,
            writer: Writer::with_wake_interval(Arc::clone(&socket), wake_interval),
            socket,
            open: true,
        };
        session.reader.start()?;
        session.writer.start()?;
        info!(
            local = ?session.socket.local_addr().ok(),
            peer = ?session.socket.peer_addr().ok(),
            "session opened"
        );
        Ok(session)
    }

    /// Opens a client session connected to `host` on the configured port.
    ///
    /// # Errors
    ///
    /// Fails if the socket cannot be provisioned or the session cannot start.
    pub fn connect(config: &ServiceConfig, host: &str) -> Result<Self, SessionError> {
        Self::new(crate::config::open_socket(config, host)?)
    }

    /// Whether [`close`](Self::close) has not run yet.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.open
    }

    /// Local address of the session socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be retrieved.
    pub fn local_addr(&self) -> io::Result<Endpoint> {
        self.socket.local_addr()
    }

    /// Sends one payload byte; returns the sequence index used.
    ///
    /// # Errors
    ///
    /// [`TransportError::Closed`] once the session is closed.
    pub fn send(&self, payload: u8) -> Result<SeqIndex, TransportError> {
        self.writer.send(payload)
    }

    /// Sends a [`Command`].
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub fn send_command(&self, command: Command) -> Result<SeqIndex, TransportError> {
        self.send(command.as_byte())
    }

    /// Registers a callback for received packets.
    pub fn add_read_callback<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&Packet) + Send + Sync + 'static,
    {
        self.reader.add_callback(callback)
    }

    /// Unregisters a read callback.
    pub fn remove_read_callback(&self, id: CallbackId) -> bool {
        self.reader.remove_callback(id)
    }

    /// Registers a callback for sent packets.
    pub fn add_write_callback<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&Packet) + Send + Sync + 'static,
    {
        self.writer.add_callback(callback)
    }

    /// Unregisters a write callback.
    pub fn remove_write_callback(&self, id: CallbackId) -> bool {
        self.writer.remove_callback(id)
    }

    /// Received datagrams dropped as malformed.
    #[must_use]
    pub fn malformed_count(&self) -> u64 {
        self.reader.malformed_count()
    }

    /// Read bus counters.
    #[must_use]
    pub fn read_stats(&self) -> BusStats {
        self.reader.stats()
    }

    /// Write bus counters.
    #[must_use]
    pub fn write_stats(&self) -> BusStats {
        self.writer.stats()
    }

    /// Stops the session: signal writer, signal reader, close the socket,
    /// join writer, join reader. Safe to call more than once.
    pub fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        info!(local = ?self.socket.local_addr().ok(), "closing session");

        self.writer.signal();
        self.reader.signal();
        self.socket.close();

        if let Err(e) = self.writer.join() {
            error!(error = %e, "writer did not stop cleanly");
        }
        if let Err(e) = self.reader.join() {
            error!(error = %e, "reader did not stop cleanly");
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("socket", &self.socket)
            .field("reader", &self.reader)
            .field("writer", &self.writer)
            .field("open", &self.open)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    fn connected_sockets() -> (UdpSocket, UdpSocket) {
        let a = UdpSocket::bind(Endpoint::localhost(0)).unwrap();
        let b = UdpSocket::bind(Endpoint::localhost(0)).unwrap();
        a.connect_to(b.local_addr().unwrap()).unwrap();
        b.connect_to(a.local_addr().unwrap()).unwrap();
        (a, b)
    }

    #[test]
    fn close_is_idempotent() {
        let (a, _b) = connected_sockets();
        let mut session = Session::new(a).unwrap();
        assert!(session.is_open());
        session.close();
        assert!(!session.is_open());
        session.close();
    }

    #[test]
    fn close_returns_promptly_with_idle_reader() {
        let (a, _b) = connected_sockets();
        let mut session = Session::new(a).unwrap();
        std::thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        session.close();
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn closed_session_degrades_gracefully() {
        let (a, _b) = connected_sockets();
        let mut session = Session::new(a).unwrap();
        session.close();

        assert!(session.send(b'A').unwrap_err().is_closed());
        let id = session.add_read_callback(|_| {});
        assert!(session.remove_read_callback(id));
        let id = session.add_write_callback(|_| {});
        assert!(session.remove_write_callback(id));
    }
}
