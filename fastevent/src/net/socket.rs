//! UDP socket with an explicit logical close.
//!
//! The socket itself is non-blocking (mio). Blocking reception is provided by
//! [`Receiver`], which parks its thread in a private [`Poll`] until either a
//! datagram arrives or [`UdpSocket::close`] wakes it. That gives the reader
//! thread an unbounded receive with no timeout which is still guaranteed to
//! be released when the owning session tears the transport down.

use std::io::{self, ErrorKind};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use mio::net::UdpSocket as MioUdpSocket;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use thiserror::Error;

use super::Endpoint;
use crate::trace::debug;

const SOCKET: Token = Token(0);
const CLOSE: Token = Token(1);

/// Errors from sending or receiving on a [`UdpSocket`].
#[derive(Debug, Error)]
pub enum TransportError {
    /// The socket has already been closed.
    #[error("socket closed")]
    Closed,
    /// Any other I/O failure.
    #[error("socket I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Whether this error means the transport is gone for good.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// A UDP socket shared between one reader thread and any number of senders.
pub struct UdpSocket {
    inner: MioUdpSocket,
    closed: AtomicBool,
    /// Wakers of the live [`Receiver`]s attached to this socket, by id.
    closers: Mutex<Vec<(u64, Waker)>>,
    next_closer: AtomicU64,
}

impl UdpSocket {
    /// Creates a socket bound to the given endpoint (server side).
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound (e.g., address in use).
    pub fn bind(endpoint: Endpoint) -> io::Result<Self> {
        let inner = MioUdpSocket::bind(endpoint.into())?;
        Ok(Self::from_mio(inner))
    }

    /// Creates a socket on an ephemeral local port connected to `peer`
    /// (client side).
    ///
    /// # Errors
    ///
    /// Returns an error if binding or connecting fails.
    pub fn connect(peer: Endpoint) -> io::Result<Self> {
        let inner = MioUdpSocket::bind(peer.ephemeral_local().into())?;
        inner.connect(peer.into())?;
        Ok(Self::from_mio(inner))
    }

    /// Wraps a standard library socket, switching it to non-blocking mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be made non-blocking.
    pub fn from_std(socket: std::net::UdpSocket) -> io::Result<Self> {
        socket.set_nonblocking(true)?;
        Ok(Self::from_mio(MioUdpSocket::from_std(socket)))
    }

    fn from_mio(inner: MioUdpSocket) -> Self {
        Self {
            inner,
            closed: AtomicBool::new(false),
            closers: Mutex::new(Vec::new()),
            next_closer: AtomicU64::new(0),
        }
    }

    /// Connects this socket to `peer`; subsequent [`send`](Self::send) calls
    /// go there and only datagrams from `peer` are received.
    ///
    /// # Errors
    ///
    /// Returns an error if the connect call fails.
    pub fn connect_to(&self, peer: Endpoint) -> io::Result<()> {
        self.inner.connect(peer.into())
    }

    /// Returns the local address this socket is bound to.
    ///
    /// # Errors
    ///
    /// Returns an error if the local address cannot be retrieved.
    pub fn local_addr(&self) -> io::Result<Endpoint> {
        self.inner.local_addr().map(Endpoint::from)
    }

    /// Returns the connected peer, if any.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` for an unconnected socket.
    pub fn peer_addr(&self) -> io::Result<Endpoint> {
        self.inner.peer_addr().map(Endpoint::from)
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Marks the socket closed and releases every blocked [`Receiver`].
    ///
    /// Idempotent; returns `true` only for the call that actually closed it.
    /// The descriptor itself is released when the last owner drops the
    /// socket.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let closers = self.closers.lock();
        for (_, waker) in closers.iter() {
            if let Err(e) = waker.wake() {
                debug!(error = %e, "failed to wake receiver on close");
            }
        }
        true
    }

    fn attach_closer(&self, waker: Waker) -> io::Result<u64> {
        let mut closers = self.closers.lock();
        if self.is_closed() {
            waker.wake()?;
        }
        let id = self.next_closer.fetch_add(1, Ordering::Relaxed);
        closers.push((id, waker));
        Ok(id)
    }

    fn detach_closer(&self, id: u64) {
        self.closers.lock().retain(|(attached, _)| *attached != id);
    }

    #[cfg(test)]
    fn closer_count(&self) -> usize {
        self.closers.lock().len()
    }

    /// Sends a datagram to the connected peer.
    ///
    /// # Errors
    ///
    /// [`TransportError::Closed`] once the socket is closed, otherwise the
    /// underlying I/O error.
    pub fn send(&self, buf: &[u8]) -> Result<usize, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        Ok(self.inner.send(buf)?)
    }

    /// Sends a datagram to the specified endpoint.
    ///
    /// # Errors
    ///
    /// [`TransportError::Closed`] once the socket is closed, otherwise the
    /// underlying I/O error.
    pub fn send_to(&self, buf: &[u8], dest: Endpoint) -> Result<usize, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        Ok(self.inner.send_to(buf, dest.into())?)
    }

    /// Sets the socket's send buffer size.
    ///
    /// # Errors
    ///
    /// Returns an error if the option cannot be set.
    pub fn set_send_buffer_size(&self, size: usize) -> io::Result<()> {
        // mio doesn't expose socket options
        rustix::net::sockopt::set_socket_send_buffer_size(self.inner.as_fd(), size)?;
        Ok(())
    }

    /// Sets the socket's receive buffer size.
    ///
    /// # Errors
    ///
    /// Returns an error if the option cannot be set.
    pub fn set_recv_buffer_size(&self, size: usize) -> io::Result<()> {
        rustix::net::sockopt::set_socket_recv_buffer_size(self.inner.as_fd(), size)?;
        Ok(())
    }
}

impl AsFd for UdpSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.as_fd()
    }
}

impl std::fmt::Debug for UdpSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpSocket")
            .field("local", &self.inner.local_addr().ok())
            .field("peer", &self.inner.peer_addr().ok())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Blocking receive side of a shared [`UdpSocket`].
///
/// Owned by exactly one thread. A call to [`recv`](Self::recv) returns only
/// when a datagram arrives or the socket is closed; it has no timeout.
pub struct Receiver {
    socket: Arc<UdpSocket>,
    closer: u64,
    poll: Poll,
    events: Events,
}

impl Receiver {
    /// Registers a new receiver on `socket`.
    ///
    /// # Errors
    ///
    /// Returns an error if the poller or its close waker cannot be created.
    pub fn new(socket: Arc<UdpSocket>) -> io::Result<Self> {
        let poll = Poll::new()?;
        let fd = socket.inner.as_raw_fd();
        poll.registry()
            .register(&mut SourceFd(&fd), SOCKET, Interest::READABLE)?;
        let closer = socket.attach_closer(Waker::new(poll.registry(), CLOSE)?)?;
        Ok(Self {
            socket,
            closer,
            poll,
            events: Events::with_capacity(4),
        })
    }

    /// The socket this receiver reads from.
    #[must_use]
    pub fn socket(&self) -> &Arc<UdpSocket> {
        &self.socket
    }

    /// Blocks until a datagram arrives from the connected peer.
    ///
    /// # Errors
    ///
    /// [`TransportError::Closed`] once the socket is closed, otherwise the
    /// underlying I/O error.
    pub fn recv(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        self.recv_with(buf, |socket, buf| socket.recv(buf))
    }

    /// Blocks until a datagram arrives, returning its source.
    ///
    /// # Errors
    ///
    /// [`TransportError::Closed`] once the socket is closed, otherwise the
    /// underlying I/O error.
    pub fn recv_from(&mut self, buf: &mut [u8]) -> Result<(usize, Endpoint), TransportError> {
        self.recv_with(buf, |socket, buf| {
            socket
                .recv_from(buf)
                .map(|(n, addr)| (n, Endpoint::from(addr)))
        })
    }

    fn recv_with<R>(
        &mut self,
        buf: &mut [u8],
        op: impl Fn(&MioUdpSocket, &mut [u8]) -> io::Result<R>,
    ) -> Result<R, TransportError> {
        loop {
            if self.socket.is_closed() {
                return Err(TransportError::Closed);
            }
            // Readiness is edge-triggered: drain before parking.
            match op(&self.socket.inner, buf) {
                Ok(r) => return Ok(r),
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
            match self.poll.poll(&mut self.events, None) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        self.socket.detach_closer(self.closer);
    }
}

impl std::fmt::Debug for Receiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Receiver")
            .field("socket", &self.socket)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::{Duration, Instant};

    use super::*;

    fn connected_pair() -> (Arc<UdpSocket>, Arc<UdpSocket>) {
        let a = UdpSocket::bind(Endpoint::localhost(0)).unwrap();
        let b = UdpSocket::bind(Endpoint::localhost(0)).unwrap();
        a.connect_to(b.local_addr().unwrap()).unwrap();
        b.connect_to(a.local_addr().unwrap()).unwrap();
        (Arc::new(a), Arc::new(b))
    }

    #[test]
    fn socket_bind_and_local_addr() {
        let socket = UdpSocket::bind(Endpoint::localhost(0)).unwrap();
        let addr = socket.local_addr().unwrap();
        assert_eq!(
            addr.ip(),
            std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)
        );
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn connect_targets_peer() {
        let server = UdpSocket::bind(Endpoint::localhost(0)).unwrap();
        let client = UdpSocket::connect(server.local_addr().unwrap()).unwrap();
        assert_eq!(client.peer_addr().unwrap(), server.local_addr().unwrap());
    }

    #[test]
    fn blocking_recv_gets_datagram() {
        let (a, b) = connected_pair();
        let mut rx = Receiver::new(Arc::clone(&b)).unwrap();

        let sender = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            a.send(b"hi").unwrap();
        });

        let mut buf = [0u8; 16];
        let n = rx.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hi");
        sender.join().unwrap();
    }

    #[test]
    fn recv_drains_queued_datagrams() {
        let (a, b) = connected_pair();
        let mut rx = Receiver::new(b).unwrap();
        a.send(b"1").unwrap();
        a.send(b"2").unwrap();

        let mut buf = [0u8; 16];
        let n = rx.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"1");
        let n = rx.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"2");
    }

    #[test]
    fn close_releases_blocked_receiver() {
        let (_a, b) = connected_pair();
        let mut rx = Receiver::new(Arc::clone(&b)).unwrap();

        let started = Instant::now();
        let reader = thread::spawn(move || {
            let mut buf = [0u8; 16];
            rx.recv(&mut buf)
        });

        thread::sleep(Duration::from_millis(50));
        assert!(b.close());
        let result = reader.join().unwrap();
        assert!(matches!(result, Err(TransportError::Closed)));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn receiver_attached_after_close_sees_closed() {
        let (_a, b) = connected_pair();
        b.close();
        let mut rx = Receiver::new(b).unwrap();
        let mut buf = [0u8; 16];
        assert!(rx.recv(&mut buf).unwrap_err().is_closed());
    }

    #[test]
    fn close_is_idempotent_and_blocks_sends() {
        let (a, _b) = connected_pair();
        assert!(a.close());
        assert!(!a.close());
        assert!(matches!(a.send(b"x"), Err(TransportError::Closed)));
    }

    #[test]
    fn dropped_receivers_detach_from_socket() {
        let (_a, b) = connected_pair();
        let kept = Receiver::new(Arc::clone(&b)).unwrap();
        for _ in 0..16 {
            drop(Receiver::new(Arc::clone(&b)).unwrap());
        }
        assert_eq!(b.closer_count(), 1);

        drop(kept);
        assert_eq!(b.closer_count(), 0);
        assert!(b.close());
    }

    #[test]
    fn close_still_wakes_remaining_receiver() {
        let (_a, b) = connected_pair();
        drop(Receiver::new(Arc::clone(&b)).unwrap());
        let mut rx = Receiver::new(Arc::clone(&b)).unwrap();

        let reader = thread::spawn(move || {
            let mut buf = [0u8; 16];
            rx.recv(&mut buf)
        });
        thread::sleep(Duration::from_millis(20));
        b.close();
        assert!(reader.join().unwrap().unwrap_err().is_closed());
    }

    #[test]
    fn buffer_sizes_can_be_set() {
        let socket = UdpSocket::bind(Endpoint::localhost(0)).unwrap();
        socket.set_recv_buffer_size(1024 * 1024).unwrap();
        socket.set_send_buffer_size(256 * 1024).unwrap();
    }
}
