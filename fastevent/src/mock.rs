//! Mock FastEvent server.
//!
//! Echoes every request datagram back to its sender, optionally after an
//! injected delay, and logs the arrival time and index of each request. It
//! talks to the raw socket rather than through a [`Session`](crate::Session),
//! since it answers whichever peer wrote to it.
//!
//! Three threads cooperate per run:
//! - **reader** (`fe-mock-reader`): blocking receive + decode, hands requests
//!   to the coordinator.
//! - **coordinator** (the caller of [`MockServer::run`]): timestamps, logs,
//!   applies the lag, hands the echo to the responder.
//! - **responder** (`fe-mock-responder`): sends echoes.
//!
//! Each hand-off is a single-slot [`Handoff`], so at most one request and one
//! response are in flight between threads. The run ends on a
//! [`TERMINATE`](crate::protocol::command::TERMINATE) payload, when the log is
//! full, or when the socket is closed through a [`ShutdownHandle`].

pub mod handoff;
pub mod log;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use minstant::Instant;
use thiserror::Error;

pub use handoff::Handoff;
pub use log::TimestampLog;

use crate::config::{self, ConfigError, ServiceConfig};
use crate::net::{Endpoint, Receiver, TransportError, UdpSocket};
use crate::protocol::command::TERMINATE;
use crate::protocol::{PACKET_LEN, Packet};
use crate::trace::{debug, error, info, warn};

/// Log file written when none is given.
pub const DEFAULT_LOG_PATH: &str = "mockserver.log.json";

/// Errors running the mock server.
#[derive(Debug, Error)]
pub enum MockError {
    /// The socket could not be provisioned.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Socket setup failed.
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    /// A worker thread could not be spawned.
    #[error("failed to spawn {thread} thread: {source}")]
    Spawn {
        thread: &'static str,
        #[source]
        source: io::Error,
    },
    /// A worker thread panicked.
    #[error("{0} thread panicked")]
    Panicked(&'static str),
    /// The log could not be written.
    #[error("failed to write log to {path}: {source}")]
    WriteLog {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Mock server tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockConfig {
    /// Maximum number of requests logged before the server stops.
    pub capacity: usize,
    /// Delay between receiving a request and dispatching its echo.
    pub lag: Duration,
    /// Log every request at `info` instead of `debug`.
    pub verbose: bool,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            lag: Duration::ZERO,
            verbose: false,
        }
    }
}

/// Stops a running [`MockServer`] from another thread.
#[derive(Debug, Clone)]
pub struct ShutdownHandle(Arc<UdpSocket>);

impl ShutdownHandle {
    /// Closes the server socket, ending the run. Idempotent.
    pub fn shutdown(&self) {
        self.0.close();
    }
}

type Request = (Packet, Endpoint);

/// A bound mock server, ready to [`run`](Self::run).
#[derive(Debug)]
pub struct MockServer {
    socket: Arc<UdpSocket>,
    local: Endpoint,
    config: MockConfig,
}

impl MockServer {
    /// Binds to `localhost` on the configured service port.
    pub fn bind(service: &ServiceConfig, config: MockConfig) -> Result<Self, MockError> {
        let (socket, _) = config::bind_socket(service)?;
        Self::from_socket(socket, config)
    }

    /// Serves on an already bound socket.
    pub fn from_socket(socket: UdpSocket, config: MockConfig) -> Result<Self, MockError> {
        let local = socket.local_addr()?;
        Ok(Self {
            socket: Arc::new(socket),
            local,
            config,
        })
    }

    /// Address the server listens on.
    #[must_use]
    pub const fn local_addr(&self) -> Endpoint {
        self.local
    }

    /// Handle that ends the run from another thread.
    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(Arc::clone(&self.socket))
    }

    /// Serves requests until terminated, full, or shut down, and returns the
    /// request log.
    ///
    /// Blocks the calling thread, which acts as the coordinator.
    pub fn run(self) -> Result<TimestampLog, MockError> {
        let requests: Arc<Handoff<Request>> = Arc::new(Handoff::new());
        let responses: Arc<Handoff<Request>> = Arc::new(Handoff::new());

        info!(
            local = %self.local,
            capacity = self.config.capacity,
            lag_us = u64::try_from(self.config.lag.as_micros()).unwrap_or(u64::MAX),
            "mock server listening"
        );

        let reader = self.spawn_reader(&requests)?;
        let responder = match self.spawn_responder(&responses) {
            Ok(handle) => handle,
            Err(e) => {
                self.socket.close();
                requests.close();
                if reader.join().is_err() {
                    error!("reader thread panicked during startup cleanup");
                }
                return Err(e);
            }
        };

        let log = self.coordinate(&requests, &responses);

        responses.close();
        let responded = responder.join();
        self.socket.close();
        requests.close();
        let read = reader.join();

        if log.is_full() {
            info!(capacity = log.capacity(), "reached capacity");
        } else {
            info!(requests = log.len(), "finished");
        }

        responded.map_err(|_| MockError::Panicked("responder"))?;
        read.map_err(|_| MockError::Panicked("reader"))?;
        Ok(log)
    }

    fn coordinate(
        &self,
        requests: &Handoff<Request>,
        responses: &Handoff<Request>,
    ) -> TimestampLog {
        let mut log = TimestampLog::with_capacity(self.config.capacity);
        let started = Instant::now();

        while !log.is_full() {
            let Some((packet, from)) = requests.take() else {
                debug!("request stream ended");
                break;
            };
            let timestamp = started.elapsed().as_secs_f64();
            if packet.payload == TERMINATE {
                info!(%from, "termination request received");
                break;
            }

            log.push(timestamp, packet.index);
            if self.config.verbose {
                info!(%packet, %from, entry = log.len() - 1, "request");
            } else {
                debug!(%packet, %from, entry = log.len() - 1, "request");
            }

            if !self.config.lag.is_zero() {
                thread::sleep(self.config.lag);
            }
            if responses.put((packet, from)).is_err() {
                break;
            }
        }
        log
    }

    fn spawn_reader(
        &self,
        requests: &Arc<Handoff<Request>>,
    ) -> Result<JoinHandle<()>, MockError> {
        let mut receiver = Receiver::new(Arc::clone(&self.socket))?;
        let requests = Arc::clone(requests);
        thread::Builder::new()
            .name("fe-mock-reader".into())
            .spawn(move || {
                read_requests(&mut receiver, &requests);
                requests.close();
            })
            .map_err(|source| MockError::Spawn {
                thread: "reader",
                source,
            })
    }

    fn spawn_responder(
        &self,
        responses: &Arc<Handoff<Request>>,
    ) -> Result<JoinHandle<()>, MockError> {
        let socket = Arc::clone(&self.socket);
        let responses = Arc::clone(responses);
        thread::Builder::new()
            .name("fe-mock-responder".into())
            .spawn(move || send_responses(&socket, &responses))
            .map_err(|source| MockError::Spawn {
                thread: "responder",
                source,
            })
    }
}

fn read_requests(receiver: &mut Receiver, requests: &Handoff<Request>) {
    let mut buf = [0u8; 64];
    loop {
        match receiver.recv_from(&mut buf) {
            Ok((len, from)) => match Packet::decode(&buf[..len]) {
                Ok(packet) => {
                    if requests.put((packet, from)).is_err() {
                        return;
                    }
                }
                Err(e) => warn!(
                    %from,
                    len,
                    expected = PACKET_LEN,
                    error = %e,
                    "dropping malformed request"
                ),
            },
            Err(TransportError::Closed) => {
                info!("socket closed for reading");
                return;
            }
            Err(e) => warn!(error = %e, "receive failed"),
        }
    }
}

fn send_responses(socket: &UdpSocket, responses: &Handoff<Request>) {
    while let Some((packet, to)) = responses.take() {
        match socket.send_to(&packet.encode(), to) {
            Ok(_) => {}
            Err(TransportError::Closed) => {
                info!("socket closed for writing");
                return;
            }
            Err(e) => warn!(%to, error = %e, "failed to send response"),
        }
    }
    debug!("no more responses");
}

/// Runs a server to completion and writes its log as JSON to `outfile`.
pub fn serve(
    service: &ServiceConfig,
    config: MockConfig,
    outfile: impl Into<PathBuf>,
) -> Result<TimestampLog, MockError> {
    let outfile = outfile.into();
    let log = MockServer::bind(service, config)?.run()?;
    log.save(&outfile).map_err(|source| MockError::WriteLog {
        path: outfile.clone(),
        source,
    })?;
    info!(path = %outfile.display(), "mock server log written");
    Ok(log)
}
