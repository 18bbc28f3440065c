//! Round-trip latency harness.
//!
//! Sends [`Command::EventOn`] requests through a [`Session`] at a fixed rate
//! and matches each echoed packet to its request by sequence index. Because
//! indices wrap at 256, the match goes through a 256-entry table mapping an
//! index to the request it was last assigned to.
//!
//! The request timestamp is taken under the table lock around the send
//! itself, so the read callback always finds the entry of an echo that
//! arrives before `send()` returns. Echoes that the coalescing read bus does
//! not deliver are reported as unanswered.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use minstant::Instant;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;

use crate::config::ServiceConfig;
use crate::protocol::command::FLUSH;
use crate::protocol::{Command, Packet};
use crate::session::{Session, SessionError};
use crate::trace::{debug, info, trace, warn};

/// Log file written when none is given.
pub const DEFAULT_LOG_PATH: &str = "latency.log.json";

/// Remaining drain time below which the harness stops waiting.
const DRAIN_SLACK: Duration = Duration::from_millis(10);

/// Errors running the latency harness.
#[derive(Debug, Error)]
pub enum LatencyError {
    /// The session could not be opened.
    #[error(transparent)]
    Session(#[from] SessionError),
    /// A dispatch frequency of zero.
    #[error("dispatch frequency must be positive")]
    InvalidFrequency,
    /// The log could not be written.
    #[error("failed to write log to {path}: {source}")]
    WriteLog {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Harness tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatencyConfig {
    /// Number of requests to send.
    pub number: usize,
    /// Requests per second.
    pub freq: u32,
    /// How long to keep listening after the last echo.
    pub drain: Duration,
    /// Log every request and echo at `info`.
    pub verbose: bool,
}

impl Default for LatencyConfig {
    fn default() -> Self {
        Self {
            number: 1000,
            freq: 5000,
            drain: Duration::from_secs(2),
            verbose: false,
        }
    }
}

impl LatencyConfig {
    fn interval(&self) -> Result<Duration, LatencyError> {
        if self.freq == 0 {
            return Err(LatencyError::InvalidFrequency);
        }
        Ok(Duration::from_secs(1) / self.freq)
    }
}

/// Maps each of the 256 sequence indices to the request it was last sent as.
#[derive(Debug, Clone)]
pub struct Correlator {
    slots: [Option<usize>; 256],
}

impl Correlator {
    /// Empty table.
    #[must_use]
    pub const fn new() -> Self {
        Self { slots: [None; 256] }
    }

    /// Records that request `offset` went out with `index`.
    ///
    /// Returns the request previously waiting on that index, which can no
    /// longer be matched.
    pub fn record(&mut self, index: u8, offset: usize) -> Option<usize> {
        self.slots[usize::from(index)].replace(offset)
    }

    /// Takes the request waiting on `index`, if any.
    pub fn resolve(&mut self, index: u8) -> Option<usize> {
        self.slots[usize::from(index)].take()
    }

    /// Number of requests still waiting.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

/// Aggregate round-trip figures, in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatencySummary {
    /// Requests dispatched.
    pub sent: usize,
    /// Requests whose echo was matched.
    pub answered: usize,
    /// Fastest round trip.
    pub min_ms: Option<f64>,
    /// Mean round trip.
    pub mean_ms: Option<f64>,
    /// Slowest round trip.
    pub max_ms: Option<f64>,
}

/// Request and response times (seconds since the run started), one pair per
/// request in dispatch order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatencyLog {
    timestamps: Vec<(f64, Option<f64>)>,
}

impl LatencyLog {
    /// `(request, response)` pairs.
    #[must_use]
    pub fn pairs(&self) -> &[(f64, Option<f64>)] {
        &self.timestamps
    }

    /// Round-trip times of the answered requests, in seconds.
    pub fn latencies(&self) -> impl Iterator<Item = f64> + '_ {
        self.timestamps
            .iter()
            .filter_map(|&(request, response)| response.map(|r| r - request))
    }

    /// Summarises the answered round trips.
    #[must_use]
    pub fn summary(&self) -> LatencySummary {
        let mut summary = LatencySummary {
            sent: self.timestamps.len(),
            ..LatencySummary::default()
        };
        let mut total = 0.0;
        for latency in self.latencies().map(|s| s * 1e3) {
            summary.answered += 1;
            total += latency;
            summary.min_ms = Some(summary.min_ms.map_or(latency, |m| m.min(latency)));
            summary.max_ms = Some(summary.max_ms.map_or(latency, |m| m.max(latency)));
        }
        if summary.answered > 0 {
            #[allow(clippy::cast_precision_loss)]
            let answered = summary.answered as f64;
            summary.mean_ms = Some(total / answered);
        }
        summary
    }

    /// Writes `{"timestamps": [[request, response|null], ...], "summary": {...}}`.
    pub fn write_json<W: Write>(&self, writer: W) -> serde_json::Result<()> {
        #[derive(Serialize)]
        struct Document<'a> {
            timestamps: &'a [(f64, Option<f64>)],
            summary: LatencySummary,
        }
        serde_json::to_writer(
            writer,
            &Document {
                timestamps: &self.timestamps,
                summary: self.summary(),
            },
        )
    }

    /// Writes the log as JSON to the file at `path`.
    pub fn save(&self, path: impl AsRef<Path>) -> io::Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        self.write_json(&mut out)?;
        out.flush()
    }
}

struct Shared {
    table: Correlator,
    log: Vec<(f64, Option<f64>)>,
    last_reception: Option<Instant>,
}

/// Drives one latency measurement over a [`Session`].
#[derive(Debug, Clone, Default)]
pub struct LatencyTest {
    config: LatencyConfig,
}

impl LatencyTest {
    /// Harness with the given tunables.
    #[must_use]
    pub const fn new(config: LatencyConfig) -> Self {
        Self { config }
    }

    /// Tunables in use.
    #[must_use]
    pub const fn config(&self) -> &LatencyConfig {
        &self.config
    }

    /// Sends the requests, drains the echoes and returns the log.
    ///
    /// Dispatch stops early if a send fails. The session stays open.
    pub fn run(&self, session: &Session) -> Result<LatencyLog, LatencyError> {
        let interval = self.config.interval()?;
        let verbose = self.config.verbose;
        let started = Instant::now();
        let shared = Arc::new(Mutex::new(Shared {
            table: Correlator::new(),
            log: Vec::with_capacity(self.config.number),
            last_reception: None,
        }));

        let on_read = {
            let shared = Arc::clone(&shared);
            session.add_read_callback(move |packet: &Packet| {
                let received = Instant::now();
                let mut shared = shared.lock();
                let Some(offset) = shared.table.resolve(packet.index) else {
                    trace!(%packet, "echo without pending request");
                    return;
                };
                shared.log[offset].1 = Some(received.duration_since(started).as_secs_f64());
                shared.last_reception = Some(received);
                drop(shared);
                if verbose {
                    info!(%packet, offset, "read");
                }
            })
        };
        let on_write = session.add_write_callback(move |packet: &Packet| {
            if verbose {
                info!(%packet, "written");
            }
        });

        info!(number = self.config.number, freq = self.config.freq, "starting requests");
        let sent = self.dispatch(session, &shared, started, interval);
        info!(sent, "done writing");

        if let Err(e) = session.send(FLUSH) {
            debug!(error = %e, "flush not sent");
        }
        self.drain(&shared);

        session.remove_read_callback(on_read);
        session.remove_write_callback(on_write);

        let shared = shared.lock();
        if shared.table.pending() > 0 {
            debug!(pending = shared.table.pending(), "requests left unanswered");
        }
        Ok(LatencyLog {
            timestamps: shared.log.clone(),
        })
    }

    fn dispatch(
        &self,
        session: &Session,
        shared: &Mutex<Shared>,
        started: Instant,
        interval: Duration,
    ) -> usize {
        let mut due = Duration::ZERO;
        for offset in 0..self.config.number {
            let now = started.elapsed();
            if due > now {
                thread::sleep(due - now);
            }
            due += interval;

            let mut shared = shared.lock();
            let requested = started.elapsed().as_secs_f64();
            match session.send_command(Command::EventOn) {
                Ok(index) => {
                    if let Some(stale) = shared.table.record(index.get(), offset) {
                        debug!(%index, stale, "index reused before echo");
                    }
                    shared.log.push((requested, None));
                }
                Err(e) => {
                    warn!(error = %e, offset, "send failed, stopping dispatch");
                    return offset;
                }
            }
        }
        self.config.number
    }

    fn drain(&self, shared: &Mutex<Shared>) {
        let since = Instant::now();
        loop {
            let quiet = shared
                .lock()
                .last_reception
                .map_or_else(|| since.elapsed(), |t| t.elapsed().min(since.elapsed()));
            let remaining = self.config.drain.saturating_sub(quiet);
            if remaining < DRAIN_SLACK {
                return;
            }
            if self.config.verbose {
                info!(remaining_s = remaining.as_secs_f64(), "waiting for echoes");
            }
            thread::sleep(remaining);
        }
    }
}

/// Connects to `host`, runs a measurement and writes its log to `logfile`.
pub fn measure(
    service: &ServiceConfig,
    host: &str,
    config: LatencyConfig,
    logfile: impl Into<PathBuf>,
) -> Result<LatencyLog, LatencyError> {
    let logfile = logfile.into();
    let mut session = Session::connect(service, host)?;
    let log = LatencyTest::new(config).run(&session)?;
    session.close();

    let summary = log.summary();
    info!(
        sent = summary.sent,
        answered = summary.answered,
        min_ms = summary.min_ms,
        mean_ms = summary.mean_ms,
        max_ms = summary.max_ms,
        "latency summary"
    );
    log.save(&logfile).map_err(|source| LatencyError::WriteLog {
        path: logfile.clone(),
        source,
    })?;
    info!(path = %logfile.display(), "client log written");
    Ok(log)
}
