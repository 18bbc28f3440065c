//! Client runtime for the FastEvent UDP protocol.
//!
//! FastEvent exchanges fixed 2-byte datagrams, `[index, payload]`, where the
//! index is a per-sender sequence number wrapping at 256 and the payload is a
//! single command byte. A [`Session`] pairs a background [`Reader`] with a
//! synchronous [`Writer`] on one socket and reports both directions of
//! traffic through callbacks:
//!
//! ```no_run
//! use fastevent::{Command, Session, config::ServiceConfig};
//!
//! let config = ServiceConfig::load("service.cfg")?;
//! let mut session = Session::connect(&config, "localhost")?;
//! session.add_read_callback(|packet| println!("echo {packet}"));
//! session.send_command(Command::EventOn)?;
//! session.close();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! Callbacks run on event-bus dispatch threads, never on the caller's thread.
//! Each bus holds a single coalescing slot, so a callback sees the latest
//! packet at the time its bus wakes; bursts may be observed only partially.
//!
//! [`mock`] and [`latency`] build a mock echo server and a round-trip latency
//! harness on top of the same primitives.
//!
//! [`Reader`]: session::reader::Reader
//! [`Writer`]: session::writer::Writer

pub mod config;
pub mod latency;
pub mod mock;
pub mod net;
pub mod protocol;
pub mod runtime;
pub mod session;
pub mod trace;

pub use config::ServiceConfig;
pub use protocol::{Command, PACKET_LEN, Packet, PacketError, SeqIndex};
pub use session::{Session, SessionError};
pub use trace::init_tracing;
