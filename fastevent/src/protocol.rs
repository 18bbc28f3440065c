//! FastEvent wire protocol.
//!
//! - `packet`: the 2-byte `(index, payload)` datagram and the writer's
//!   wraparound sequence index.
//! - `command`: payload conventions shared by clients and the mock server.

pub mod command;
pub mod packet;

pub use command::Command;
pub use packet::{PACKET_LEN, Packet, PacketError, SeqIndex};
