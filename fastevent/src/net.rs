//! Network transport primitives.
//!
//! A single [`UdpSocket`] is shared by a session's reader thread and its
//! sending callers. Receiving goes through a [`Receiver`], which blocks
//! without a timeout and is released by [`UdpSocket::close`].

pub mod endpoint;
pub mod socket;

pub use endpoint::Endpoint;
pub use socket::{Receiver, TransportError, UdpSocket};
