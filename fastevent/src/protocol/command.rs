//! Command bytes carried in the packet payload.
//!
//! The core never interprets payloads; these are the conventions the test
//! client and the mock server agree on.

use std::fmt;

/// Commands understood by a FastEvent service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    /// Enable synchronization output.
    SyncOn = b'1',
    /// Disable synchronization output.
    SyncOff = b'2',
    /// Raise the event output.
    EventOn = b'A',
    /// Lower the event output.
    EventOff = b'D',
    /// Trigger an acquisition.
    Acquire = b'Y',
    /// Ask the service to quit.
    Quit = b'X',
}

/// Payload asking the mock server to stop immediately.
pub const TERMINATE: u8 = 0x03;

/// Payload the latency harness sends after its last request so the echo of
/// the final request is flushed through.
pub const FLUSH: u8 = 0x80;

impl Command {
    /// Wire byte for this command.
    #[inline]
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

impl From<Command> for u8 {
    fn from(c: Command) -> Self {
        c.as_byte()
    }
}

impl TryFrom<u8> for Command {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            b'1' => Ok(Self::SyncOn),
            b'2' => Ok(Self::SyncOff),
            b'A' => Ok(Self::EventOn),
            b'D' => Ok(Self::EventOff),
            b'Y' => Ok(Self::Acquire),
            b'X' => Ok(Self::Quit),
            other => Err(other),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        char::from(self.as_byte()).fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_bytes_roundtrip() {
        for cmd in [
            Command::SyncOn,
            Command::SyncOff,
            Command::EventOn,
            Command::EventOff,
            Command::Acquire,
            Command::Quit,
        ] {
            assert_eq!(Command::try_from(cmd.as_byte()), Ok(cmd));
        }
    }

    #[test]
    fn reserved_payloads_are_not_commands() {
        assert_eq!(Command::try_from(TERMINATE), Err(TERMINATE));
        assert_eq!(Command::try_from(FLUSH), Err(FLUSH));
    }
}
