//! Fixed-capacity request log kept by the mock server.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use serde::Serialize;

/// Arrival time (seconds since server start) and sequence index of each
/// request, in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TimestampLog {
    timestamps: Vec<f64>,
    indices: Vec<u8>,
    #[serde(skip)]
    capacity: usize,
}

impl TimestampLog {
    /// Empty log holding at most `capacity` entries.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            timestamps: Vec::with_capacity(capacity),
            indices: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends an entry. Returns `false` (and records nothing) when full.
    pub fn push(&mut self, timestamp: f64, index: u8) -> bool {
        if self.is_full() {
            return false;
        }
        self.timestamps.push(timestamp);
        self.indices.push(index);
        true
    }

    /// Number of recorded entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// Whether nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Whether no more entries fit.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Maximum number of entries.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Recorded arrival times.
    #[must_use]
    pub fn timestamps(&self) -> &[f64] {
        &self.timestamps
    }

    /// Recorded sequence indices.
    #[must_use]
    pub fn indices(&self) -> &[u8] {
        &self.indices
    }

    /// Writes `{"timestamps": [...], "indices": [...]}` to `writer`.
    pub fn write_json<W: Write>(&self, writer: W) -> serde_json::Result<()> {
        serde_json::to_writer(writer, self)
    }

    /// Writes the log as JSON to the file at `path`.
    pub fn save(&self, path: impl AsRef<Path>) -> io::Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        self.write_json(&mut out)?;
        out.flush()
    }
}
