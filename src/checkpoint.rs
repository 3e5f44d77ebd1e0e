//! Checkpoint ids and replication-stream coordinates.
//!
//! Every persisted index embeds a checkpoint id recording how far it has
//! consumed its inputs: a unix timestamp for offline / tracking-column
//! indexes, or a `(binlog file, offset)` pair for online indexes. The
//! legacy string forms (`Checkpoint:timestamp:N`,
//! `Checkpoint:binlog:file:pos`) are preserved on disk so indexes written
//! by older builds keep loading.

use std::fmt;

use thiserror::Error;

/// Sentinel coordinates carried by a fresh online index before any build
/// or binlog event has touched it. Sorts after every real binlog file.
pub const SENTINEL_LOG_FILE: &str = "zzzzzz.bin";
pub const SENTINEL_LOG_OFFSET: u64 = 99_999_999_999;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CheckpointError {
    #[error("unparseable checkpoint id '{0}'")]
    Unparseable(String),
}

/// A position in the host's replication stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogCoord {
    pub file: String,
    pub offset: u64,
}

impl LogCoord {
    pub fn new(file: impl Into<String>, offset: u64) -> Self {
        Self {
            file: file.into(),
            offset,
        }
    }

    /// Fresh-index sentinel: "no coordinate known".
    pub fn sentinel() -> Self {
        Self::new(SENTINEL_LOG_FILE, SENTINEL_LOG_OFFSET)
    }

    pub fn is_sentinel(&self) -> bool {
        self.file == SENTINEL_LOG_FILE
    }

    /// Strict ordering used for replay idempotence: binlog file names
    /// sort lexicographically (`binlog.000010` < `binlog.000011`), with
    /// the offset breaking ties within a file.
    pub fn is_after(&self, other: &LogCoord) -> bool {
        (self.file == other.file && self.offset > other.offset) || self.file > other.file
    }
}

impl fmt::Display for LogCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({} {})", self.file, self.offset)
    }
}

/// Checkpoint id embedded in a saved index file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Checkpoint {
    /// Last build/refresh start time, unix seconds.
    Timestamp(u64),
    /// Last applied replication coordinate.
    LogCoord(LogCoord),
}

impl Checkpoint {
    /// Parse the legacy string form.
    pub fn parse(s: &str) -> Result<Self, CheckpointError> {
        if let Some(rest) = s.strip_prefix("Checkpoint:timestamp:") {
            let ts = rest
                .parse::<u64>()
                .map_err(|_| CheckpointError::Unparseable(s.to_string()))?;
            return Ok(Checkpoint::Timestamp(ts));
        }
        if let Some(rest) = s.strip_prefix("Checkpoint:binlog:") {
            // File names may not contain ':' but offsets follow the last one.
            let colon = rest
                .rfind(':')
                .ok_or_else(|| CheckpointError::Unparseable(s.to_string()))?;
            let offset = rest[colon + 1..]
                .parse::<u64>()
                .map_err(|_| CheckpointError::Unparseable(s.to_string()))?;
            return Ok(Checkpoint::LogCoord(LogCoord::new(&rest[..colon], offset)));
        }
        Err(CheckpointError::Unparseable(s.to_string()))
    }
}

// The Display form is the on-disk wire format; it must stay byte-for-byte
// compatible with indexes written by earlier builds.
impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Checkpoint::Timestamp(ts) => write!(f, "Checkpoint:timestamp:{ts}"),
            Checkpoint::LogCoord(c) => {
                write!(f, "Checkpoint:binlog:{}:{}", c.file, c.offset)
            }
        }
    }
}
