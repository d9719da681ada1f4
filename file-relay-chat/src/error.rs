//! Error types for the relay's framing and file protocol.

use std::{io, path::PathBuf};

/// Result type alias
pub type Result<T> = std::result::Result<T, RelayError>;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Transport failure: reset, broken pipe, closed socket.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The peer closed the stream before a declared payload was complete.
    #[error("stream closed after {received} of {expected} payload bytes")]
    Truncated { expected: u64, received: u64 },

    /// Lines cannot carry their own terminator.
    #[error("line contains an embedded line break")]
    EmbeddedNewline,

    #[error("file name is {0} bytes, longer than the {max} byte frame limit", max = u16::MAX)]
    FileNameTooLong(usize),

    /// The name cannot be used to store the file locally.
    #[error("file name {0:?} cannot be stored locally")]
    InvalidFileName(String),

    #[error("declared payload of {len} bytes exceeds the {limit} byte upload limit")]
    PayloadTooLarge { len: u64, limit: u64 },

    /// Resource failure on the local side of a transfer.
    #[error("local file {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed announce line: {0:?}")]
    MalformedAnnounce(String),
}

impl RelayError {
    /// Whether the error leaves the byte stream in an unknown position, so the
    /// connection cannot be used any further.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RelayError::Io(_) | RelayError::Truncated { .. })
    }
}
