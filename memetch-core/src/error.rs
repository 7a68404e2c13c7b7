//! Error types for the acquisition engine.
//!
//! Per-page read failures never show up here: the engine recovers them in
//! place by zero-filling the page and only mentions them in debug output.

use std::io;
use thiserror::Error;

/// Main error type for `memetch-core` operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The device could not be opened, or its info could not be queried.
    #[error("Could not open acquisition device: {0}")]
    Open(#[source] Box<Error>),

    /// The driver rejected a control request.
    #[error("IOCTL {code:#x} rejected by the driver: {source}")]
    Ioctl {
        code: u32,
        #[source]
        source: io::Error,
    },

    /// The device info reply was shorter than the fixed driver structure.
    #[error("Device info buffer too short: expected at least {expected} bytes, got {actual}")]
    Decode { expected: usize, actual: usize },

    /// Sink write, device seek or bulk read failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Compression method {name:?} not supported. Valid methods are: {}", crate::codec::VALID_NAMES.join(", "))]
    UnsupportedCodec { name: String },

    #[error("Unknown compression scheme")]
    UnknownFormat,

    /// The running flag was cleared while an operation was in progress.
    #[error("Operation cancelled by user")]
    Cancelled,

    #[error("Device handle has been closed")]
    Closed,

    /// A driver service control request failed.
    #[error("Could not {action} service {name}: {source}")]
    Service {
        name: String,
        action: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("Not supported on this platform: {0}")]
    Unsupported(&'static str),
}

impl Error {
    /// Returns `true` if the user asked for the operation to stop.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

/// Result type alias for `memetch-core` operations.
pub type Result<T> = std::result::Result<T, Error>;
