//! Error types for the trace capture and decode library.
//!
//! Two enums cover the crate:
//!
//! - **`TraceError`**: the library-wide error. Opening or creating a trace
//!   file, appending through a writer, loading configuration and starting a
//!   live session all return [`TraceResult`]. Errors raised while *opening* a
//!   file (bad magic, header CRC mismatch, a body too small to be usable) are
//!   fatal for that file only; callers skip it and carry on with the others.
//! - **`ReaderError`**: failures of a single `next_entry()` call on a ring
//!   buffer reader. These are always recoverable. The decoder turns each one
//!   into a synthetic error tracepoint and keeps reading.
//!
//! `#[from]` conversions let `?` lift lower level errors (I/O, figment, region
//! accesses) into these enums.

use std::path::PathBuf;
use thiserror::Error;

use crate::region::RegionError;

/// Convenience alias for results using the library error type.
pub type TraceResult<T> = std::result::Result<T, TraceError>;

/// Library-wide error.
#[derive(Error, Debug)]
pub enum TraceError {
    /// Configuration could not be loaded or parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// A configuration value is invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A file is not a usable tracebuffer.
    #[error("Invalid tracebuffer {}: {reason}", path.display())]
    InvalidFile {
        /// Offending file.
        path: PathBuf,
        /// What is wrong with it.
        reason: String,
    },

    /// Ring buffer region too small to hold anything.
    #[error("Ring buffer region too small: {size} bytes (need more than {minimum})")]
    BufferTooSmall {
        /// Usable bytes requested or found.
        size: u64,
        /// The size must exceed this.
        minimum: u64,
    },

    /// Payload does not fit the ring buffer.
    #[error("Payload of {len} bytes exceeds the limit of {limit} bytes")]
    PayloadTooLarge {
        /// Payload length.
        len: usize,
        /// Largest accepted payload.
        limit: usize,
    },

    /// Empty payloads are never written.
    #[error("Refusing to append an empty payload")]
    EmptyPayload,

    /// Access outside the mapped file.
    #[error("Access at offset {offset} is outside the file ({size} bytes)")]
    OutOfRange {
        /// Requested offset.
        offset: u64,
        /// Mapped file size.
        size: u64,
    },

    /// The shared ring buffer lock could not be taken.
    #[error("Lock error: {0}")]
    Lock(String),

    /// A ring buffer read failed.
    #[error("Reader error: {0}")]
    Reader(#[from] ReaderError),

    /// Live session could not be started.
    #[error("Live session error: {0}")]
    Live(String),
}

impl From<figment::Error> for TraceError {
    fn from(err: figment::Error) -> Self {
        TraceError::Config(Box::new(err))
    }
}

impl From<RegionError> for TraceError {
    fn from(err: RegionError) -> Self {
        match err {
            RegionError::OutOfRange { offset, size, .. } => TraceError::OutOfRange { offset, size },
            RegionError::Misaligned(offset) => TraceError::OutOfRange { offset, size: 0 },
            RegionError::Io(err) => TraceError::Io(err),
        }
    }
}

impl TraceError {
    /// Whether the operation may succeed if simply retried or skipped.
    ///
    /// Structural problems of a file and configuration mistakes are not.
    pub fn is_recoverable(&self) -> bool {
        match self {
            TraceError::Reader(_) | TraceError::Lock(_) | TraceError::OutOfRange { .. } => true,
            TraceError::Config(_)
            | TraceError::Configuration(_)
            | TraceError::Io(_)
            | TraceError::InvalidFile { .. }
            | TraceError::BufferTooSmall { .. }
            | TraceError::PayloadTooLarge { .. }
            | TraceError::EmptyPayload
            | TraceError::Live(_) => false,
        }
    }
}

/// Failure of one ring buffer read. Never fatal for the reader.
#[derive(Error, Debug)]
pub enum ReaderError {
    /// No entry could be framed within the retry ceiling.
    #[error("no valid entry found after {attempts} attempts")]
    RetriesExhausted {
        /// Attempts made before giving up.
        attempts: usize,
    },

    /// Access outside the mapped file.
    #[error("ring buffer access at offset {offset} exceeds the file ({size} bytes)")]
    OutOfRange {
        /// Requested offset.
        offset: u64,
        /// Mapped file size.
        size: u64,
    },

    /// Underlying I/O failure.
    #[error("ring buffer I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<RegionError> for ReaderError {
    fn from(err: RegionError) -> Self {
        match err {
            RegionError::OutOfRange { offset, size, .. } => ReaderError::OutOfRange { offset, size },
            RegionError::Misaligned(offset) => ReaderError::OutOfRange { offset, size: 0 },
            RegionError::Io(err) => ReaderError::Io(err),
        }
    }
}
