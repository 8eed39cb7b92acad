//! Ring buffer section of a trace file.
//!
//! Section layout (little-endian, offsets relative to the section start):
//!
//! | Offset | Size       | Field                              |
//! |--------|------------|------------------------------------|
//! | 0      | 8          | format version (currently 1)       |
//! | 8      | 64         | process-shared robust mutex        |
//! | 72     | 48         | [`ControlBlock`]                   |
//! | 120    | 40         | reserved                           |
//! | 160    | `capacity` | circular body holding framed entries |
//!
//! Producers append through [`RingBufferWriter`] while holding the mutex;
//! consumers read lock-free through [`RingBufferReader`].

pub mod codec;
pub mod control;
pub mod entry;
pub mod reader;
pub mod writer;

pub use codec::MAX_PAYLOAD;
pub use control::ControlBlock;
pub use entry::Entry;
pub use reader::{ReaderCursor, RingBufferReader};
pub use writer::RingBufferWriter;

/// Version word written by [`RingBufferWriter::init`].
pub const RING_VERSION: u64 = 1;

/// Offset of the mutex within the section.
pub const MUTEX_OFFSET: u64 = 8;

/// Offset of the circular body within the section.
pub const BODY_OFFSET: u64 = 160;

/// A ring buffer must report more than this many usable bytes to be read.
pub const MIN_READABLE_SIZE: u64 = 10;
