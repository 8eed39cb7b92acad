//! # tracebuf
//!
//! Capture and decode of memory-mapped trace ring buffers.
//!
//! Producers append framed entries to a ring buffer inside a tracebuffer
//! file, possibly from many processes at once. The decoder reads those
//! buffers without taking the producers' lock, tolerating concurrent
//! overwrites and crashed writers, and turns the entries into tracepoints,
//! either as an offline snapshot or live, merged across buffers in timestamp
//! order.
//!
//! ## Crate Structure
//!
//! - **`region`**: growable read-only mapping of a trace file with bounds
//!   checked and wrap-around copies.
//! - **`crc8`**: the CRC-8 used for entry headers, payloads and file headers.
//! - **`ringbuffer`**: the wire format, the lock-free corruption-tolerant
//!   reader and the producer-side writer.
//! - **`sync`**: process-shared robust mutex that serializes writers.
//! - **`tracebuffer`**: file layout, buffer definition, static metadata,
//!   tracepoint decoding and `TraceSource`.
//! - **`ordered_buffer`**: bounded watermark-gated reorder buffer.
//! - **`snapshot`**: offline decode of files and directories.
//! - **`filter`**: tracepoint criteria (time, pid, tid, message, file).
//! - **`live`**: multi-threaded live tailing on top of `OrderedBuffer`.
//! - **`config`**, **`logging`**, **`error`**: ambient plumbing.

pub mod config;
pub mod crc8;
pub mod error;
pub mod filter;
pub mod live;
pub mod logging;
pub mod ordered_buffer;
pub mod region;
pub mod ringbuffer;
pub mod snapshot;
pub mod sync;
pub mod tracebuffer;

pub use error::{ReaderError, TraceError, TraceResult};
pub use filter::TracepointFilter;
pub use ordered_buffer::{OrderedBuffer, OrderedBufferStats};
pub use ringbuffer::{Entry, RingBufferReader, RingBufferWriter};
pub use tracebuffer::{TraceSource, Tracepoint, TracebufferFile};
