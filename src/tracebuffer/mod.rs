//! Tracebuffer files and the tracepoints decoded from them.

pub mod definition;
pub mod file;
pub mod meta;
pub mod source;
pub mod tracepoint;

pub use definition::{Definition, SourceType};
pub use file::{is_tracebuffer, TracebufferFile, Version};
pub use meta::{FileMetaLookup, MessageFormatter, MetaLookup, RawFormatter, StaticMeta};
pub use source::TraceSource;
pub use tracepoint::{Tracepoint, TracepointKind};
