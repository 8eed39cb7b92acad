//! Decoded trace events.
//!
//! Every ring buffer entry body starts with a 22 byte head:
//!
//! | Offset | Size | Field                                   |
//! |--------|------|-----------------------------------------|
//! | 0      | 6    | metadata file offset (1 = dynamic)      |
//! | 6      | 4    | pid                                     |
//! | 10     | 4    | tid                                     |
//! | 14     | 8    | timestamp in nanoseconds                |
//! | 22     | ..   | arguments                               |
//!
//! Dynamic tracepoints carry `file '\0' | line u64 | message '\0'` as their
//! arguments; static ones carry raw argument bytes described by metadata
//! stored elsewhere in the file.

use std::borrow::Cow;
use std::sync::Arc;

use crate::tracebuffer::definition::SourceType;
use crate::tracebuffer::meta::{MessageFormatter, MetaLookup, StaticMeta, MIN_META_OFFSET};

/// Metadata offset marking a dynamic tracepoint.
pub const DYNAMIC_META_OFFSET: u64 = 1;

/// Size of the common entry head.
pub const ENTRY_HEAD_SIZE: usize = 22;

const META_OFFSET_MASK: u64 = (1 << 48) - 1;

/// Fields shared by every entry body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHead {
    /// Metadata offset, or 1 for dynamic entries.
    pub meta_offset: u64,
    /// Producing process.
    pub pid: u32,
    /// Producing thread.
    pub tid: u32,
    /// Nanoseconds since the Unix epoch.
    pub timestamp_ns: u64,
}

impl EntryHead {
    /// Parse the head of `body`; `None` if it is too short.
    pub fn parse(body: &[u8]) -> Option<Self> {
        let head = body.get(..ENTRY_HEAD_SIZE)?;
        let mut offset = [0u8; 8];
        offset[..6].copy_from_slice(&head[..6]);
        Some(Self {
            meta_offset: u64::from_le_bytes(offset) & META_OFFSET_MASK,
            pid: u32::from_le_bytes(head[6..10].try_into().ok()?),
            tid: u32::from_le_bytes(head[10..14].try_into().ok()?),
            timestamp_ns: u64::from_le_bytes(head[14..22].try_into().ok()?),
        })
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.meta_offset & META_OFFSET_MASK).to_le_bytes()[..6]);
        out.extend_from_slice(&self.pid.to_le_bytes());
        out.extend_from_slice(&self.tid.to_le_bytes());
        out.extend_from_slice(&self.timestamp_ns.to_le_bytes());
    }
}

/// Build the body of a dynamic tracepoint.
pub fn encode_dynamic_body(
    pid: u32,
    tid: u32,
    timestamp_ns: u64,
    file: &str,
    line: u64,
    message: &str,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(ENTRY_HEAD_SIZE + file.len() + message.len() + 10);
    EntryHead {
        meta_offset: DYNAMIC_META_OFFSET,
        pid,
        tid,
        timestamp_ns,
    }
    .encode_into(&mut out);
    out.extend_from_slice(file.as_bytes());
    out.push(0);
    out.extend_from_slice(&line.to_le_bytes());
    out.extend_from_slice(message.as_bytes());
    out.push(0);
    out
}

/// Build the body of a static tracepoint whose metadata lives at `meta_offset`.
pub fn encode_static_body(
    meta_offset: u64,
    pid: u32,
    tid: u32,
    timestamp_ns: u64,
    args: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(ENTRY_HEAD_SIZE + args.len());
    EntryHead {
        meta_offset,
        pid,
        tid,
        timestamp_ns,
    }
    .encode_into(&mut out);
    out.extend_from_slice(args);
    out
}

/// What kind of event a [`Tracepoint`] is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TracepointKind {
    /// Message formatted by the producer.
    Dynamic {
        /// Source file.
        file: String,
        /// Source line.
        line: u64,
        /// Formatted message.
        message: String,
    },
    /// Message rendered on demand from metadata and raw arguments.
    Static {
        /// Metadata the entry points at.
        meta: Arc<StaticMeta>,
        /// Raw argument bytes.
        args: Vec<u8>,
    },
    /// A malformed entry or a failed read.
    Error {
        /// Human-readable cause.
        reason: String,
    },
}

/// One decoded trace event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tracepoint {
    /// Name of the buffer it was read from.
    pub tracebuffer: Arc<str>,
    /// Sequence number within that buffer.
    pub nr: u64,
    /// Nanoseconds since the Unix epoch.
    pub timestamp_ns: u64,
    /// Producing process.
    pub pid: u32,
    /// Producing thread.
    pub tid: u32,
    /// Origin of the buffer.
    pub source_type: SourceType,
    /// Payload.
    pub kind: TracepointKind,
}

impl Tracepoint {
    /// Decode an entry body.
    ///
    /// Never fails: structural problems produce an error tracepoint.
    pub fn decode(
        tracebuffer: &Arc<str>,
        source_type: SourceType,
        nr: u64,
        body: &[u8],
        lookup: &mut dyn MetaLookup,
    ) -> Self {
        let Some(head) = EntryHead::parse(body) else {
            return Self::error(tracebuffer, source_type, nr, 0, "entry too short");
        };
        let args = &body[ENTRY_HEAD_SIZE..];

        let kind = if head.meta_offset == DYNAMIC_META_OFFSET {
            decode_dynamic(args)
        } else if head.meta_offset < MIN_META_OFFSET {
            TracepointKind::Error {
                reason: "invalid file offset".into(),
            }
        } else {
            match lookup.lookup(head.meta_offset) {
                Ok(meta) => TracepointKind::Static {
                    meta,
                    args: args.to_vec(),
                },
                Err(err) => TracepointKind::Error {
                    reason: err.to_string(),
                },
            }
        };

        Self {
            tracebuffer: Arc::clone(tracebuffer),
            nr,
            timestamp_ns: head.timestamp_ns,
            pid: head.pid,
            tid: head.tid,
            source_type,
            kind,
        }
    }

    /// Synthetic error tracepoint.
    pub fn error(
        tracebuffer: &Arc<str>,
        source_type: SourceType,
        nr: u64,
        timestamp_ns: u64,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            tracebuffer: Arc::clone(tracebuffer),
            nr,
            timestamp_ns,
            pid: 0,
            tid: 0,
            source_type,
            kind: TracepointKind::Error {
                reason: reason.into(),
            },
        }
    }

    /// Synthetic tracepoint describing a decode or read failure.
    pub fn is_error(&self) -> bool {
        matches!(self.kind, TracepointKind::Error { .. })
    }

    /// Source file of the trace call, empty for errors.
    pub fn file(&self) -> &str {
        match &self.kind {
            TracepointKind::Dynamic { file, .. } => file,
            TracepointKind::Static { meta, .. } => &meta.file,
            TracepointKind::Error { .. } => "",
        }
    }

    /// Source line of the trace call, 0 for errors.
    pub fn line(&self) -> u64 {
        match &self.kind {
            TracepointKind::Dynamic { line, .. } => *line,
            TracepointKind::Static { meta, .. } => u64::from(meta.line),
            TracepointKind::Error { .. } => 0,
        }
    }

    /// Message text; static messages are rendered by `formatter`.
    pub fn message(&self, formatter: &dyn MessageFormatter) -> Cow<'_, str> {
        match &self.kind {
            TracepointKind::Dynamic { message, .. } => Cow::Borrowed(message),
            TracepointKind::Static { meta, args } => Cow::Owned(formatter.format(meta, args)),
            TracepointKind::Error { reason } => Cow::Borrowed(reason),
        }
    }

    /// `seconds.nanoseconds`, right aligned to 20 characters.
    pub fn timestamp_str(&self) -> String {
        let secs = self.timestamp_ns / 1_000_000_000;
        let nanos = self.timestamp_ns % 1_000_000_000;
        format!("{:>20}", format!("{secs}.{nanos:09}"))
    }

    /// UTC wall clock time, `YYYY-MM-DD HH:MM:SS.nnnnnnnnn`.
    pub fn date_and_time_str(&self) -> String {
        let secs = (self.timestamp_ns / 1_000_000_000) as i64;
        let nanos = (self.timestamp_ns % 1_000_000_000) as u32;
        chrono::DateTime::from_timestamp(secs, nanos)
            .map(|t| t.format("%Y-%m-%d %H:%M:%S%.9f").to_string())
            .unwrap_or_else(|| self.timestamp_str().trim_start().to_string())
    }

    /// One plain-text line.
    pub fn render(&self, formatter: &dyn MessageFormatter) -> String {
        let message = self.message(formatter);
        match &self.kind {
            TracepointKind::Error { .. } => format!(
                "{} | {} | {:>7} | {:>7} | <error> | {}",
                self.timestamp_str(),
                self.tracebuffer,
                self.pid,
                self.tid,
                message
            ),
            _ => format!(
                "{} | {} | {:>7} | {:>7} | {}:{} | {}",
                self.timestamp_str(),
                self.tracebuffer,
                self.pid,
                self.tid,
                self.file(),
                self.line(),
                message
            ),
        }
    }
}

fn decode_dynamic(args: &[u8]) -> TracepointKind {
    let Some(file_len) = args.iter().position(|&b| b == 0) else {
        return TracepointKind::Error {
            reason: "dynamic tracepoint without file".into(),
        };
    };
    let rest = &args[file_len + 1..];
    let Some(line) = rest.get(..8).and_then(|raw| <[u8; 8]>::try_from(raw).ok()) else {
        return TracepointKind::Error {
            reason: "dynamic tracepoint without line".into(),
        };
    };
    let message = &rest[8..];
    let message_len = message.iter().position(|&b| b == 0).unwrap_or(message.len());

    TracepointKind::Dynamic {
        file: String::from_utf8_lossy(&args[..file_len]).into_owned(),
        line: u64::from_le_bytes(line),
        message: String::from_utf8_lossy(&message[..message_len]).into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracebuffer::meta::{MetaError, MetaKind, RawFormatter};

    struct NoMeta;

    impl MetaLookup for NoMeta {
        fn lookup(&mut self, offset: u64) -> Result<Arc<StaticMeta>, MetaError> {
            Err(MetaError::BeyondFile { offset, size: 0 })
        }
    }

    struct OneMeta(Arc<StaticMeta>);

    impl MetaLookup for OneMeta {
        fn lookup(&mut self, _offset: u64) -> Result<Arc<StaticMeta>, MetaError> {
            Ok(Arc::clone(&self.0))
        }
    }

    fn name() -> Arc<str> {
        Arc::from("unit")
    }

    #[test]
    fn test_dynamic_body_decodes() {
        let body = encode_dynamic_body(10, 11, 1_500_000_000, "main.rs", 77, "hello world");
        let tp = Tracepoint::decode(&name(), SourceType::Userspace, 4, &body, &mut NoMeta);
        assert_eq!(tp.nr, 4);
        assert_eq!(tp.pid, 10);
        assert_eq!(tp.tid, 11);
        assert_eq!(tp.timestamp_ns, 1_500_000_000);
        assert_eq!(tp.file(), "main.rs");
        assert_eq!(tp.line(), 77);
        assert_eq!(tp.message(&RawFormatter), "hello world");
        assert!(!tp.is_error());
    }

    #[test]
    fn test_small_meta_offsets_are_invalid() {
        for offset in [0u64, 2, 0xFE] {
            let body = encode_static_body(offset, 1, 1, 5, &[]);
            let tp = Tracepoint::decode(&name(), SourceType::Unknown, 0, &body, &mut NoMeta);
            assert_eq!(
                tp.kind,
                TracepointKind::Error {
                    reason: "invalid file offset".into()
                }
            );
            assert_eq!(tp.timestamp_ns, 5);
        }
    }

    #[test]
    fn test_lookup_failure_becomes_error() {
        let body = encode_static_body(0x1000, 1, 1, 5, &[1, 2]);
        let tp = Tracepoint::decode(&name(), SourceType::Unknown, 0, &body, &mut NoMeta);
        assert_eq!(tp.message(&RawFormatter), "file offset bigger than file");
    }

    #[test]
    fn test_static_tracepoint_uses_meta() {
        let meta = Arc::new(StaticMeta {
            kind: MetaKind::Printf,
            line: 9,
            arg_types: vec![b'u'],
            file: "drv.c".into(),
            format: "value %u".into(),
        });
        let body = encode_static_body(0x200, 1, 2, 3, &[7, 0, 0, 0]);
        let tp = Tracepoint::decode(&name(), SourceType::Kernel, 1, &body, &mut OneMeta(meta));
        assert_eq!(tp.file(), "drv.c");
        assert_eq!(tp.line(), 9);
        assert_eq!(tp.message(&RawFormatter), "value %u [07 00 00 00]");
    }

    #[test]
    fn test_short_body_is_error() {
        let tp = Tracepoint::decode(&name(), SourceType::Unknown, 0, &[1, 0, 0], &mut NoMeta);
        assert!(tp.is_error());
    }

    #[test]
    fn test_time_rendering() {
        let tp = Tracepoint::error(&name(), SourceType::Unknown, 0, 1_700_000_000_123_456_789, "x");
        assert_eq!(tp.timestamp_str(), "1700000000.123456789");
        assert_eq!(tp.date_and_time_str(), "2023-11-14 22:13:20.123456789");

        let early = Tracepoint::error(&name(), SourceType::Unknown, 0, 5, "x");
        assert_eq!(early.timestamp_str(), "         0.000000005");
    }
}
