//! Static tracepoint metadata and how to find it.
//!
//! A static tracepoint stores only a file offset in its entry; the format
//! string, source location and argument types live once in the trace file at
//! that offset:
//!
//! ```text
//! '{' | size u32 | kind u8 | line u32 | arg_count u8 | arg_types[arg_count] | '\0' | file '\0' | format '\0'
//! ```
//!
//! Decoding goes through the [`MetaLookup`] trait so that other metadata
//! sources can be plugged in; [`FileMetaLookup`] reads the blob straight from
//! the mapped trace file.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use thiserror::Error;

use crate::region::{ByteRegion, RegionError};

/// First byte of every metadata blob.
pub const META_MAGIC: u8 = b'{';

/// Offsets below this value never point at metadata.
pub const MIN_META_OFFSET: u64 = 0xFF;

const FIXED_PART: usize = 11;

/// Why a metadata offset could not be resolved.
#[derive(Error, Debug)]
pub enum MetaError {
    /// Offsets below 0xFF never hold metadata.
    #[error("invalid file offset")]
    InvalidOffset(u64),

    /// Offset lies past the end of the file.
    #[error("file offset bigger than file")]
    BeyondFile {
        /// Requested offset.
        offset: u64,
        /// File size.
        size: u64,
    },

    /// No metadata record starts at the offset.
    #[error("invalid meta magic")]
    InvalidMagic(u64),

    /// Record is cut short.
    #[error("truncated meta data")]
    Truncated,

    /// Reading the file failed.
    #[error("meta data access failed: {0}")]
    Region(#[from] RegionError),
}

/// How the arguments of a static tracepoint are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaKind {
    /// Unknown kind byte.
    Undefined,
    /// printf-style format string.
    Printf,
    /// Hex dump of a byte range.
    Dump,
}

impl MetaKind {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => MetaKind::Printf,
            2 => MetaKind::Dump,
            _ => MetaKind::Undefined,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            MetaKind::Undefined => 0,
            MetaKind::Printf => 1,
            MetaKind::Dump => 2,
        }
    }
}

/// Decoded metadata of one static tracepoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticMeta {
    /// How arguments are rendered.
    pub kind: MetaKind,
    /// Source line of the tracepoint.
    pub line: u32,
    /// One type character per argument.
    pub arg_types: Vec<u8>,
    /// Source file of the tracepoint.
    pub file: String,
    /// printf-style format string.
    pub format: String,
}

impl StaticMeta {
    /// Serialize into the blob layout.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            FIXED_PART + self.arg_types.len() + self.file.len() + self.format.len() + 3,
        );
        out.push(META_MAGIC);
        out.extend_from_slice(&[0u8; 4]);
        out.push(self.kind.as_u8());
        out.extend_from_slice(&self.line.to_le_bytes());
        out.push(self.arg_types.len() as u8);
        out.extend_from_slice(&self.arg_types);
        out.push(0);
        out.extend_from_slice(self.file.as_bytes());
        out.push(0);
        out.extend_from_slice(self.format.as_bytes());
        out.push(0);
        let size = out.len() as u32;
        out[1..5].copy_from_slice(&size.to_le_bytes());
        out
    }

    /// Parse a complete blob (starting at the magic byte).
    pub fn decode(blob: &[u8]) -> Result<Self, MetaError> {
        if blob.first() != Some(&META_MAGIC) {
            return Err(MetaError::InvalidMagic(0));
        }
        if blob.len() < FIXED_PART {
            return Err(MetaError::Truncated);
        }
        let kind = MetaKind::from_u8(blob[5]);
        let line = u32::from_le_bytes([blob[6], blob[7], blob[8], blob[9]]);
        let arg_count = usize::from(blob[10]);
        let arg_types = blob
            .get(FIXED_PART..FIXED_PART + arg_count)
            .ok_or(MetaError::Truncated)?
            .to_vec();

        let strings = blob
            .get(FIXED_PART + arg_count + 1..)
            .ok_or(MetaError::Truncated)?;
        let mut parts = strings.splitn(3, |&b| b == 0);
        let file = parts.next().ok_or(MetaError::Truncated)?;
        let format = parts.next().ok_or(MetaError::Truncated)?;

        Ok(Self {
            kind,
            line,
            arg_types,
            file: String::from_utf8_lossy(file).into_owned(),
            format: String::from_utf8_lossy(format).into_owned(),
        })
    }
}

/// Resolves the metadata offset stored in a static tracepoint entry.
pub trait MetaLookup: Send {
    /// Metadata stored at `offset`.
    fn lookup(&mut self, offset: u64) -> Result<Arc<StaticMeta>, MetaError>;
}

/// Reads metadata blobs from the trace file itself, caching by offset.
#[derive(Debug)]
pub struct FileMetaLookup {
    region: ByteRegion,
    cache: HashMap<u64, Arc<StaticMeta>>,
}

impl FileMetaLookup {
    /// Lookup over the mapped file.
    pub fn new(region: ByteRegion) -> Self {
        Self {
            region,
            cache: HashMap::new(),
        }
    }
}

impl MetaLookup for FileMetaLookup {
    fn lookup(&mut self, offset: u64) -> Result<Arc<StaticMeta>, MetaError> {
        if offset < MIN_META_OFFSET {
            return Err(MetaError::InvalidOffset(offset));
        }
        if let Some(meta) = self.cache.get(&offset) {
            return Ok(Arc::clone(meta));
        }

        // Producers append metadata while we read; look again before giving up.
        let mut size = self.region.size();
        if offset >= size {
            size = self.region.grow()?;
        }
        if offset >= size {
            return Err(MetaError::BeyondFile { offset, size });
        }
        if self.region.read_u8(offset)? != META_MAGIC {
            return Err(MetaError::InvalidMagic(offset));
        }
        let blob_size = self
            .region
            .read_u32(offset + 1)
            .map_err(|_| MetaError::Truncated)?;
        let mut blob = vec![0u8; blob_size as usize];
        self.region
            .copy_out(offset, &mut blob)
            .map_err(|_| MetaError::Truncated)?;

        let meta = Arc::new(StaticMeta::decode(&blob)?);
        self.cache.insert(offset, Arc::clone(&meta));
        Ok(meta)
    }
}

/// Turns a static tracepoint's raw argument bytes into a message.
pub trait MessageFormatter: Send + Sync {
    /// Render the message.
    fn format(&self, meta: &StaticMeta, args: &[u8]) -> String;
}

/// Formatter that does not interpret arguments: the format string followed
/// by the raw argument bytes in hex.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawFormatter;

impl MessageFormatter for RawFormatter {
    fn format(&self, meta: &StaticMeta, args: &[u8]) -> String {
        let mut out = match meta.kind {
            MetaKind::Printf | MetaKind::Dump => meta.format.clone(),
            MetaKind::Undefined => return "<invalid meta data>".to_string(),
        };
        if !args.is_empty() {
            out.push_str(" [");
            for (i, byte) in args.iter().enumerate() {
                if i > 0 {
                    out.push(' ');
                }
                let _ = write!(out, "{byte:02x}");
            }
            out.push(']');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StaticMeta {
        StaticMeta {
            kind: MetaKind::Printf,
            line: 42,
            arg_types: b"uS".to_vec(),
            file: "src/sensor.c".into(),
            format: "reading %u from %s".into(),
        }
    }

    #[test]
    fn test_blob_layout() {
        let blob = sample().encode();
        assert_eq!(blob[0], b'{');
        assert_eq!(u32::from_le_bytes(blob[1..5].try_into().unwrap()) as usize, blob.len());
        assert_eq!(blob[5], 1);
        assert_eq!(blob[10], 2);
        assert_eq!(&blob[11..13], b"uS");
        assert_eq!(blob[13], 0);
        assert_eq!(&blob[14..26], b"src/sensor.c");
        assert_eq!(StaticMeta::decode(&blob).unwrap(), sample());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            StaticMeta::decode(b"not meta"),
            Err(MetaError::InvalidMagic(_))
        ));
        assert!(matches!(
            StaticMeta::decode(b"{\x05\0\0\0"),
            Err(MetaError::Truncated)
        ));
    }

    #[test]
    fn test_raw_formatter() {
        let meta = sample();
        assert_eq!(RawFormatter.format(&meta, &[]), "reading %u from %s");
        assert_eq!(
            RawFormatter.format(&meta, &[0x2a, 0, 0xff]),
            "reading %u from %s [2a 00 ff]"
        );
        let undefined = StaticMeta {
            kind: MetaKind::Undefined,
            ..meta
        };
        assert_eq!(RawFormatter.format(&undefined, &[1]), "<invalid meta data>");
    }
}
