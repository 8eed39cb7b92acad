//! Definition section: the tracebuffer's name and where its traces come from.
//!
//! ```text
//! body_size (u64) | name '\0' | [ "CLLTK_EX" | version | source | reserved(5) | crc ]
//! ```
//!
//! The 16-byte extended block is optional. When present, its CRC byte is the
//! CRC-8 over the name, its terminator and the first 15 extended bytes.

use std::fmt;

use crate::crc8;
use crate::error::TraceResult;
use crate::region::ByteRegion;

/// Magic opening the extended block.
pub const EXTENDED_MAGIC: &[u8; 8] = b"CLLTK_EX";

/// Size of the extended block.
pub const EXTENDED_SIZE: usize = 16;

/// Extended block version written by [`Definition::encode`].
pub const EXTENDED_VERSION: u8 = 1;

/// Origin of the traces in a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SourceType {
    /// Legacy file or not specified.
    #[default]
    Unknown,
    /// User-space process.
    Userspace,
    /// Kernel.
    Kernel,
    /// Kernel TTY buffer.
    Tty,
}

impl SourceType {
    /// Decode; unknown values map to [`SourceType::Unknown`].
    pub fn from_u8(raw: u8) -> Self {
        match raw {
            1 => SourceType::Userspace,
            2 => SourceType::Kernel,
            3 => SourceType::Tty,
            _ => SourceType::Unknown,
        }
    }

    /// Wire value.
    pub fn as_u8(self) -> u8 {
        match self {
            SourceType::Unknown => 0,
            SourceType::Userspace => 1,
            SourceType::Kernel => 2,
            SourceType::Tty => 3,
        }
    }

    /// Short lowercase label.
    pub fn as_str(self) -> &'static str {
        match self {
            SourceType::Unknown => "unknown",
            SourceType::Userspace => "userspace",
            SourceType::Kernel => "kernel",
            SourceType::Tty => "tty",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed definition section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Definition {
    name: String,
    source_type: SourceType,
    extended: bool,
    crc_valid: bool,
}

impl Definition {
    /// Parse the section at absolute `offset`.
    ///
    /// Structural problems do not fail here; they yield a definition for which
    /// [`is_valid`](Self::is_valid) is false.
    pub fn parse(region: &ByteRegion, offset: u64) -> TraceResult<Self> {
        let body_size = region.read_u64(offset)?;
        let file_size = region.size();
        if body_size == 0 || body_size > file_size {
            return Ok(Self::invalid());
        }
        let body_start = offset + 8;
        let available = file_size.saturating_sub(body_start).min(body_size);
        let mut body = vec![0u8; available as usize];
        region.copy_out(body_start, &mut body)?;
        Ok(Self::from_body(&body))
    }

    /// Parse the bytes following the `body_size` word.
    pub fn from_body(body: &[u8]) -> Self {
        let name_len = body.iter().position(|&b| b == 0).unwrap_or(body.len());
        let name = String::from_utf8_lossy(&body[..name_len]).into_owned();

        let ext_start = name_len + 1;
        let extended = body
            .get(ext_start..ext_start + EXTENDED_SIZE)
            .filter(|ext| ext.starts_with(EXTENDED_MAGIC));

        match extended {
            Some(ext) => {
                let covered = &body[..ext_start + EXTENDED_SIZE - 1];
                Self {
                    name,
                    source_type: SourceType::from_u8(ext[9]),
                    extended: true,
                    crc_valid: crc8::checksum(covered) == ext[EXTENDED_SIZE - 1],
                }
            }
            None => Self {
                name,
                source_type: SourceType::Unknown,
                extended: false,
                crc_valid: true,
            },
        }
    }

    fn invalid() -> Self {
        Self {
            name: String::new(),
            source_type: SourceType::Unknown,
            extended: false,
            crc_valid: false,
        }
    }

    /// Encode a complete section (including `body_size`) with an extended block.
    pub fn encode(name: &str, source_type: SourceType) -> Vec<u8> {
        let mut body = Vec::with_capacity(name.len() + 1 + EXTENDED_SIZE);
        body.extend_from_slice(name.as_bytes());
        body.push(0);
        body.extend_from_slice(EXTENDED_MAGIC);
        body.push(EXTENDED_VERSION);
        body.push(source_type.as_u8());
        body.extend_from_slice(&[0u8; 5]);
        body.push(crc8::checksum(&body));

        let mut out = Vec::with_capacity(8 + body.len());
        out.extend_from_slice(&(body.len() as u64).to_le_bytes());
        out.extend_from_slice(&body);
        out
    }

    /// Buffer name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Trace origin, `Unknown` without an extended block.
    pub fn source_type(&self) -> SourceType {
        self.source_type
    }

    /// Whether an extended block is present.
    pub fn has_extended(&self) -> bool {
        self.extended
    }

    /// Non-empty name and, if extended, a matching CRC.
    pub fn is_valid(&self) -> bool {
        !self.name.is_empty() && (!self.extended || self.crc_valid)
    }
}
