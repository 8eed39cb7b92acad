#![allow(unsafe_code)]
//! A complete tracebuffer file: file header, definition and ring buffer.
//!
//! ```text
//! offset  size  field
//! 0       16    magic "?#$~tracebuffer\0"
//! 16      8     version (major, minor, patch in bytes 2, 1, 0)
//! 24      8     definition section offset
//! 32      8     ring buffer section offset
//! 40      8     static metadata section offset
//! 48      7     padding
//! 55      1     crc8, so that the crc over all 56 bytes is zero
//! ```
//!
//! Static metadata blobs are appended after the ring buffer section while
//! producers run, so the file may grow underneath readers.

use memmap2::MmapMut;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use crate::crc8;
use crate::error::{TraceError, TraceResult};
use crate::region::ByteRegion;
use crate::ringbuffer::control::{ControlBlock, CONTROL_OFFSET};
use crate::ringbuffer::{RingBufferReader, RingBufferWriter, BODY_OFFSET, MIN_READABLE_SIZE};
use crate::tracebuffer::definition::{Definition, SourceType};
use crate::tracebuffer::meta::StaticMeta;

/// Magic at the start of every tracebuffer file.
pub const FILE_MAGIC: [u8; 16] = *b"?#$~tracebuffer\0";

/// Size of the file header.
pub const FILE_HEADER_SIZE: usize = 56;

/// Extension of user-space tracebuffers.
pub const TRACE_EXTENSION: &str = "clltk_trace";

/// Extension of kernel tracebuffers.
pub const KERNEL_TRACE_EXTENSION: &str = "clltk_ktrace";

/// File format version written by [`TracebufferFile::create`].
pub const FORMAT_VERSION: Version = Version {
    major: 1,
    minor: 2,
    patch: 0,
};

/// File format version triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    /// Major version.
    pub major: u8,
    /// Minor version.
    pub minor: u8,
    /// Patch version.
    pub patch: u8,
}

impl Version {
    /// Unpack from the header word (bytes 2/1/0).
    pub fn from_raw(raw: u64) -> Self {
        Self {
            major: (raw >> 16) as u8,
            minor: (raw >> 8) as u8,
            patch: raw as u8,
        }
    }

    /// Pack into the header word.
    pub fn to_raw(self) -> u64 {
        (u64::from(self.major) << 16) | (u64::from(self.minor) << 8) | u64::from(self.patch)
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Decoded file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    /// Format version.
    pub version: Version,
    /// Absolute offset of the definition section.
    pub definition_offset: u64,
    /// Absolute offset of the ring buffer section.
    pub ringbuffer_offset: u64,
    /// Absolute offset where static metadata starts.
    pub stack_offset: u64,
}

impl FileHeader {
    /// Serialize, including the trailing CRC.
    pub fn encode(&self) -> [u8; FILE_HEADER_SIZE] {
        let mut out = [0u8; FILE_HEADER_SIZE];
        out[..16].copy_from_slice(&FILE_MAGIC);
        out[16..24].copy_from_slice(&self.version.to_raw().to_le_bytes());
        out[24..32].copy_from_slice(&self.definition_offset.to_le_bytes());
        out[32..40].copy_from_slice(&self.ringbuffer_offset.to_le_bytes());
        out[40..48].copy_from_slice(&self.stack_offset.to_le_bytes());
        out[FILE_HEADER_SIZE - 1] = crc8::checksum(&out[..FILE_HEADER_SIZE - 1]);
        out
    }

    /// Validate magic and CRC; the error is a human readable reason.
    pub fn decode(bytes: &[u8; FILE_HEADER_SIZE]) -> Result<Self, &'static str> {
        if bytes[..16] != FILE_MAGIC {
            return Err("invalid magic");
        }
        if !crc8::self_check(bytes) {
            return Err("file header crc mismatch");
        }
        let word = |at: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[at..at + 8]);
            u64::from_le_bytes(raw)
        };
        Ok(Self {
            version: Version::from_raw(word(16)),
            definition_offset: word(24),
            ringbuffer_offset: word(32),
            stack_offset: word(40),
        })
    }
}

/// Quick check whether `path` looks like a tracebuffer.
///
/// A path with an extension must use one of the tracebuffer extensions; the
/// file must start with [`FILE_MAGIC`].
pub fn is_tracebuffer(path: &Path) -> bool {
    if let Some(ext) = path.extension() {
        if ext != TRACE_EXTENSION && ext != KERNEL_TRACE_EXTENSION {
            return false;
        }
    }
    let Ok(mut file) = File::open(path) else {
        return false;
    };
    let mut magic = [0u8; 16];
    file.read_exact(&mut magic).is_ok() && magic == FILE_MAGIC
}

/// An opened, validated tracebuffer file.
#[derive(Debug)]
pub struct TracebufferFile {
    path: PathBuf,
    region: ByteRegion,
    header: FileHeader,
    definition: Definition,
    capacity: u64,
}

impl TracebufferFile {
    /// Map and validate an existing file.
    ///
    /// Fails on a bad magic or header CRC, an invalid definition or a ring
    /// buffer that does not report more than 10 usable bytes.
    pub fn open(path: &Path) -> TraceResult<Self> {
        let invalid = |reason: &str| TraceError::InvalidFile {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };

        let region = ByteRegion::open(path)?;
        if region.size() < FILE_HEADER_SIZE as u64 {
            return Err(invalid("file too small"));
        }
        let raw = region.read_array::<FILE_HEADER_SIZE>(0)?;
        let header = FileHeader::decode(&raw).map_err(invalid)?;

        let definition = Definition::parse(&region, header.definition_offset)
            .map_err(|_| invalid("definition outside the file"))?;
        if !definition.is_valid() {
            return Err(invalid("invalid definition"));
        }

        let control = ControlBlock::capture(&region, header.ringbuffer_offset + CONTROL_OFFSET)
            .map_err(|_| invalid("ring buffer outside the file"))?;
        if control.capacity.saturating_sub(1) <= MIN_READABLE_SIZE {
            return Err(invalid("ring buffer too small"));
        }

        tracing::debug!(
            path = %path.display(),
            name = definition.name(),
            version = %header.version,
            capacity = control.capacity,
            "opened tracebuffer"
        );
        Ok(Self {
            path: path.to_path_buf(),
            region,
            header,
            definition,
            capacity: control.capacity,
        })
    }

    /// Create a new tracebuffer file with `capacity` usable ring buffer bytes.
    ///
    /// The file is written under a temporary name and linked into place, so
    /// readers never see a half-initialized file. Fails if `path` exists.
    pub fn create(
        path: &Path,
        name: &str,
        capacity: u64,
        source_type: SourceType,
    ) -> TraceResult<Self> {
        if name.is_empty() || name.contains('\0') || name.contains('/') {
            return Err(TraceError::InvalidFile {
                path: path.to_path_buf(),
                reason: format!("invalid tracebuffer name {name:?}"),
            });
        }
        if capacity <= MIN_READABLE_SIZE {
            return Err(TraceError::BufferTooSmall {
                size: capacity,
                minimum: MIN_READABLE_SIZE,
            });
        }
        if path.exists() {
            return Err(TraceError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("{} already exists", path.display()),
            )));
        }

        let definition = Definition::encode(name, source_type);
        let definition_offset = FILE_HEADER_SIZE as u64;
        let ringbuffer_offset = round_up(definition_offset + definition.len() as u64, 8);
        let ringbuffer_size = BODY_OFFSET + capacity + 1;
        let stack_offset = round_up(ringbuffer_offset + ringbuffer_size, 8);
        let header = FileHeader {
            version: FORMAT_VERSION,
            definition_offset,
            ringbuffer_offset,
            stack_offset,
        };

        let temp = temp_path(path);
        // Linking instead of renaming keeps a concurrently created file intact.
        let result = write_new_file(&temp, &header, &definition, ringbuffer_size)
            .and_then(|()| std::fs::hard_link(&temp, path).map_err(TraceError::from));
        let _ = std::fs::remove_file(&temp);
        result?;

        tracing::info!(path = %path.display(), name, capacity, "created tracebuffer");
        Self::open(path)
    }

    /// Open `path`, creating it first if it does not exist yet.
    pub fn open_or_create(
        path: &Path,
        name: &str,
        capacity: u64,
        source_type: SourceType,
    ) -> TraceResult<Self> {
        match Self::create(path, name, capacity, source_type) {
            Err(TraceError::Io(err)) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                Self::open(path)
            }
            other => other,
        }
    }

    /// Path the file was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read-only mapping of the whole file.
    pub fn region(&self) -> &ByteRegion {
        &self.region
    }

    /// Parsed file header.
    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    /// Format version from the header.
    pub fn version(&self) -> Version {
        self.header.version
    }

    /// Parsed definition section.
    pub fn definition(&self) -> &Definition {
        &self.definition
    }

    /// Tracebuffer name.
    pub fn name(&self) -> &str {
        self.definition.name()
    }

    /// Origin of the traces.
    pub fn source_type(&self) -> SourceType {
        self.definition.source_type()
    }

    /// Usable ring buffer bytes.
    pub fn size(&self) -> u64 {
        self.capacity - 1
    }

    /// A new reader positioned at the current tail.
    pub fn reader(&self) -> TraceResult<RingBufferReader> {
        RingBufferReader::new(self.region.clone(), self.header.ringbuffer_offset)
    }

    /// A writer attached to this file's ring buffer.
    pub fn writer(&self) -> TraceResult<RingBufferWriter> {
        let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        // SAFETY: the mapping is shared with other producers and readers, which
        // only touch it through the atomic and locked protocol in `ringbuffer`.
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        let section = usize::try_from(self.header.ringbuffer_offset).map_err(|_| {
            TraceError::InvalidFile {
                path: self.path.clone(),
                reason: "ring buffer offset out of range".into(),
            }
        })?;
        RingBufferWriter::open(mmap, &self.path, section)
    }

    /// Append a static metadata blob to the file and return its offset.
    ///
    /// The file is locked exclusively while appending so concurrent producers
    /// get distinct offsets.
    pub fn add_static_meta(&self, meta: &StaticMeta) -> TraceResult<u64> {
        let blob = meta.encode();
        let file = OpenOptions::new().append(true).open(&self.path)?;
        let _lock = FileLock::exclusive(&file)?;
        let offset = file.metadata()?.len();
        (&file).write_all(&blob)?;
        (&file).flush()?;
        tracing::trace!(path = %self.path.display(), offset, len = blob.len(), "appended static meta");
        Ok(offset)
    }
}

fn write_new_file(
    path: &Path,
    header: &FileHeader,
    definition: &[u8],
    ringbuffer_size: u64,
) -> TraceResult<()> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(path)?;
    file.set_len(header.stack_offset)?;
    // SAFETY: the file was just created by us and is not visible to anyone
    // else under its temporary name.
    let mut mmap = unsafe { MmapMut::map_mut(&file)? };

    let definition_at = header.definition_offset as usize;
    mmap[..FILE_HEADER_SIZE].copy_from_slice(&header.encode());
    mmap[definition_at..definition_at + definition.len()].copy_from_slice(definition);
    mmap.flush()?;

    let section = header.ringbuffer_offset as usize;
    let writer = RingBufferWriter::init(mmap, path, section, ringbuffer_size as usize)?;
    drop(writer);
    file.sync_all()?;
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".{}.tmp", std::process::id()));
    path.with_file_name(name)
}

fn round_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

/// Advisory `flock` held until dropped.
struct FileLock<'a> {
    file: &'a File,
}

impl<'a> FileLock<'a> {
    fn exclusive(file: &'a File) -> TraceResult<Self> {
        // SAFETY: the descriptor is valid for the lifetime of `file`.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if rc != 0 {
            return Err(TraceError::Lock(format!(
                "flock failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(Self { file })
    }
}

impl Drop for FileLock<'_> {
    fn drop(&mut self) {
        // SAFETY: as above.
        unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let header = FileHeader {
            version: FORMAT_VERSION,
            definition_offset: 56,
            ringbuffer_offset: 96,
            stack_offset: 4096,
        };
        let bytes = header.encode();
        assert_eq!(&bytes[..16], b"?#$~tracebuffer\0");
        assert!(crc8::self_check(&bytes));
        assert_eq!(FileHeader::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn test_header_damage_is_detected() {
        let header = FileHeader {
            version: FORMAT_VERSION,
            definition_offset: 56,
            ringbuffer_offset: 96,
            stack_offset: 4096,
        };
        let mut bytes = header.encode();
        bytes[30] ^= 0x01;
        assert_eq!(FileHeader::decode(&bytes), Err("file header crc mismatch"));
        bytes[0] = b'!';
        assert_eq!(FileHeader::decode(&bytes), Err("invalid magic"));
    }

    #[test]
    fn test_version_bytes() {
        let v = Version::from_raw(0x0001_0203);
        assert_eq!(v.to_string(), "1.2.3");
        assert_eq!(v.to_raw(), 0x0001_0203);
    }

    #[test]
    fn test_create_then_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("motion.clltk_trace");
        let created = TracebufferFile::create(&path, "motion", 4096, SourceType::Userspace).unwrap();
        assert_eq!(created.name(), "motion");
        assert_eq!(created.size(), 4096);
        assert_eq!(created.header().ringbuffer_offset % 8, 0);

        let opened = TracebufferFile::open(&path).unwrap();
        assert_eq!(opened.name(), "motion");
        assert_eq!(opened.source_type(), SourceType::Userspace);
        assert_eq!(opened.version(), FORMAT_VERSION);
        assert!(is_tracebuffer(&path));

        assert!(TracebufferFile::create(&path, "motion", 4096, SourceType::Userspace).is_err());
        assert!(TracebufferFile::open_or_create(&path, "motion", 4096, SourceType::Userspace).is_ok());
    }

    #[test]
    fn test_is_tracebuffer_checks_extension_and_magic() {
        let dir = tempfile::tempdir().unwrap();
        let wrong_ext = dir.path().join("data.txt");
        std::fs::write(&wrong_ext, FILE_MAGIC).unwrap();
        assert!(!is_tracebuffer(&wrong_ext));

        let no_magic = dir.path().join("other.clltk_trace");
        std::fs::write(&no_magic, b"definitely not a tracebuffer").unwrap();
        assert!(!is_tracebuffer(&no_magic));

        let no_ext = dir.path().join("plain");
        std::fs::write(&no_ext, FILE_MAGIC).unwrap();
        assert!(is_tracebuffer(&no_ext));
    }

    #[test]
    fn test_concurrent_static_meta_appends_get_distinct_offsets() {
        use crate::tracebuffer::meta::MetaKind;
        use std::sync::Arc;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.clltk_trace");
        let file =
            Arc::new(TracebufferFile::create(&path, "meta", 4096, SourceType::Userspace).unwrap());
        let end = std::fs::metadata(&path).unwrap().len();

        let handles: Vec<_> = (0..4u32)
            .map(|t| {
                let file = Arc::clone(&file);
                std::thread::spawn(move || {
                    (0..8u32)
                        .map(|i| {
                            let meta = StaticMeta {
                                kind: MetaKind::Printf,
                                line: t * 100 + i,
                                arg_types: Vec::new(),
                                file: format!("thread{t}.c"),
                                format: "tick".into(),
                            };
                            (file.add_static_meta(&meta).unwrap(), meta)
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut appended: Vec<(u64, StaticMeta)> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        appended.sort_by_key(|(offset, _)| *offset);

        let bytes = std::fs::read(&path).unwrap();
        let mut expected = end;
        for (offset, meta) in &appended {
            assert_eq!(*offset, expected);
            let blob = meta.encode();
            let at = *offset as usize;
            assert_eq!(&bytes[at..at + blob.len()], blob.as_slice());
            expected += blob.len() as u64;
        }
        assert_eq!(expected, bytes.len() as u64);
    }

    #[test]
    fn test_rejects_bad_names_and_sizes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.clltk_trace");
        assert!(TracebufferFile::create(&path, "", 4096, SourceType::Unknown).is_err());
        assert!(TracebufferFile::create(&path, "a/b", 4096, SourceType::Unknown).is_err());
        assert!(matches!(
            TracebufferFile::create(&path, "small", 10, SourceType::Unknown),
            Err(TraceError::BufferTooSmall { .. })
        ));
        assert!(!path.exists());
    }
}
