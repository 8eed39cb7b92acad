#![allow(unsafe_code)]
//! Growable, read-only memory mapping of a trace file.
//!
//! A [`ByteRegion`] gives random access to a file by absolute byte offset. The
//! file may still be growing while we read it (a producer appending static
//! metadata, or a file that was mapped before it was fully written), so every
//! access that falls past the last known size first calls [`ByteRegion::grow`]
//! once, which re-queries the file size and re-maps. Only if the access is
//! still out of range is it reported as [`RegionError::OutOfRange`].
//!
//! # Concurrency
//!
//! The mapping is `MAP_SHARED`, so bytes written by a producer through its own
//! mapping of the same file become visible here without any coordination. No
//! slice into the mapping ever leaves this module: bytes are copied out with
//! `ptr::copy_nonoverlapping`, and 64-bit header words are read with atomic
//! loads, because the producer mutates them concurrently.
//!
//! Handles are cheap to clone and share one mapping.

use memmap2::{Mmap, MmapOptions};
use parking_lot::RwLock;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by [`ByteRegion`] accesses.
#[derive(Error, Debug)]
pub enum RegionError {
    /// The access lies beyond the end of the file even after growing.
    #[error("out of file access ({offset}+{len}) in {path} of {size} bytes")]
    OutOfRange {
        /// First byte of the access.
        offset: u64,
        /// Length of the access.
        len: u64,
        /// Known file size after growing.
        size: u64,
        /// Backing file.
        path: String,
    },

    /// Atomic loads need naturally aligned addresses.
    #[error("misaligned atomic access at offset {0}")]
    Misaligned(u64),

    /// Opening, stating or mapping the backing file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

struct Mapping {
    mmap: Option<Mmap>,
    size: u64,
}

struct RegionInner {
    path: PathBuf,
    file: File,
    mapping: RwLock<Mapping>,
}

/// Shared, growable read-only view of a file.
#[derive(Clone)]
pub struct ByteRegion {
    inner: Arc<RegionInner>,
}

impl std::fmt::Debug for ByteRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteRegion")
            .field("path", &self.inner.path)
            .field("size", &self.size())
            .finish()
    }
}

impl ByteRegion {
    /// Map `path` read-only.
    pub fn open(path: &Path) -> Result<Self, RegionError> {
        let file = File::open(path)?;
        let region = Self {
            inner: Arc::new(RegionInner {
                path: path.to_path_buf(),
                file,
                mapping: RwLock::new(Mapping {
                    mmap: None,
                    size: 0,
                }),
            }),
        };
        region.grow()?;
        Ok(region)
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Last known size of the file in bytes.
    pub fn size(&self) -> u64 {
        self.inner.mapping.read().size
    }

    /// Re-query the file size and re-map if it changed. Returns the new size.
    pub fn grow(&self) -> Result<u64, RegionError> {
        let mut mapping = self.inner.mapping.write();
        let real_size = self.inner.file.metadata()?.len();
        if real_size == mapping.size && (mapping.mmap.is_some() || real_size == 0) {
            return Ok(mapping.size);
        }
        if real_size == 0 {
            mapping.mmap = None;
            mapping.size = 0;
            return Ok(0);
        }

        // SAFETY: the file is opened read-only and only ever read through raw
        // copies and atomic loads, never through references that assume the
        // bytes are immutable.
        let mmap = unsafe {
            MmapOptions::new()
                .len(real_size as usize)
                .map(&self.inner.file)?
        };
        tracing::trace!(
            path = %self.inner.path.display(),
            old_size = mapping.size,
            new_size = real_size,
            "re-mapped trace file"
        );
        mapping.mmap = Some(mmap);
        mapping.size = real_size;
        Ok(real_size)
    }

    /// Make sure `[offset, offset + len)` is mapped, growing once if needed.
    pub fn ensure(&self, offset: u64, len: u64) -> Result<(), RegionError> {
        let end = offset.checked_add(len).ok_or_else(|| self.out_of_range(offset, len))?;
        if end <= self.size() {
            return Ok(());
        }
        if end <= self.grow()? {
            return Ok(());
        }
        Err(self.out_of_range(offset, len))
    }

    fn out_of_range(&self, offset: u64, len: u64) -> RegionError {
        RegionError::OutOfRange {
            offset,
            len,
            size: self.size(),
            path: self.inner.path.display().to_string(),
        }
    }

    /// Run `f` with the base pointer of the mapping after checking bounds.
    fn with_base<R>(
        &self,
        offset: u64,
        len: u64,
        f: impl FnOnce(*const u8) -> R,
    ) -> Result<R, RegionError> {
        self.ensure(offset, len)?;
        let mapping = self.inner.mapping.read();
        // The file never shrinks underneath a live tracebuffer, but a
        // concurrent grow may have raced with us; re-check under the lock.
        match mapping.mmap.as_ref() {
            Some(mmap) if offset + len <= mapping.size => Ok(f(mmap.as_ptr())),
            _ => Err(self.out_of_range(offset, len)),
        }
    }

    /// Copy `out.len()` bytes starting at `offset`.
    pub fn copy_out(&self, offset: u64, out: &mut [u8]) -> Result<(), RegionError> {
        let len = out.len();
        self.with_base(offset, len as u64, |base| {
            // SAFETY: bounds checked by `with_base`; `out` is a distinct
            // allocation so the ranges cannot overlap.
            unsafe {
                std::ptr::copy_nonoverlapping(base.add(offset as usize), out.as_mut_ptr(), len);
            }
        })
    }

    /// Read a fixed-size byte array at `offset`.
    pub fn read_array<const N: usize>(&self, offset: u64) -> Result<[u8; N], RegionError> {
        let mut out = [0u8; N];
        self.copy_out(offset, &mut out)?;
        Ok(out)
    }

    /// Read one byte.
    pub fn read_u8(&self, offset: u64) -> Result<u8, RegionError> {
        Ok(self.read_array::<1>(offset)?[0])
    }

    /// Read a little-endian `u32`.
    pub fn read_u32(&self, offset: u64) -> Result<u32, RegionError> {
        Ok(u32::from_le_bytes(self.read_array(offset)?))
    }

    /// Read a little-endian `u64` (plain copy, no atomicity).
    pub fn read_u64(&self, offset: u64) -> Result<u64, RegionError> {
        Ok(u64::from_le_bytes(self.read_array(offset)?))
    }

    /// Load `N` consecutive 64-bit words with acquire ordering.
    ///
    /// `offset` must be 8-byte aligned; the mapping itself is page aligned.
    pub fn load_words<const N: usize>(&self, offset: u64) -> Result<[u64; N], RegionError> {
        if offset % 8 != 0 {
            return Err(RegionError::Misaligned(offset));
        }
        self.with_base(offset, (N * 8) as u64, |base| {
            let mut words = [0u64; N];
            for (i, word) in words.iter_mut().enumerate() {
                // SAFETY: in bounds and 8-byte aligned (page aligned base plus
                // an offset that is a multiple of 8). AtomicU64 has the same
                // layout as u64, and the producer only ever stores whole words.
                let atomic = unsafe { &*(base.add(offset as usize + i * 8) as *const AtomicU64) };
                *word = u64::from_le(atomic.load(Ordering::Acquire));
            }
            words
        })
    }

    /// Copy bytes out of a circular sub-region.
    ///
    /// The circular region starts at absolute offset `base` and is `limit`
    /// bytes long; `offset` is relative to `base` and wraps at `limit`. When
    /// the requested range straddles the end it is copied in two passes.
    pub fn copy_circular(
        &self,
        base: u64,
        limit: u64,
        offset: u64,
        out: &mut [u8],
    ) -> Result<(), RegionError> {
        let len = out.len() as u64;
        if limit == 0 || len > limit {
            return Err(self.out_of_range(base + offset, len));
        }
        let offset = offset % limit;
        let first = len.min(limit - offset) as usize;
        let (head, tail) = out.split_at_mut(first);
        self.copy_out(base + offset, head)?;
        if !tail.is_empty() {
            self.copy_out(base, tail)?;
        }
        Ok(())
    }
}
