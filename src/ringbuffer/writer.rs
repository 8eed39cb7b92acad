#![allow(unsafe_code)]
//! Producer side of the ring buffer wire protocol.
//!
//! All mutation happens while holding the robust mutex stored in the section.
//! Control words are published with release stores so that lock-free readers
//! which load them with acquire ordering also see the entry bytes.
//!
//! When an entry does not fit, the oldest entries are dropped first: the tail
//! (`last_valid`) walks forward over them and `dropped` counts each one. Bytes
//! that do not frame as an entry are skipped individually.

use memmap2::MmapMut;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::crc8;
use crate::error::{TraceError, TraceResult};
use crate::ringbuffer::codec::{self, ENTRY_OVERHEAD, HEADER_SIZE, MAX_PAYLOAD, TRAILER_SIZE};
use crate::ringbuffer::control::{ControlBlock, CONTROL_OFFSET};
use crate::ringbuffer::{BODY_OFFSET, MUTEX_OFFSET, RING_VERSION};
use crate::sync::RobustMutex;

const WORD_CAPACITY: usize = 0;
const WORD_WRAPPED: usize = 1;
const WORD_DROPPED: usize = 2;
const WORD_ENTRIES: usize = 3;
const WORD_NEXT_FREE: usize = 4;
const WORD_LAST_VALID: usize = 5;

/// Appends framed entries to a ring buffer section of a writable mapping.
pub struct RingBufferWriter {
    path: PathBuf,

    /// Keeps the raw pointers below valid.
    #[expect(
        dead_code,
        reason = "mmap must be kept alive to maintain memory mapping validity"
    )]
    mmap: MmapMut,

    /// First control word.
    /// SAFETY: points into `mmap`, 8-byte aligned, valid while `mmap` lives.
    control: *const AtomicU64,

    /// Start of the circular body.
    /// SAFETY: points into `mmap`, valid for `capacity` bytes.
    body: *mut u8,

    capacity: u64,
    mutex: RobustMutex,
}

impl std::fmt::Debug for RingBufferWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBufferWriter")
            .field("path", &self.path)
            .field("capacity", &self.capacity)
            .field("control", &self.control_block())
            .finish()
    }
}

// SAFETY: the writer owns its mapping; the raw pointers never escape and are
// only dereferenced while the mapping is alive.
unsafe impl Send for RingBufferWriter {}

// SAFETY: every mutation of the shared section is serialized by the robust
// mutex, and control words are accessed atomically.
unsafe impl Sync for RingBufferWriter {}

impl RingBufferWriter {
    /// Lay out a fresh ring buffer in `size` bytes at `section` of `mmap`.
    ///
    /// The body gets everything after the fixed section header.
    pub fn init(mmap: MmapMut, path: &Path, section: usize, size: usize) -> TraceResult<Self> {
        let minimum = BODY_OFFSET + 1;
        if (size as u64) <= minimum {
            return Err(TraceError::BufferTooSmall {
                size: size as u64,
                minimum,
            });
        }
        check_section(&mmap, path, section, size)?;
        let mut mmap = mmap;

        // SAFETY: `check_section` verified that `section..section + size` lies
        // inside the mapping and that `section` is 8-byte aligned.
        let base = unsafe { mmap.as_mut_ptr().add(section) };
        let capacity = size as u64 - BODY_OFFSET;
        // SAFETY: the header occupies the first BODY_OFFSET bytes of the section.
        unsafe {
            std::ptr::write_bytes(base, 0, BODY_OFFSET as usize);
            base.cast::<u64>().write(RING_VERSION.to_le());
        }
        // SAFETY: mutex region lies inside the zeroed header and is 8-byte aligned.
        let mutex = unsafe { RobustMutex::init(base.add(MUTEX_OFFSET as usize))? };
        let writer = Self::from_parts(mmap, path, base, capacity, mutex);
        writer.store(WORD_CAPACITY, capacity);

        tracing::debug!(path = %path.display(), section, capacity, "initialized ring buffer");
        Ok(writer)
    }

    /// Attach to a ring buffer initialized earlier, possibly by another process.
    pub fn open(mmap: MmapMut, path: &Path, section: usize) -> TraceResult<Self> {
        check_section(&mmap, path, section, BODY_OFFSET as usize)?;
        let mut mmap = mmap;
        // SAFETY: section header is inside the mapping (checked above).
        let base = unsafe { mmap.as_mut_ptr().add(section) };
        // SAFETY: aligned and in bounds; only read atomically.
        let capacity = unsafe {
            let control = base.add(CONTROL_OFFSET as usize) as *const AtomicU64;
            u64::from_le((*control).load(Ordering::Acquire))
        };
        let body_end = section as u64 + BODY_OFFSET + capacity;
        if capacity <= 1 || body_end > mmap.len() as u64 {
            return Err(TraceError::InvalidFile {
                path: path.to_path_buf(),
                reason: format!("ring buffer capacity {capacity} does not fit the file"),
            });
        }
        // SAFETY: mutex was created by `init` (possibly in another process).
        let mutex = unsafe { RobustMutex::attach(base.add(MUTEX_OFFSET as usize)) };
        Ok(Self::from_parts(mmap, path, base, capacity, mutex))
    }

    fn from_parts(
        mmap: MmapMut,
        path: &Path,
        base: *mut u8,
        capacity: u64,
        mutex: RobustMutex,
    ) -> Self {
        // SAFETY: both offsets lie inside the section checked by the caller.
        let (control, body) = unsafe {
            (
                base.add(CONTROL_OFFSET as usize) as *const AtomicU64,
                base.add(BODY_OFFSET as usize),
            )
        };
        Self {
            path: path.to_path_buf(),
            mmap,
            control,
            body,
            capacity,
            mutex,
        }
    }

    /// Usable bytes (`capacity - 1`).
    pub fn capacity(&self) -> u64 {
        self.capacity - 1
    }

    /// Largest payload [`append`](Self::append) accepts.
    pub fn max_payload(&self) -> usize {
        let by_capacity = usize::try_from(self.capacity().saturating_sub(ENTRY_OVERHEAD as u64))
            .unwrap_or(usize::MAX);
        by_capacity.min(MAX_PAYLOAD)
    }

    /// Current control block.
    pub fn control_block(&self) -> ControlBlock {
        ControlBlock {
            capacity: self.load(WORD_CAPACITY),
            wrapped: self.load(WORD_WRAPPED),
            dropped: self.load(WORD_DROPPED),
            entries: self.load(WORD_ENTRIES),
            next_free: self.load(WORD_NEXT_FREE),
            last_valid: self.load(WORD_LAST_VALID),
        }
    }

    /// Bytes between tail and head.
    pub fn occupied(&self) -> u64 {
        self.control_block().occupied()
    }

    /// `capacity() - occupied()`.
    pub fn available(&self) -> u64 {
        self.capacity().saturating_sub(self.occupied())
    }

    /// Append one entry, dropping the oldest entries as needed.
    ///
    /// Returns the payload length.
    pub fn append(&self, payload: &[u8]) -> TraceResult<usize> {
        if payload.is_empty() {
            return Err(TraceError::EmptyPayload);
        }
        let limit = self.max_payload();
        if payload.len() > limit {
            return Err(TraceError::PayloadTooLarge {
                len: payload.len(),
                limit,
            });
        }
        let len = u16::try_from(payload.len()).map_err(|_| TraceError::PayloadTooLarge {
            len: payload.len(),
            limit,
        })?;

        let header = codec::encode_header(len);
        let trailer = [codec::payload_crc(payload)];
        let needed = codec::entry_size(payload.len()) as u64;

        let _guard = self.mutex.lock()?;
        let mut state = self.control_block();

        let dropped_before = state.dropped;
        while needed > self.capacity().saturating_sub(state.occupied()) {
            self.drop_oldest(&mut state);
        }
        if state.dropped != dropped_before {
            tracing::trace!(
                path = %self.path.display(),
                dropped = state.dropped - dropped_before,
                "dropped oldest entries to make room"
            );
            self.store(WORD_DROPPED, state.dropped);
        }
        // Move the tail before overwriting anything behind it.
        self.store(WORD_LAST_VALID, state.last_valid);

        let start = state.next_free;
        self.copy_in(start, &header);
        self.copy_in((start + HEADER_SIZE as u64) % self.capacity, payload);
        self.copy_in(
            (start + HEADER_SIZE as u64 + u64::from(len)) % self.capacity,
            &trailer,
        );

        let end = start + needed;
        if end >= self.capacity {
            self.store(WORD_NEXT_FREE, end - self.capacity);
            self.store(WORD_WRAPPED, state.wrapped.saturating_add(1));
        } else {
            self.store(WORD_NEXT_FREE, end);
        }
        self.store(WORD_ENTRIES, state.entries.saturating_add(1));

        Ok(payload.len())
    }

    /// Discard everything currently stored.
    pub fn clear(&self) -> TraceResult<()> {
        let _guard = self.mutex.lock()?;
        let state = self.control_block();
        self.store(WORD_DROPPED, state.entries);
        self.store(WORD_LAST_VALID, state.next_free);
        Ok(())
    }

    /// Advance the local tail past one entry (or past garbage).
    fn drop_oldest(&self, state: &mut ControlBlock) {
        let mut occupied = state.occupied();
        let mut skipped_garbage = false;
        while occupied > 0 {
            if occupied <= HEADER_SIZE as u64 {
                self.move_tail(state, occupied);
                return;
            }
            let mut header = [0u8; HEADER_SIZE];
            self.copy_out(state.last_valid, &mut header);
            if !codec::header_valid(&header) {
                self.move_tail(state, 1);
                occupied -= 1;
                skipped_garbage = true;
                continue;
            }
            if skipped_garbage {
                // The next entry starts here; leave it for the next round.
                return;
            }

            self.move_tail(state, HEADER_SIZE as u64);
            occupied -= HEADER_SIZE as u64;
            state.dropped = state.dropped.saturating_add(1);

            let rest = u64::from(codec::header_length(&header)) + TRAILER_SIZE as u64;
            if occupied >= rest && self.crc_circular(state.last_valid, rest) == 0 {
                self.move_tail(state, rest);
            }
            return;
        }
    }

    fn move_tail(&self, state: &mut ControlBlock, bytes: u64) {
        state.last_valid = (state.last_valid + bytes) % self.capacity;
    }

    fn load(&self, word: usize) -> u64 {
        // SAFETY: `word` < 6, the control block is inside the mapping.
        u64::from_le(unsafe { (*self.control.add(word)).load(Ordering::Acquire) })
    }

    fn store(&self, word: usize, value: u64) {
        // SAFETY: `word` < 6, the control block is inside the mapping.
        unsafe { (*self.control.add(word)).store(value.to_le(), Ordering::Release) }
    }

    /// Copy `data` into the body at `offset`, wrapping at the end.
    fn copy_in(&self, offset: u64, data: &[u8]) {
        let offset = offset as usize;
        let capacity = self.capacity as usize;
        let first = data.len().min(capacity - offset);
        // SAFETY: `offset < capacity` and both parts stay within the body;
        // `data` never aliases the mapping.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.body.add(offset), first);
            std::ptr::copy_nonoverlapping(data.as_ptr().add(first), self.body, data.len() - first);
        }
    }

    /// Copy `out.len()` bytes out of the body at `offset`, wrapping at the end.
    fn copy_out(&self, offset: u64, out: &mut [u8]) {
        let offset = offset as usize;
        let capacity = self.capacity as usize;
        let first = out.len().min(capacity - offset);
        // SAFETY: as in `copy_in`.
        unsafe {
            std::ptr::copy_nonoverlapping(self.body.add(offset), out.as_mut_ptr(), first);
            std::ptr::copy_nonoverlapping(self.body, out.as_mut_ptr().add(first), out.len() - first);
        }
    }

    /// CRC-8 over `len` body bytes at `offset`, wrapping at the end.
    fn crc_circular(&self, offset: u64, len: u64) -> u8 {
        let offset = offset as usize;
        let len = len as usize;
        let first = len.min(self.capacity as usize - offset);
        // SAFETY: `offset < capacity` and `len <= capacity`, so both spans lie
        // within the body. Producers only write while holding the mutex,
        // which the caller holds.
        let (head, tail) = unsafe {
            (
                std::slice::from_raw_parts(self.body.add(offset), first),
                std::slice::from_raw_parts(self.body, len - first),
            )
        };
        crc8::checksum_spans(&[head, tail])
    }
}

fn check_section(mmap: &MmapMut, path: &Path, section: usize, size: usize) -> TraceResult<()> {
    let end = section.checked_add(size);
    if section % 8 != 0 || end.map_or(true, |end| end > mmap.len()) {
        return Err(TraceError::InvalidFile {
            path: path.to_path_buf(),
            reason: format!(
                "ring buffer section {section}+{size} is misaligned or exceeds the file ({} bytes)",
                mmap.len()
            ),
        });
    }
    Ok(())
}
