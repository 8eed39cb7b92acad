//! Lock-free, corruption tolerant ring buffer reader.
//!
//! A reader never takes the producer's mutex. It snapshots the control block,
//! validates its own cursor against that snapshot and then scans forward from
//! the cursor looking for a well-formed entry. Anything that does not frame
//! (wrong marker, implausible length, bad header CRC, bad payload CRC) is
//! skipped one byte at a time. When the writer has overtaken the cursor the
//! reader jumps forward to the tail and accounts for the lost entries through
//! the `dropped` counter.
//!
//! Every read is bounded: after `max(10_240, capacity)` attempts without a
//! result the call gives up with [`ReaderError::RetriesExhausted`]. The next
//! call starts over from wherever the cursor ended up.

use crate::error::{ReaderError, TraceError, TraceResult};
use crate::region::ByteRegion;
use crate::ringbuffer::codec::{self, HEADER_SIZE, TRAILER_SIZE};
use crate::ringbuffer::control::{ControlBlock, CONTROL_OFFSET};
use crate::ringbuffer::entry::{Entry, EntryBody};
use crate::ringbuffer::{BODY_OFFSET, MIN_READABLE_SIZE};

/// Minimum number of attempts a single read may take.
const MIN_RETRIES: usize = 10_240;

/// Read progress of one reader. Owned by the reading thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReaderCursor {
    /// Absolute read offset.
    pub position: u128,
    /// Highest position ever reached, kept across resyncs.
    pub last_known_position: u128,
    /// Sequence number for the next extracted entry.
    pub next_sequence_number: u64,
}

impl ReaderCursor {
    /// Start a cursor at the tail of `snapshot`.
    pub fn new(snapshot: &ControlBlock) -> Self {
        let mut cursor = Self {
            next_sequence_number: snapshot.dropped,
            ..Self::default()
        };
        cursor.resync(snapshot);
        cursor
    }

    /// Move forward to the tail if the writer has overtaken us.
    ///
    /// Never moves backwards: a cursor ahead of the tail is left alone.
    pub fn resync(&mut self, snapshot: &ControlBlock) {
        let tail = snapshot.tail();
        if tail < self.position {
            return;
        }
        self.last_known_position = self.last_known_position.max(self.position);
        self.position = self.position.max(tail);
        self.next_sequence_number = self.next_sequence_number.max(snapshot.dropped);
    }

    /// `tail <= position <= head` on a consistent snapshot.
    pub fn within(&self, snapshot: &ControlBlock) -> bool {
        snapshot.is_consistent()
            && snapshot.tail() <= self.position
            && self.position <= snapshot.head()
    }

    /// Bytes between the furthest known read point and the head, at most
    /// `capacity - 1`.
    pub fn pending(&self, snapshot: &ControlBlock) -> u64 {
        let head = snapshot.head();
        let from = snapshot
            .tail()
            .max(self.position)
            .max(self.last_known_position);
        let diff = head.saturating_sub(from);
        let limit = snapshot.capacity.saturating_sub(1);
        u64::try_from(diff).unwrap_or(u64::MAX).min(limit)
    }

    fn advance(&mut self, bytes: u64) {
        self.position += u128::from(bytes);
    }

    fn take_sequence_number(&mut self) -> u64 {
        let nr = self.next_sequence_number;
        self.next_sequence_number = self.next_sequence_number.saturating_add(1);
        nr
    }
}

/// Outcome of inspecting the bytes under the cursor.
enum Scan {
    Found(Entry),
    Skip,
}

/// Single reader over one ring buffer section of a mapped file.
#[derive(Debug)]
pub struct RingBufferReader {
    region: ByteRegion,
    control: u64,
    body: u64,
    capacity: u64,
    version: u64,
    retry_limit: usize,
    cursor: ReaderCursor,
}

impl RingBufferReader {
    /// Attach to the ring buffer section starting at absolute `section` offset.
    ///
    /// Fails if the reported size (`capacity - 1`) is not larger than 10 bytes
    /// or the body is not fully present in the file.
    pub fn new(region: ByteRegion, section: u64) -> TraceResult<Self> {
        let version = region.read_u64(section)?;
        let control = section + CONTROL_OFFSET;
        let snapshot = ControlBlock::capture(&region, control)?;
        let capacity = snapshot.capacity;
        if capacity.saturating_sub(1) <= MIN_READABLE_SIZE {
            return Err(TraceError::BufferTooSmall {
                size: capacity.saturating_sub(1),
                minimum: MIN_READABLE_SIZE,
            });
        }
        let body = section + BODY_OFFSET;
        region.ensure(body, capacity)?;

        let retry_limit = usize::try_from(capacity)
            .unwrap_or(usize::MAX)
            .max(MIN_RETRIES);
        tracing::debug!(
            path = %region.path().display(),
            section,
            capacity,
            version,
            "attached ring buffer reader"
        );
        Ok(Self {
            cursor: ReaderCursor::new(&snapshot),
            region,
            control,
            body,
            capacity,
            version,
            retry_limit,
        })
    }

    /// Ring buffer format version.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Usable size in bytes (`capacity - 1`).
    pub fn size(&self) -> u64 {
        self.capacity - 1
    }

    /// Current cursor.
    pub fn cursor(&self) -> ReaderCursor {
        self.cursor
    }

    /// Fresh control block snapshot.
    pub fn capture(&self) -> Result<ControlBlock, ReaderError> {
        Ok(ControlBlock::capture(&self.region, self.control)?)
    }

    /// Completed laps of the writer.
    pub fn wrapped(&self) -> Result<u64, ReaderError> {
        Ok(self.capture()?.wrapped)
    }

    /// Entries lost before they were read.
    pub fn dropped(&self) -> Result<u64, ReaderError> {
        Ok(self.capture()?.dropped)
    }

    /// Entries ever written.
    pub fn entry_count(&self) -> Result<u64, ReaderError> {
        Ok(self.capture()?.entries)
    }

    /// Bytes in use: the head offset until the first wrap, the full size after.
    pub fn used(&self) -> Result<u64, ReaderError> {
        let c = self.capture()?;
        Ok(if c.wrapped == 0 {
            c.next_free
        } else {
            self.size()
        })
    }

    /// `size() - used()`.
    pub fn available(&self) -> Result<u64, ReaderError> {
        Ok(self.size().saturating_sub(self.used()?))
    }

    /// Bytes not yet consumed by this reader.
    pub fn pending_bytes(&self) -> Result<u64, ReaderError> {
        Ok(self.cursor.pending(&self.capture()?))
    }

    /// Catch up with the tail if the writer overtook the cursor.
    pub fn reset(&mut self) -> Result<(), ReaderError> {
        let snapshot = self.capture()?;
        self.cursor.resync(&snapshot);
        Ok(())
    }

    /// Jump to the head so only entries written from now on are returned.
    pub fn skip_to_end(&mut self) -> Result<(), ReaderError> {
        let snapshot = self.capture()?;
        self.cursor.resync(&snapshot);
        if snapshot.is_consistent() && self.cursor.position < snapshot.head() {
            self.cursor.position = snapshot.head();
            self.cursor.last_known_position = self.cursor.last_known_position.max(snapshot.head());
            self.cursor.next_sequence_number = self
                .cursor
                .next_sequence_number
                .max(snapshot.entries);
        }
        Ok(())
    }

    /// Extract the next well-formed entry.
    ///
    /// `Ok(None)` means nothing is pending right now.
    pub fn next_entry(&mut self) -> Result<Option<Entry>, ReaderError> {
        let mut attempts = 0usize;
        while attempts < self.retry_limit {
            attempts += 1;

            let snapshot = self.capture()?;
            self.cursor.resync(&snapshot);
            if !self.cursor.within(&snapshot) {
                self.cursor.resync(&snapshot);
                continue;
            }

            let pending = self.cursor.pending(&snapshot);
            if pending == 0 {
                return Ok(None);
            }

            match self.scan(pending)? {
                Scan::Found(entry) => return Ok(Some(entry)),
                Scan::Skip => self.cursor.advance(1),
            }
        }

        tracing::debug!(
            path = %self.region.path().display(),
            attempts,
            position = %self.cursor.position,
            "giving up on ring buffer read"
        );
        Err(ReaderError::RetriesExhausted { attempts })
    }

    /// Try to frame an entry at the cursor.
    fn scan(&mut self, pending: u64) -> Result<Scan, ReaderError> {
        let rel = self.relative_position();

        if self.region.read_u8(self.body + rel)? != codec::MARKER {
            return Ok(Scan::Skip);
        }

        let mut header = [0u8; HEADER_SIZE];
        self.region
            .copy_circular(self.body, self.capacity, rel, &mut header)?;
        let length = usize::from(codec::header_length(&header));
        let size = codec::entry_size(length);
        // A complete entry never exceeds what has been published, the body or
        // the wire limit; a header claiming otherwise is garbage that happens
        // to start with the marker.
        if size >= usize::from(u16::MAX)
            || size as u64 > self.capacity - 1
            || size as u64 > pending
        {
            tracing::trace!(position = %self.cursor.position, length, "implausible entry length");
            return Ok(Scan::Skip);
        }
        if !codec::header_valid(&header) {
            return Ok(Scan::Skip);
        }

        let mut body = EntryBody::from_elem(0, length);
        let payload_at = (rel + HEADER_SIZE as u64) % self.capacity;
        self.region
            .copy_circular(self.body, self.capacity, payload_at, &mut body)?;
        let trailer_at = (payload_at + length as u64) % self.capacity;
        let trailer = self.region.read_u8(self.body + trailer_at)?;
        if trailer != codec::payload_crc(&body) {
            tracing::debug!(position = %self.cursor.position, length, "payload crc mismatch");
            return Ok(Scan::Skip);
        }

        self.cursor
            .advance((HEADER_SIZE + length + TRAILER_SIZE) as u64);
        Ok(Scan::Found(Entry {
            sequence_number: self.cursor.take_sequence_number(),
            body,
            valid: true,
        }))
    }

    fn relative_position(&self) -> u64 {
        // The remainder is below `capacity`, which is a u64.
        (self.cursor.position % u128::from(self.capacity)) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(wrapped: u64, next_free: u64, last_valid: u64, dropped: u64) -> ControlBlock {
        ControlBlock {
            capacity: 100,
            wrapped,
            dropped,
            entries: dropped + 10,
            next_free,
            last_valid,
        }
    }

    #[test]
    fn test_cursor_starts_at_tail() {
        let c = snapshot(1, 20, 50, 3);
        let cursor = ReaderCursor::new(&c);
        assert_eq!(cursor.position, 50);
        assert_eq!(cursor.next_sequence_number, 3);
        assert!(cursor.within(&c));
        assert_eq!(cursor.pending(&c), 70);
    }

    #[test]
    fn test_resync_only_moves_forward() {
        let mut cursor = ReaderCursor {
            position: 80,
            last_known_position: 0,
            next_sequence_number: 5,
        };
        cursor.resync(&snapshot(0, 90, 40, 1));
        assert_eq!(cursor.position, 80);
        assert_eq!(cursor.next_sequence_number, 5);

        // Writer overtook the cursor.
        cursor.resync(&snapshot(2, 60, 70, 9));
        assert_eq!(cursor.position, 170);
        assert_eq!(cursor.last_known_position, 80);
        assert_eq!(cursor.next_sequence_number, 9);
    }

    #[test]
    fn test_pending_is_clamped_to_size() {
        // Head a full lap ahead of the tail, as seen mid-update.
        let c = ControlBlock {
            capacity: 100,
            wrapped: 1,
            next_free: 100,
            last_valid: 0,
            ..ControlBlock::default()
        };
        assert!(c.is_consistent());
        assert_eq!(c.head() - c.tail(), 100);
        assert_eq!(ReaderCursor::default().pending(&c), 99);

        let behind = ReaderCursor {
            position: 100,
            last_known_position: 150,
            next_sequence_number: 0,
        };
        assert_eq!(behind.pending(&c), 50);
    }

    #[test]
    fn test_cursor_beyond_head_is_not_within() {
        let cursor = ReaderCursor {
            position: 95,
            ..ReaderCursor::default()
        };
        assert!(!cursor.within(&snapshot(0, 90, 0, 0)));
        assert_eq!(cursor.pending(&snapshot(0, 90, 0, 0)), 0);
    }
}
