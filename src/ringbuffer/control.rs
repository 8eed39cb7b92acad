//! Ring buffer control block: capacity and head/tail progress.
//!
//! The block is six little-endian `u64` words living inside the shared file,
//! mutated by producers under the ring buffer mutex and read lock-free by any
//! number of readers.

use crate::region::{ByteRegion, RegionError};

/// Offset of the control block from the start of the ring buffer section.
pub const CONTROL_OFFSET: u64 = 72;

/// Size of the control block in bytes.
pub const CONTROL_SIZE: usize = 48;

const CONTROL_WORDS: usize = CONTROL_SIZE / 8;

/// How often [`ControlBlock::capture`] re-reads before settling for the last read.
const CAPTURE_ATTEMPTS: usize = 16;

/// Snapshot of one ring buffer's control block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControlBlock {
    /// Byte capacity of the circular body.
    pub capacity: u64,
    /// Completed laps of the write cursor.
    pub wrapped: u64,
    /// Entries overwritten or discarded before being read.
    pub dropped: u64,
    /// Entries ever written.
    pub entries: u64,
    /// Head, relative to the current lap.
    pub next_free: u64,
    /// Tail, relative to its lap.
    pub last_valid: u64,
}

impl ControlBlock {
    /// Build from the six words in wire order.
    pub fn from_words(words: [u64; CONTROL_WORDS]) -> Self {
        let [capacity, wrapped, dropped, entries, next_free, last_valid] = words;
        Self {
            capacity,
            wrapped,
            dropped,
            entries,
            next_free,
            last_valid,
        }
    }

    /// The six words in wire order.
    pub fn to_words(&self) -> [u64; CONTROL_WORDS] {
        [
            self.capacity,
            self.wrapped,
            self.dropped,
            self.entries,
            self.next_free,
            self.last_valid,
        ]
    }

    /// Little-endian wire encoding.
    pub fn to_le_bytes(&self) -> [u8; CONTROL_SIZE] {
        let mut out = [0u8; CONTROL_SIZE];
        for (chunk, word) in out.chunks_exact_mut(8).zip(self.to_words()) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        out
    }

    /// Decode from the little-endian wire encoding.
    pub fn from_le_bytes(bytes: &[u8; CONTROL_SIZE]) -> Self {
        let mut words = [0u64; CONTROL_WORDS];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(8)) {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            *word = u64::from_le_bytes(raw);
        }
        Self::from_words(words)
    }

    /// The head has lapped the tail within the current cycle.
    pub fn is_wrapped(&self) -> bool {
        self.next_free < self.last_valid
    }

    /// Absolute (never wrapping) head position.
    pub fn head(&self) -> u128 {
        u128::from(self.capacity) * u128::from(self.wrapped) + u128::from(self.next_free)
    }

    /// Absolute (never wrapping) tail position.
    pub fn tail(&self) -> u128 {
        if self.wrapped == 0 {
            return u128::from(self.last_valid);
        }
        let laps = self.wrapped - u64::from(self.is_wrapped());
        u128::from(self.capacity) * u128::from(laps) + u128::from(self.last_valid)
    }

    /// Field invariants of a block that was not caught mid-update.
    pub fn is_consistent(&self) -> bool {
        self.capacity > 0
            && self.dropped <= self.entries
            && self.next_free <= self.capacity
            && self.last_valid <= self.capacity
            && self.tail() <= self.head()
    }

    /// Bytes between tail and head.
    pub fn occupied(&self) -> u64 {
        if self.last_valid == self.next_free {
            0
        } else if self.next_free > self.last_valid {
            self.next_free - self.last_valid
        } else {
            (self.capacity - self.last_valid) + self.next_free
        }
    }

    /// Load the block from `region` at absolute offset `offset`.
    ///
    /// The block is wider than any hardware atomic, so the six words are
    /// loaded individually with acquire ordering and the read is repeated
    /// until two consecutive reads agree. If a producer keeps the block moving
    /// the last read is returned; callers validate it anyway.
    pub fn capture(region: &ByteRegion, offset: u64) -> Result<Self, RegionError> {
        let mut previous = region.load_words::<CONTROL_WORDS>(offset)?;
        for _ in 0..CAPTURE_ATTEMPTS {
            let current = region.load_words::<CONTROL_WORDS>(offset)?;
            if current == previous {
                return Ok(Self::from_words(current));
            }
            previous = current;
        }
        tracing::trace!(offset, "control block kept changing, using last read");
        Ok(Self::from_words(previous))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(wrapped: u64, next_free: u64, last_valid: u64) -> ControlBlock {
        ControlBlock {
            capacity: 100,
            wrapped,
            dropped: 0,
            entries: 0,
            next_free,
            last_valid,
        }
    }

    #[test]
    fn test_absolute_positions_before_first_wrap() {
        let c = block(0, 40, 10);
        assert!(!c.is_wrapped());
        assert_eq!(c.head(), 40);
        assert_eq!(c.tail(), 10);
        assert_eq!(c.occupied(), 30);
        assert!(c.is_consistent());
    }

    #[test]
    fn test_absolute_positions_with_head_past_tail() {
        // Third lap, head at 20, tail still in the previous lap at 70.
        let c = block(3, 20, 70);
        assert!(c.is_wrapped());
        assert_eq!(c.head(), 320);
        assert_eq!(c.tail(), 270);
        assert_eq!(c.occupied(), 50);
        assert_eq!(c.head() - c.tail(), u128::from(c.occupied()));
    }

    #[test]
    fn test_absolute_positions_with_tail_in_same_lap() {
        let c = block(2, 90, 30);
        assert_eq!(c.head(), 290);
        assert_eq!(c.tail(), 230);
    }

    #[test]
    fn test_positions_do_not_overflow() {
        let c = ControlBlock {
            capacity: u64::MAX,
            wrapped: u64::MAX,
            next_free: u64::MAX - 1,
            ..ControlBlock::default()
        };
        assert!(c.head() > u128::from(u64::MAX));
    }

    #[test]
    fn test_inconsistent_blocks_are_detected() {
        let mut c = block(0, 10, 0);
        c.dropped = 2;
        c.entries = 1;
        assert!(!c.is_consistent());

        assert!(!block(0, 101, 0).is_consistent());
        assert!(!ControlBlock::default().is_consistent());
    }

    #[test]
    fn test_wire_encoding_order() {
        let c = ControlBlock {
            capacity: 1,
            wrapped: 2,
            dropped: 3,
            entries: 4,
            next_free: 5,
            last_valid: 6,
        };
        let bytes = c.to_le_bytes();
        assert_eq!(bytes[0], 1);
        assert_eq!(bytes[8], 2);
        assert_eq!(bytes[40], 6);
        assert_eq!(ControlBlock::from_le_bytes(&bytes), c);
    }
}
