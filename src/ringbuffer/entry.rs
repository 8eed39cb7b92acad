use smallvec::SmallVec;

/// Payloads up to this size are stored inline.
pub const INLINE_PAYLOAD: usize = 256;

/// Payload storage; spills to the heap above [`INLINE_PAYLOAD`] bytes.
pub type EntryBody = SmallVec<[u8; INLINE_PAYLOAD]>;

/// One record extracted from a ring buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Assigned by the reader, not stored on the wire.
    pub sequence_number: u64,
    /// Raw payload bytes.
    pub body: EntryBody,
    /// Payload CRC matched at extraction time.
    pub valid: bool,
}

impl Entry {
    /// Payload as a slice.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Payload length.
    pub fn len(&self) -> usize {
        self.body.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}
