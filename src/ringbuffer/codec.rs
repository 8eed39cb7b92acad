//! Entry framing inside the ring buffer body.
//!
//! ```text
//! +-----+-------------+-----+---------------------+-----+
//! | '~' | length u16  | crc |  payload (length)   | crc |
//! +-----+-------------+-----+---------------------+-----+
//!   header (4 bytes)                              trailer
//! ```
//!
//! The header CRC byte is chosen so that CRC-8 over all four header bytes is
//! zero. The trailer is CRC-8 of the payload alone. Both may straddle the end
//! of the circular body.

use crate::crc8;

/// First byte of every entry.
pub const MARKER: u8 = b'~';

/// Marker, length and header CRC.
pub const HEADER_SIZE: usize = 4;

/// Trailing payload CRC.
pub const TRAILER_SIZE: usize = 1;

/// Framing bytes added to every payload.
pub const ENTRY_OVERHEAD: usize = HEADER_SIZE + TRAILER_SIZE;

/// Largest payload whose framed size stays below `u16::MAX`.
///
/// Readers reject anything larger as structurally implausible, so writers
/// must never produce it.
pub const MAX_PAYLOAD: usize = u16::MAX as usize - ENTRY_OVERHEAD - 1;

/// Encode the four header bytes for a payload of `len` bytes.
pub fn encode_header(len: u16) -> [u8; HEADER_SIZE] {
    let [lo, hi] = len.to_le_bytes();
    let mut header = [MARKER, lo, hi, 0];
    header[3] = crc8::checksum(&header[..3]);
    header
}

/// Marker present and header CRC zero.
pub fn header_valid(header: &[u8; HEADER_SIZE]) -> bool {
    header[0] == MARKER && crc8::self_check(header)
}

/// Payload length announced by a header.
pub fn header_length(header: &[u8; HEADER_SIZE]) -> u16 {
    u16::from_le_bytes([header[1], header[2]])
}

/// Total framed size of an entry carrying `len` payload bytes.
pub fn entry_size(len: usize) -> usize {
    len + ENTRY_OVERHEAD
}

/// Trailer value for `payload`.
pub fn payload_crc(payload: &[u8]) -> u8 {
    crc8::checksum(payload)
}

/// Frame `payload` into header, payload and trailer.
///
/// Returns `None` for empty payloads and payloads above [`MAX_PAYLOAD`].
pub fn encode_entry(payload: &[u8]) -> Option<Vec<u8>> {
    if payload.is_empty() || payload.len() > MAX_PAYLOAD {
        return None;
    }
    let len = u16::try_from(payload.len()).ok()?;
    let mut out = Vec::with_capacity(entry_size(payload.len()));
    out.extend_from_slice(&encode_header(len));
    out.extend_from_slice(payload);
    out.push(payload_crc(payload));
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_crc_covers_itself() {
        for len in [1u16, 7, 255, 256, 4096, MAX_PAYLOAD as u16] {
            let header = encode_header(len);
            assert!(header_valid(&header), "len {len}");
            assert_eq!(header_length(&header), len);
        }
    }

    #[test]
    fn test_every_single_bit_flip_breaks_the_header() {
        let header = encode_header(0x1234);
        for bit in 0..(HEADER_SIZE * 8) {
            let mut damaged = header;
            damaged[bit / 8] ^= 1 << (bit % 8);
            assert!(!header_valid(&damaged), "bit {bit} went unnoticed");
        }
    }

    #[test]
    fn test_encode_entry_layout() {
        let entry = encode_entry(b"hello").unwrap();
        assert_eq!(entry.len(), entry_size(5));
        assert_eq!(entry[0], MARKER);
        assert_eq!(&entry[4..9], b"hello");
        assert_eq!(entry[9], payload_crc(b"hello"));
        // payload followed by its CRC checks to zero
        assert!(crc8::self_check(&entry[4..]));
    }

    #[test]
    fn test_encode_entry_limits() {
        assert!(encode_entry(&[]).is_none());
        assert!(encode_entry(&vec![0u8; MAX_PAYLOAD]).is_some());
        assert!(encode_entry(&vec![0u8; MAX_PAYLOAD + 1]).is_none());
        assert!(entry_size(MAX_PAYLOAD) < u16::MAX as usize);
    }
}
