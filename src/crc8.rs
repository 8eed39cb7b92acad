//! CRC-8 (polynomial 0x07, init 0, no reflection, no final xor).
//!
//! Every checksum in the trace file format uses this one variant: the file
//! header, the extended definition and both checksums of a ring buffer entry.
//! Headers store a CRC byte chosen so that the CRC over the whole header,
//! including that byte, is zero.

use crc::{Crc, Digest, CRC_8_SMBUS};

const CRC8: Crc<u8> = Crc::<u8>::new(&CRC_8_SMBUS);

/// CRC-8 of `bytes`.
pub fn checksum(bytes: &[u8]) -> u8 {
    CRC8.checksum(bytes)
}

/// CRC-8 over several spans as if they were one contiguous buffer.
///
/// Used for payloads that straddle the end of a circular region.
pub fn checksum_spans(spans: &[&[u8]]) -> u8 {
    let mut digest: Digest<'static, u8> = CRC8.digest();
    for span in spans {
        digest.update(span);
    }
    digest.finalize()
}

/// True when the CRC over `bytes` (which end in their own CRC byte) is zero.
pub fn self_check(bytes: &[u8]) -> bool {
    checksum(bytes) == 0
}
