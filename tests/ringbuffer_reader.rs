//! Reader guarantees against a real writer on a real file.

use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use std::thread;

use rand::{Rng, SeedableRng};
use tempfile::tempdir;
use tracebuf::ringbuffer::codec::{self, HEADER_SIZE, MARKER, TRAILER_SIZE};
use tracebuf::ringbuffer::control::CONTROL_OFFSET;
use tracebuf::ringbuffer::{RingBufferReader, BODY_OFFSET};
use tracebuf::tracebuffer::{SourceType, TracebufferFile};
use tracebuf::ReaderError;

fn create(path: &Path, capacity: u64) -> TracebufferFile {
    TracebufferFile::create(path, "reader_test", capacity, SourceType::Userspace).unwrap()
}

fn drain(reader: &mut RingBufferReader) -> Vec<(u64, Vec<u8>)> {
    let mut out = Vec::new();
    while let Some(entry) = reader.next_entry().unwrap() {
        out.push((entry.sequence_number, entry.body().to_vec()));
    }
    out
}

fn indexed_payload(index: u32, len: usize) -> Vec<u8> {
    let mut payload = index.to_le_bytes().to_vec();
    payload.resize(len.max(4), b'a' + (index % 20) as u8);
    payload
}

#[test]
fn test_sequence_numbers_increase_by_one() {
    let dir = tempdir().unwrap();
    let file = create(&dir.path().join("seq.clltk_trace"), 64 * 1024);
    let writer = file.writer().unwrap();
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);

    let mut written = Vec::new();
    for _ in 0..200 {
        let len = rng.gen_range(1..200);
        let payload: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
        writer.append(&payload).unwrap();
        written.push(payload);
    }

    let mut reader = file.reader().unwrap();
    let read = drain(&mut reader);
    assert_eq!(read.len(), written.len());
    for (i, ((seq, body), payload)) in read.iter().zip(&written).enumerate() {
        assert_eq!(*seq, i as u64);
        assert_eq!(body, payload);
    }
    assert!(reader.next_entry().unwrap().is_none());
}

#[test]
fn test_interleaved_reads_never_repeat() {
    let dir = tempdir().unwrap();
    let file = create(&dir.path().join("interleaved.clltk_trace"), 4096);
    let writer = file.writer().unwrap();
    let mut reader = file.reader().unwrap();

    let mut expected = 0u64;
    for round in 0..50u32 {
        for i in 0..(round % 4) {
            writer.append(&indexed_payload(round * 10 + i, 16)).unwrap();
        }
        for (seq, body) in drain(&mut reader) {
            assert_eq!(seq, expected);
            expected += 1;
            assert_eq!(body.len(), 16);
        }
    }
}

#[test]
fn test_reader_catches_up_to_oldest_valid_entry() {
    let dir = tempdir().unwrap();
    let file = create(&dir.path().join("catchup.clltk_trace"), 256);
    let writer = file.writer().unwrap();
    let mut reader = file.reader().unwrap();

    let payloads: Vec<Vec<u8>> = (0..40).map(|i| indexed_payload(i, 20)).collect();
    for payload in &payloads {
        writer.append(payload).unwrap();
    }

    let control = reader.capture().unwrap();
    assert!(control.dropped > 0, "writer should have overwritten entries");
    let oldest = control.dropped;

    let first = reader.next_entry().unwrap().unwrap();
    assert_eq!(first.sequence_number, oldest);
    assert_eq!(first.body(), payloads[oldest as usize].as_slice());

    let rest = drain(&mut reader);
    let mut expected = oldest + 1;
    for (seq, body) in rest {
        assert_eq!(seq, expected);
        assert_eq!(body, payloads[seq as usize]);
        expected += 1;
    }
    assert_eq!(expected, control.entries);
}

#[test]
fn test_straddling_entries_read_back_intact() {
    let dir = tempdir().unwrap();
    let file = create(&dir.path().join("wrap.clltk_trace"), 64);
    let writer = file.writer().unwrap();
    let mut reader = file.reader().unwrap();

    for i in 0..60u32 {
        let payload = indexed_payload(i, 7 + (i as usize % 7));
        writer.append(&payload).unwrap();
        let entry = reader.next_entry().unwrap().unwrap();
        assert_eq!(entry.sequence_number, u64::from(i));
        assert_eq!(entry.body(), payload.as_slice());
    }
    assert!(writer.control_block().wrapped > 0);
}

#[test]
fn test_single_bit_flips_are_rejected() {
    let dir = tempdir().unwrap();

    // Payload bytes and checksum must not look like an entry start, so that
    // the skipped entry cannot be mistaken for another one.
    let mut fill = b'a';
    while codec::payload_crc(&[fill; 8]) == MARKER {
        fill += 1;
    }
    let payloads = [[fill; 8], [fill + 1; 8], [fill; 8]];
    assert!(payloads.iter().all(|p| codec::payload_crc(p) != MARKER));

    let entry_len = (HEADER_SIZE + 8 + TRAILER_SIZE) as u64;
    for bit in 0..entry_len * 8 {
        let path = dir.path().join(format!("flip_{bit}.clltk_trace"));
        let file = create(&path, 1024);
        let writer = file.writer().unwrap();
        for payload in &payloads {
            writer.append(payload).unwrap();
        }

        let second_entry = file.header().ringbuffer_offset + BODY_OFFSET + entry_len;
        let at = second_entry + bit / 8;
        let raw = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        let mut byte = [0u8; 1];
        raw.read_at(&mut byte, at).unwrap();
        byte[0] ^= 1 << (bit % 8);
        raw.write_at(&byte, at).unwrap();

        let mut reader = file.reader().unwrap();
        let bodies: Vec<Vec<u8>> = drain(&mut reader).into_iter().map(|(_, b)| b).collect();
        assert_eq!(
            bodies,
            vec![payloads[0].to_vec(), payloads[2].to_vec()],
            "bit {bit} of the second entry"
        );
    }
}

#[test]
fn test_concurrent_writer_and_reader() {
    let dir = tempdir().unwrap();
    let file = create(&dir.path().join("concurrent.clltk_trace"), 2048);
    let writer = Arc::new(file.writer().unwrap());
    let mut reader = file.reader().unwrap();

    const TOTAL: u32 = 20_000;
    let producer = {
        let writer = Arc::clone(&writer);
        thread::spawn(move || {
            for i in 0..TOTAL {
                writer.append(&indexed_payload(i, 24)).unwrap();
            }
        })
    };

    let mut last_seq = None;
    let mut last_index = None;
    let mut received = 0u64;
    loop {
        let finished = producer.is_finished();
        match reader.next_entry() {
            Ok(Some(entry)) => {
                let body = entry.body();
                let index = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
                assert!(last_seq.map_or(true, |s| entry.sequence_number > s));
                assert!(last_index.map_or(true, |l| index > l));
                last_seq = Some(entry.sequence_number);
                last_index = Some(index);
                received += 1;
            }
            Ok(None) if finished => break,
            Ok(None) => thread::yield_now(),
            Err(err) => assert!(matches!(err, ReaderError::RetriesExhausted { .. })),
        }
    }
    producer.join().unwrap();

    assert!(received > 0);
    assert_eq!(last_index, Some(TOTAL - 1));
}

#[test]
fn test_retry_ceiling_then_recovery() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ceiling.clltk_trace");
    let file = create(&path, 1024);
    let writer = file.writer().unwrap();
    let mut reader = file.reader().unwrap();

    for i in 0..3 {
        writer.append(&indexed_payload(i, 12)).unwrap();
    }
    assert_eq!(drain(&mut reader).len(), 3);

    // A producer that died after publishing a wrapped head but before
    // counting the lap leaves the head behind every reader.
    let next_free_at = file.header().ringbuffer_offset + CONTROL_OFFSET + 4 * 8;
    let raw = OpenOptions::new().write(true).open(&path).unwrap();
    raw.write_at(&0u64.to_le_bytes(), next_free_at).unwrap();

    for _ in 0..2 {
        match reader.next_entry() {
            Err(ReaderError::RetriesExhausted { attempts }) => assert_eq!(attempts, 10_240),
            other => panic!("expected the retry ceiling, got {other:?}"),
        }
    }

    // The next producer overwrites from the rewound head; once it passes the
    // cursor the reader picks up where it stopped.
    for i in 3..6 {
        writer.append(&indexed_payload(i, 12)).unwrap();
    }
    assert!(reader.next_entry().unwrap().is_none());
    for i in 6..8 {
        writer.append(&indexed_payload(i, 12)).unwrap();
    }
    let resumed = drain(&mut reader);
    assert_eq!(
        resumed,
        vec![(3, indexed_payload(6, 12)), (4, indexed_payload(7, 12))]
    );
}
