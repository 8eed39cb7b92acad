//! Tracepoints out of one tracebuffer file.

use std::path::Path;
use std::sync::Arc;

use crate::error::TraceResult;
use crate::ringbuffer::RingBufferReader;
use crate::tracebuffer::definition::SourceType;
use crate::tracebuffer::file::TracebufferFile;
use crate::tracebuffer::meta::{FileMetaLookup, MetaLookup};
use crate::tracebuffer::tracepoint::Tracepoint;

/// Pairs a ring buffer reader with a metadata lookup to decode tracepoints.
pub struct TraceSource {
    file: TracebufferFile,
    reader: RingBufferReader,
    lookup: Box<dyn MetaLookup>,
    name: Arc<str>,
    consecutive_read_errors: usize,
}

impl std::fmt::Debug for TraceSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceSource")
            .field("name", &self.name)
            .field("path", &self.file.path())
            .field("cursor", &self.reader.cursor())
            .finish()
    }
}

impl TraceSource {
    /// Open and validate `path`, resolving static metadata from the file itself.
    pub fn open(path: &Path) -> TraceResult<Self> {
        let file = TracebufferFile::open(path)?;
        let lookup = Box::new(FileMetaLookup::new(file.region().clone()));
        Self::with_lookup(file, lookup)
    }

    /// Use a custom metadata lookup.
    pub fn with_lookup(file: TracebufferFile, lookup: Box<dyn MetaLookup>) -> TraceResult<Self> {
        let reader = file.reader()?;
        let name: Arc<str> = Arc::from(file.name());
        Ok(Self {
            file,
            reader,
            lookup,
            name,
            consecutive_read_errors: 0,
        })
    }

    /// Next tracepoint, `None` when nothing is pending.
    ///
    /// A failed read yields one error tracepoint; the following call keeps
    /// reading from where the reader stopped.
    pub fn next(&mut self) -> Option<Tracepoint> {
        match self.reader.next_entry() {
            Ok(Some(entry)) => {
                self.consecutive_read_errors = 0;
                Some(Tracepoint::decode(
                    &self.name,
                    self.source_type(),
                    entry.sequence_number,
                    entry.body(),
                    self.lookup.as_mut(),
                ))
            }
            Ok(None) => {
                self.consecutive_read_errors = 0;
                None
            }
            Err(err) => {
                self.consecutive_read_errors += 1;
                tracing::debug!(tracebuffer = %self.name, error = %err, "ring buffer read failed");
                Some(Tracepoint::error(
                    &self.name,
                    self.source_type(),
                    self.reader.cursor().next_sequence_number,
                    0,
                    err.to_string(),
                ))
            }
        }
    }

    /// Next tracepoint accepted by `filter`.
    pub fn next_filtered(&mut self, filter: &dyn Fn(&Tracepoint) -> bool) -> Option<Tracepoint> {
        loop {
            let tracepoint = self.next()?;
            if filter(&tracepoint) {
                return Some(tracepoint);
            }
        }
    }

    /// Unread bytes; 0 if the control block could not be read.
    pub fn pending(&self) -> u64 {
        self.reader.pending_bytes().unwrap_or(0)
    }

    /// Number of entries written so far.
    pub fn current_top_entries_nr(&self) -> u64 {
        self.reader.entry_count().unwrap_or(0)
    }

    /// Only return tracepoints written from now on.
    pub fn skip_to_end(&mut self) -> TraceResult<()> {
        self.reader.skip_to_end()?;
        Ok(())
    }

    /// Reads that failed in a row, reset by any successful read.
    pub fn consecutive_read_errors(&self) -> usize {
        self.consecutive_read_errors
    }

    /// Tracebuffer name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Shared handle to the buffer name.
    pub fn name_arc(&self) -> Arc<str> {
        Arc::clone(&self.name)
    }

    /// Usable ring buffer bytes.
    pub fn size(&self) -> u64 {
        self.reader.size()
    }

    /// Path of the file.
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Origin of the traces.
    pub fn source_type(&self) -> SourceType {
        self.file.source_type()
    }

    /// The underlying file.
    pub fn file(&self) -> &TracebufferFile {
        &self.file
    }

    /// The underlying reader.
    pub fn reader(&self) -> &RingBufferReader {
        &self.reader
    }
}
