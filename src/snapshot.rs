//! Offline decode of one tracebuffer or a directory of them.

use std::path::{Path, PathBuf};

use regex::Regex;

use crate::error::{TraceError, TraceResult};
use crate::tracebuffer::{is_tracebuffer, SourceType, TraceSource, Tracepoint};

/// Reads in a row that may fail before a buffer is given up on.
pub const MAX_CONSECUTIVE_ERRORS: usize = 8;

/// All tracepoints of one buffer at the time it was opened.
#[derive(Debug, Clone)]
pub struct SnapTracebuffer {
    /// File the snapshot was read from.
    pub path: PathBuf,
    /// Tracebuffer name.
    pub name: String,
    /// Usable ring buffer size.
    pub size: u64,
    /// Where the traces come from.
    pub source_type: SourceType,
    /// Decoded tracepoints, sorted by timestamp.
    pub tracepoints: Vec<Tracepoint>,
}

impl SnapTracebuffer {
    /// Decode everything written to `path` before it was opened, sorted by
    /// timestamp. Entries appended while reading are left out.
    pub fn make(path: &Path, filter: &dyn Fn(&Tracepoint) -> bool) -> TraceResult<Self> {
        let mut source = TraceSource::open(path)?;
        let top = source.current_top_entries_nr();

        let mut tracepoints = Vec::new();
        while let Some(tracepoint) = source.next() {
            if tracepoint.nr >= top && !tracepoint.is_error() {
                break;
            }
            if source.consecutive_read_errors() >= MAX_CONSECUTIVE_ERRORS {
                tracing::warn!(
                    tracebuffer = source.name(),
                    errors = MAX_CONSECUTIVE_ERRORS,
                    "too many read errors, stopping"
                );
                break;
            }
            if filter(&tracepoint) {
                tracepoints.push(tracepoint);
            }
        }
        tracepoints.sort_by_key(|t| t.timestamp_ns);

        tracing::debug!(
            tracebuffer = source.name(),
            count = tracepoints.len(),
            "snapshot decoded"
        );
        Ok(Self {
            path: path.to_path_buf(),
            name: source.name().to_string(),
            size: source.size(),
            source_type: source.source_type(),
            tracepoints,
        })
    }

    /// Decode a single file, or every tracebuffer in a directory.
    ///
    /// Files that cannot be opened are logged and skipped.
    pub fn collect(
        path: &Path,
        buffer_filter: &dyn Fn(&str) -> bool,
        tracepoint_filter: &dyn Fn(&Tracepoint) -> bool,
        recursive: bool,
    ) -> TraceResult<Vec<Self>> {
        let mut snapshots = Vec::new();
        for file in find_tracebuffers(path, recursive)? {
            match Self::make(&file, tracepoint_filter) {
                Ok(snapshot) if buffer_filter(&snapshot.name) => snapshots.push(snapshot),
                Ok(snapshot) => {
                    tracing::debug!(tracebuffer = %snapshot.name, "filtered out");
                }
                Err(err) => {
                    tracing::warn!(path = %file.display(), error = %err, "skipping tracebuffer");
                }
            }
        }
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(snapshots)
    }
}

/// All tracepoints of `snapshots` in one timestamp-ordered list.
pub fn merge(snapshots: Vec<SnapTracebuffer>) -> Vec<Tracepoint> {
    let mut all: Vec<Tracepoint> = snapshots
        .into_iter()
        .flat_map(|snapshot| snapshot.tracepoints)
        .collect();
    all.sort_by_key(|t| t.timestamp_ns);
    all
}

/// Compile a tracebuffer name filter. The pattern must match the whole name.
pub fn name_filter(pattern: &str) -> TraceResult<Regex> {
    Regex::new(&format!("^(?:{pattern})$")).map_err(|e| {
        TraceError::Configuration(format!("Invalid tracebuffer filter '{pattern}': {e}"))
    })
}

/// Tracebuffer files at `path`: the path itself if it is a file, otherwise
/// the directory entries (descending when `recursive`).
pub fn find_tracebuffers(path: &Path, recursive: bool) -> TraceResult<Vec<PathBuf>> {
    if !path.is_dir() {
        return Ok(if is_tracebuffer(path) {
            vec![path.to_path_buf()]
        } else {
            Vec::new()
        });
    }

    let mut found = Vec::new();
    let mut pending = vec![path.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let entry_path = entry.path();
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                if recursive {
                    pending.push(entry_path);
                }
            } else if file_type.is_file() && is_tracebuffer(&entry_path) {
                found.push(entry_path);
            }
        }
    }
    found.sort();
    Ok(found)
}
