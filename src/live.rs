//! Live tailing of tracebuffers.
//!
//! One reader thread per tracebuffer polls its ring buffer and pushes
//! decoded tracepoints into a shared [`OrderedBuffer`]; a single consumer
//! thread drains the buffer in timestamp order and hands each tracepoint to
//! a [`TracepointSink`].
//!
//! Readers advance the watermark to the newest timestamp seen so far. Once
//! every reader has come up empty, nothing older can still be in flight and
//! the watermark is raised by the order delay so all buffered entries drain.
//!
//! A buffer that keeps failing to read (for example after a producer died
//! between publishing its head and its lap counter) yields one error
//! tracepoint, then its reader backs off and polls quietly until reads
//! succeed again.

use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::LiveSection;
use crate::error::{TraceError, TraceResult};
use crate::filter::TracepointFilter;
use crate::ordered_buffer::{OrderedBuffer, OrderedBufferStats};
use crate::snapshot::{find_tracebuffers, name_filter, MAX_CONSECUTIVE_ERRORS};
use crate::tracebuffer::{RawFormatter, TraceSource, Tracepoint};

const CONSUMER_WAIT: Duration = Duration::from_millis(10);

/// Settings of one live session.
#[derive(Debug, Clone)]
pub struct LiveConfig {
    /// Tracebuffer file or directory of tracebuffers
    pub path: PathBuf,
    /// Regex the whole buffer name must match
    pub tracebuffer_filter: String,
    /// Reorder buffer capacity (0 = unbounded)
    pub buffer_size: usize,
    /// How long entries are held back for reordering.
    pub order_delay: Duration,
    /// Sleep between polls of an idle buffer.
    pub poll_interval: Duration,
    /// Start at the current end of each buffer instead of its oldest entry
    pub skip_existing: bool,
    /// Descend into subdirectories of `path`
    pub recursive: bool,
    /// Tracepoints not matching are read but not output
    pub tracepoint_filter: TracepointFilter,
}

impl LiveConfig {
    /// Defaults from [`LiveSection::default`] for `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::from_section(path, &LiveSection::default())
    }

    /// Settings from the `[live]` configuration table.
    pub fn from_section(path: impl Into<PathBuf>, section: &LiveSection) -> Self {
        Self {
            path: path.into(),
            tracebuffer_filter: section.tracebuffer_filter.clone(),
            buffer_size: section.buffer_size,
            order_delay: section.order_delay(),
            poll_interval: section.poll_interval(),
            skip_existing: false,
            recursive: false,
            tracepoint_filter: TracepointFilter::default(),
        }
    }

    fn order_delay_ns(&self) -> u64 {
        u64::try_from(self.order_delay.as_nanos()).unwrap_or(u64::MAX)
    }
}

/// Receives tracepoints in timestamp order on the consumer thread.
pub trait TracepointSink: Send + 'static {
    /// Handle one tracepoint.
    fn consume(&mut self, tracepoint: Tracepoint);

    /// Called after each drained batch.
    fn flush(&mut self) {}
}

impl<F> TracepointSink for F
where
    F: FnMut(Tracepoint) + Send + 'static,
{
    fn consume(&mut self, tracepoint: Tracepoint) {
        self(tracepoint)
    }
}

/// Sink rendering one raw line per tracepoint into a writer.
pub struct WriteSink<W> {
    out: W,
}

impl<W: Write + Send + 'static> WriteSink<W> {
    /// Wrap `out`.
    pub fn new(out: W) -> Self {
        Self { out }
    }
}

impl<W: Write + Send + 'static> TracepointSink for WriteSink<W> {
    fn consume(&mut self, tracepoint: Tracepoint) {
        if let Err(err) = writeln!(self.out, "{}", tracepoint.render(&RawFormatter)) {
            tracing::error!(error = %err, "failed to write tracepoint");
        }
    }

    fn flush(&mut self) {
        if let Err(err) = self.out.flush() {
            tracing::error!(error = %err, "failed to flush output");
        }
    }
}

/// Counters of a live session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiveStats {
    /// Buffers being tailed.
    pub tracebuffers: usize,
    /// Tracepoints read from the buffers.
    pub total_read: u64,
    /// Tracepoints handed to the sink.
    pub total_output: u64,
    /// Reorder buffer counters.
    pub buffer: OrderedBufferStats,
}

struct Shared {
    buffer: OrderedBuffer,
    stop: AtomicBool,
    max_seen_ns: AtomicU64,
    idle: Vec<AtomicBool>,
    total_read: AtomicU64,
    total_output: AtomicU64,
    order_delay_ns: u64,
    poll_interval: Duration,
    filter: TracepointFilter,
}

impl Shared {
    fn all_idle(&self) -> bool {
        self.idle.iter().all(|idle| idle.load(Ordering::Acquire))
    }
}

/// Tails tracebuffers until stopped.
pub struct LiveDecoder<S: TracepointSink> {
    config: LiveConfig,
    sink: Option<S>,
    shared: Option<Arc<Shared>>,
    readers: Vec<JoinHandle<()>>,
    consumer: Option<JoinHandle<S>>,
    tracebuffers: usize,
}

impl<S: TracepointSink> std::fmt::Debug for LiveDecoder<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveDecoder")
            .field("config", &self.config)
            .field("running", &self.running())
            .field("tracebuffers", &self.tracebuffers)
            .finish()
    }
}

impl<S: TracepointSink> LiveDecoder<S> {
    /// A stopped decoder that will feed `sink`.
    pub fn new(config: LiveConfig, sink: S) -> Self {
        Self {
            config,
            sink: Some(sink),
            shared: None,
            readers: Vec::new(),
            consumer: None,
            tracebuffers: 0,
        }
    }

    /// Open the matching tracebuffers and spawn the threads.
    ///
    /// Returns the number of tracebuffers being tailed. Fails if already
    /// running, if the path is neither a tracebuffer nor a directory, or if
    /// no buffer matches the filter.
    pub fn start(&mut self) -> TraceResult<usize> {
        if self.shared.is_some() {
            return Err(TraceError::Live("live decoder already running".into()));
        }
        let sink = self
            .sink
            .take()
            .ok_or_else(|| TraceError::Live("sink is no longer available".into()))?;

        let sources = match self.open_sources() {
            Ok(sources) => sources,
            Err(err) => {
                self.sink = Some(sink);
                return Err(err);
            }
        };

        let shared = Arc::new(Shared {
            buffer: OrderedBuffer::new(self.config.buffer_size, self.config.order_delay_ns()),
            stop: AtomicBool::new(false),
            max_seen_ns: AtomicU64::new(0),
            idle: (0..sources.len()).map(|_| AtomicBool::new(false)).collect(),
            total_read: AtomicU64::new(0),
            total_output: AtomicU64::new(0),
            order_delay_ns: self.config.order_delay_ns(),
            poll_interval: self.config.poll_interval,
            filter: self.config.tracepoint_filter.clone(),
        });
        self.tracebuffers = sources.len();
        self.shared = Some(Arc::clone(&shared));

        let consumer_shared = Arc::clone(&shared);
        self.consumer = Some(
            thread::Builder::new()
                .name("live-consumer".to_string())
                .spawn(move || consumer_loop(&consumer_shared, sink))?,
        );

        for (index, source) in sources.into_iter().enumerate() {
            let reader_shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("live-{}", source.name()))
                .spawn(move || reader_loop(&reader_shared, index, source))?;
            self.readers.push(handle);
        }

        tracing::info!(
            tracebuffers = self.tracebuffers,
            path = %self.config.path.display(),
            "live decoding started"
        );
        Ok(self.tracebuffers)
    }

    /// Stop the readers, flush everything buffered and wait for the consumer.
    ///
    /// Returns the final counters; a no-op returning zeroes if not running.
    pub fn stop(&mut self) -> LiveStats {
        let Some(shared) = self.shared.take() else {
            return LiveStats::default();
        };

        shared.stop.store(true, Ordering::Release);
        for reader in self.readers.drain(..) {
            if reader.join().is_err() {
                tracing::error!("live reader thread panicked");
            }
        }
        shared.buffer.finish();
        if let Some(consumer) = self.consumer.take() {
            match consumer.join() {
                Ok(sink) => self.sink = Some(sink),
                Err(_) => tracing::error!("live consumer thread panicked"),
            }
        }

        let stats = LiveStats {
            tracebuffers: self.tracebuffers,
            total_read: shared.total_read.load(Ordering::Relaxed),
            total_output: shared.total_output.load(Ordering::Relaxed),
            buffer: shared.buffer.stats(),
        };
        tracing::info!(
            read = stats.total_read,
            output = stats.total_output,
            dropped = stats.buffer.total_dropped,
            "live decoding stopped"
        );
        stats
    }

    /// Threads are running.
    pub fn running(&self) -> bool {
        self.shared.is_some()
    }

    /// Counters so far.
    pub fn stats(&self) -> LiveStats {
        match &self.shared {
            Some(shared) => LiveStats {
                tracebuffers: self.tracebuffers,
                total_read: shared.total_read.load(Ordering::Relaxed),
                total_output: shared.total_output.load(Ordering::Relaxed),
                buffer: shared.buffer.stats(),
            },
            None => LiveStats::default(),
        }
    }

    /// The sink, once the session has stopped.
    pub fn take_sink(&mut self) -> Option<S> {
        if self.running() {
            return None;
        }
        self.sink.take()
    }

    fn open_sources(&self) -> TraceResult<Vec<TraceSource>> {
        let path = &self.config.path;
        if !path.exists() {
            return Err(TraceError::Live(format!(
                "Invalid input path: {}",
                path.display()
            )));
        }
        let filter = name_filter(&self.config.tracebuffer_filter)?;

        let mut sources = Vec::new();
        for file in find_tracebuffers(path, self.config.recursive)? {
            let mut source = match TraceSource::open(&file) {
                Ok(source) => source,
                Err(err) => {
                    tracing::warn!(path = %file.display(), error = %err, "skipping tracebuffer");
                    continue;
                }
            };
            if !filter.is_match(source.name()) {
                continue;
            }
            if self.config.skip_existing {
                source.skip_to_end()?;
            }
            sources.push(source);
        }

        if sources.is_empty() {
            return Err(TraceError::Live(
                "No tracebuffers found matching filter".into(),
            ));
        }
        Ok(sources)
    }
}

impl<S: TracepointSink> Drop for LiveDecoder<S> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn reader_loop(shared: &Shared, index: usize, mut source: TraceSource) {
    tracing::debug!(tracebuffer = source.name(), "reader started");
    while !shared.stop.load(Ordering::Acquire) {
        let mut read_any = false;
        let mut stalled = false;
        let mut newest = 0u64;
        while let Some(tracepoint) = source.next() {
            // Only the first failure of a run is reported.
            let errors = source.consecutive_read_errors();
            if errors >= MAX_CONSECUTIVE_ERRORS {
                if errors == MAX_CONSECUTIVE_ERRORS {
                    tracing::warn!(
                        tracebuffer = source.name(),
                        errors,
                        "ring buffer keeps failing to read, backing off"
                    );
                }
                stalled = true;
                break;
            }
            if errors > 1 {
                continue;
            }

            read_any = true;
            newest = newest.max(tracepoint.timestamp_ns);
            if shared.filter.matches(&tracepoint) && shared.buffer.push(tracepoint) {
                shared.total_read.fetch_add(1, Ordering::Relaxed);
            }
            if shared.stop.load(Ordering::Acquire) {
                break;
            }
        }

        shared.max_seen_ns.fetch_max(newest, Ordering::AcqRel);
        shared.idle[index].store(!read_any, Ordering::Release);
        let max_seen = shared.max_seen_ns.load(Ordering::Acquire);

        if read_any {
            shared.buffer.update_watermark(max_seen);
        } else if max_seen > 0 && shared.all_idle() {
            shared
                .buffer
                .update_watermark(max_seen.saturating_add(shared.order_delay_ns));
        }
        if !read_any || stalled {
            thread::sleep(shared.poll_interval);
        }
    }
    tracing::debug!(tracebuffer = source.name(), "reader stopped");
}

fn consumer_loop<S: TracepointSink>(shared: &Shared, mut sink: S) -> S {
    while !shared.buffer.finished() {
        let Some(first) = shared.buffer.pop(CONSUMER_WAIT) else {
            continue;
        };
        let rest = shared.buffer.pop_all_ready();
        let count = 1 + rest.len() as u64;
        sink.consume(first);
        for tracepoint in rest {
            sink.consume(tracepoint);
        }
        sink.flush();
        shared.total_output.fetch_add(count, Ordering::Relaxed);
    }
    sink
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracebuffer::tracepoint::encode_dynamic_body;
    use crate::tracebuffer::{SourceType, TracebufferFile};
    use crate::ringbuffer::control::CONTROL_OFFSET;
    use parking_lot::Mutex;
    use std::os::unix::fs::FileExt;
    use std::time::Instant;
    use tempfile::tempdir;
    use tracing_test::traced_test;

    fn fast_config(path: &std::path::Path) -> LiveConfig {
        LiveConfig {
            order_delay: Duration::from_millis(5),
            poll_interval: Duration::from_millis(1),
            ..LiveConfig::new(path)
        }
    }

    fn wait_for(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !done() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_start_fails_without_buffers() {
        let dir = tempdir().unwrap();
        let mut decoder = LiveDecoder::new(fast_config(dir.path()), |_tp: Tracepoint| {});
        assert!(matches!(decoder.start(), Err(TraceError::Live(_))));
        assert!(!decoder.running());

        let mut missing =
            LiveDecoder::new(fast_config(&dir.path().join("nope")), |_tp: Tracepoint| {});
        assert!(missing.start().is_err());
    }

    #[test]
    fn test_merges_buffers_in_order() {
        let dir = tempdir().unwrap();
        let a = TracebufferFile::create(
            &dir.path().join("a.clltk_trace"),
            "a",
            4096,
            SourceType::Userspace,
        )
        .unwrap();
        let b = TracebufferFile::create(
            &dir.path().join("b.clltk_trace"),
            "b",
            4096,
            SourceType::Userspace,
        )
        .unwrap();
        let (wa, wb) = (a.writer().unwrap(), b.writer().unwrap());
        for ts in [10u64, 30, 50] {
            wa.append(&encode_dynamic_body(1, 1, ts, "a.c", 1, "a")).unwrap();
        }
        for ts in [20u64, 40, 60] {
            wb.append(&encode_dynamic_body(2, 2, ts, "b.c", 1, "b")).unwrap();
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let seen = Arc::clone(&seen);
            move |tp: Tracepoint| seen.lock().push(tp.timestamp_ns)
        };
        let mut decoder = LiveDecoder::new(fast_config(dir.path()), sink);
        assert_eq!(decoder.start().unwrap(), 2);
        wait_for(|| seen.lock().len() == 6);
        let stats = decoder.stop();

        assert_eq!(*seen.lock(), vec![10, 20, 30, 40, 50, 60]);
        assert_eq!(stats.total_read, 6);
        assert_eq!(stats.total_output, 6);
        assert!(decoder.take_sink().is_some());
    }

    #[test]
    fn test_skip_existing_and_filter() {
        let dir = tempdir().unwrap();
        let file = TracebufferFile::create(
            &dir.path().join("keep.clltk_trace"),
            "keep",
            4096,
            SourceType::Userspace,
        )
        .unwrap();
        TracebufferFile::create(
            &dir.path().join("other.clltk_trace"),
            "other",
            4096,
            SourceType::Userspace,
        )
        .unwrap();
        let writer = file.writer().unwrap();
        writer.append(&encode_dynamic_body(1, 1, 5, "k.c", 1, "old")).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let seen = Arc::clone(&seen);
            move |tp: Tracepoint| seen.lock().push(tp.timestamp_ns)
        };
        let mut config = fast_config(dir.path());
        config.tracebuffer_filter = "ke.*".into();
        config.skip_existing = true;
        let mut decoder = LiveDecoder::new(config, sink);
        assert_eq!(decoder.start().unwrap(), 1);

        writer.append(&encode_dynamic_body(1, 1, 7, "k.c", 2, "new")).unwrap();
        wait_for(|| !seen.lock().is_empty());
        decoder.stop();
        assert_eq!(*seen.lock(), vec![7]);
    }

    #[test]
    fn test_head_behind_cursor_reports_once_and_recovers() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stuck.clltk_trace");
        let file = TracebufferFile::create(&path, "stuck", 1024, SourceType::Userspace).unwrap();
        let writer = file.writer().unwrap();
        for ts in [10u64, 20, 30] {
            writer.append(&encode_dynamic_body(1, 1, ts, "s.c", 1, "m")).unwrap();
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let seen = Arc::clone(&seen);
            move |tp: Tracepoint| seen.lock().push((tp.is_error(), tp.timestamp_ns))
        };
        let mut decoder = LiveDecoder::new(fast_config(dir.path()), sink);
        decoder.start().unwrap();
        wait_for(|| seen.lock().len() == 3);

        // Head rewound to the start of the lap without a wrap: every read
        // now finds the cursor past the head.
        let next_free_at = file.header().ringbuffer_offset + CONTROL_OFFSET + 4 * 8;
        let raw = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        raw.write_at(&0u64.to_le_bytes(), next_free_at).unwrap();

        wait_for(|| seen.lock().iter().any(|(error, _)| *error));
        thread::sleep(Duration::from_millis(100));

        // Same-sized entries: the third lands exactly where the cursor waits.
        for ts in [100u64, 110, 120, 130, 140] {
            writer.append(&encode_dynamic_body(1, 1, ts, "s.c", 1, "m")).unwrap();
        }
        wait_for(|| seen.lock().iter().filter(|(error, _)| !*error).count() == 5);
        decoder.stop();

        let seen = seen.lock();
        assert_eq!(seen.iter().filter(|(error, _)| *error).count(), 1);
        let good: Vec<u64> = seen.iter().filter(|(e, _)| !*e).map(|(_, ts)| *ts).collect();
        assert_eq!(good, vec![10, 20, 30, 130, 140]);
    }

    #[test]
    fn test_recursive_discovery_and_tracepoint_filter() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("nested");
        std::fs::create_dir(&nested).unwrap();
        let file = TracebufferFile::create(
            &nested.join("deep.clltk_trace"),
            "deep",
            4096,
            SourceType::Userspace,
        )
        .unwrap();
        let writer = file.writer().unwrap();
        for (pid, ts) in [(1u32, 10u64), (2, 20), (1, 30)] {
            writer
                .append(&encode_dynamic_body(pid, pid, ts, "d.c", 1, "deep"))
                .unwrap();
        }

        let mut flat = LiveDecoder::new(fast_config(dir.path()), |_tp: Tracepoint| {});
        assert!(matches!(flat.start(), Err(TraceError::Live(_))));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let seen = Arc::clone(&seen);
            move |tp: Tracepoint| seen.lock().push(tp.timestamp_ns)
        };
        let mut config = fast_config(dir.path());
        config.recursive = true;
        config.tracepoint_filter = TracepointFilter::new().with_pids([1]);
        let mut decoder = LiveDecoder::new(config, sink);
        assert_eq!(decoder.start().unwrap(), 1);
        wait_for(|| seen.lock().len() == 2);
        thread::sleep(Duration::from_millis(20));
        decoder.stop();
        assert_eq!(*seen.lock(), vec![10, 30]);
    }

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "closed"))
        }
    }

    fn sample_tracepoint() -> Tracepoint {
        Tracepoint {
            tracebuffer: Arc::from("sink"),
            nr: 0,
            timestamp_ns: 1_000,
            pid: 3,
            tid: 4,
            source_type: SourceType::Userspace,
            kind: crate::tracebuffer::TracepointKind::Dynamic {
                file: "sink.c".into(),
                line: 9,
                message: "hello".into(),
            },
        }
    }

    #[test]
    fn test_write_sink_renders_one_line_per_tracepoint() {
        let mut sink = WriteSink::new(Vec::new());
        sink.consume(sample_tracepoint());
        sink.consume(sample_tracepoint());
        sink.flush();
        let text = String::from_utf8(sink.out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], sample_tracepoint().render(&RawFormatter));
    }

    #[test]
    #[traced_test]
    fn test_write_sink_logs_flush_failure() {
        let mut sink = WriteSink::new(BrokenPipe);
        sink.consume(sample_tracepoint());
        sink.flush();
        assert!(logs_contain("failed to flush output"));
    }
}
