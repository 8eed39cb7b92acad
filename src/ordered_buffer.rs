//! Bounded reorder buffer for live decoding.
//!
//! Tracepoints from many ring buffers arrive roughly, but not exactly, in time
//! order. The buffer keeps them in a min-heap on timestamp and only releases
//! an entry once it is at least `order_delay_ns` behind the watermark that
//! producers advance. When full, the oldest entry is dropped to make room.
//!
//! ```text
//! producers ──push──▶ [ min-heap on timestamp ] ──pop / pop_all_ready──▶ consumer
//!            ──update_watermark──▶ safe_threshold = watermark - order_delay
//! ```

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::tracebuffer::Tracepoint;

/// Default capacity in tracepoints.
pub const DEFAULT_MAX_SIZE: usize = 10_000;

/// Default reorder window (100 ms).
pub const DEFAULT_ORDER_DELAY_NS: u64 = 100_000_000;

/// Counters exposed for monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrderedBufferStats {
    /// Tracepoints accepted.
    pub total_pushed: u64,
    /// Tracepoints released.
    pub total_popped: u64,
    /// Tracepoints discarded because the buffer was full.
    pub total_dropped: u64,
    /// Tracepoints currently held.
    pub current_size: usize,
    /// Largest size reached.
    pub high_water_mark: usize,
    /// Current watermark.
    pub watermark_ns: u64,
}

struct HeapItem {
    timestamp_ns: u64,
    seq: u64,
    tracepoint: Tracepoint,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.timestamp_ns == other.timestamp_ns && self.seq == other.seq
    }
}

impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: reverse so the oldest entry is on top.
        other
            .timestamp_ns
            .cmp(&self.timestamp_ns)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Inner {
    heap: BinaryHeap<HeapItem>,
    next_seq: u64,
    watermark_ns: u64,
    finish_requested: bool,
    stats: OrderedBufferStats,
}

impl Inner {
    fn safe_threshold(&self, order_delay_ns: u64) -> u64 {
        self.watermark_ns.saturating_sub(order_delay_ns)
    }

    fn has_ready(&self, order_delay_ns: u64) -> bool {
        match self.heap.peek() {
            None => false,
            Some(_) if self.finish_requested => true,
            Some(top) => top.timestamp_ns <= self.safe_threshold(order_delay_ns),
        }
    }

    fn pop_front(&mut self) -> Option<Tracepoint> {
        let item = self.heap.pop()?;
        self.stats.total_popped += 1;
        self.stats.current_size = self.heap.len();
        Some(item.tracepoint)
    }
}

/// Min-heap of tracepoints released in timestamp order behind a watermark.
///
/// All state sits behind one mutex; a condition variable wakes a consumer
/// blocked in [`OrderedBuffer::pop`].
pub struct OrderedBuffer {
    max_size: usize,
    order_delay_ns: u64,
    inner: Mutex<Inner>,
    ready: Condvar,
}

impl std::fmt::Debug for OrderedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderedBuffer")
            .field("max_size", &self.max_size)
            .field("order_delay_ns", &self.order_delay_ns)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Default for OrderedBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SIZE, DEFAULT_ORDER_DELAY_NS)
    }
}

impl OrderedBuffer {
    /// `max_size == 0` means unbounded.
    pub fn new(max_size: usize, order_delay_ns: u64) -> Self {
        Self {
            max_size,
            order_delay_ns,
            inner: Mutex::new(Inner {
                heap: BinaryHeap::with_capacity(max_size.min(DEFAULT_MAX_SIZE)),
                next_seq: 0,
                watermark_ns: 0,
                finish_requested: false,
                stats: OrderedBufferStats::default(),
            }),
            ready: Condvar::new(),
        }
    }

    /// Insert a tracepoint. `None` is rejected and returns `false`.
    ///
    /// A full buffer first drops its oldest entry.
    pub fn push(&self, tracepoint: impl Into<Option<Tracepoint>>) -> bool {
        let Some(tracepoint) = tracepoint.into() else {
            return false;
        };

        let mut inner = self.inner.lock();
        if self.max_size > 0 && inner.heap.len() >= self.max_size {
            inner.heap.pop();
            inner.stats.total_dropped += 1;
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.heap.push(HeapItem {
            timestamp_ns: tracepoint.timestamp_ns,
            seq,
            tracepoint,
        });
        inner.stats.total_pushed += 1;
        inner.stats.current_size = inner.heap.len();
        inner.stats.high_water_mark = inner.stats.high_water_mark.max(inner.heap.len());

        if inner.has_ready(self.order_delay_ns) {
            self.ready.notify_one();
        }
        true
    }

    /// Raise the watermark; lower values are ignored.
    pub fn update_watermark(&self, watermark_ns: u64) {
        let mut inner = self.inner.lock();
        inner.watermark_ns = inner.watermark_ns.max(watermark_ns);
        self.ready.notify_one();
    }

    /// Remove every ready entry, oldest first.
    ///
    /// After [`finish`](Self::finish) everything is ready.
    pub fn pop_all_ready(&self) -> Vec<Tracepoint> {
        let mut inner = self.inner.lock();
        let mut out = Vec::new();
        while inner.has_ready(self.order_delay_ns) {
            match inner.pop_front() {
                Some(tracepoint) => out.push(tracepoint),
                None => break,
            }
        }
        out
    }

    /// Wait up to `timeout` for the oldest ready entry.
    ///
    /// Returns early with `None` when [`finish`](Self::finish) is called on
    /// an empty buffer.
    pub fn pop(&self, timeout: Duration) -> Option<Tracepoint> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if inner.has_ready(self.order_delay_ns) {
                return inner.pop_front();
            }
            if inner.finish_requested {
                return None;
            }
            if self.ready.wait_until(&mut inner, deadline).timed_out() {
                return if inner.has_ready(self.order_delay_ns) {
                    inner.pop_front()
                } else {
                    None
                };
            }
        }
    }

    /// Signal that no more data is pending. Idempotent.
    pub fn finish(&self) {
        let mut inner = self.inner.lock();
        inner.finish_requested = true;
        self.ready.notify_all();
    }

    /// `true` once finish was requested and the buffer is drained.
    pub fn finished(&self) -> bool {
        let inner = self.inner.lock();
        inner.finish_requested && inner.heap.is_empty()
    }

    /// Nothing is held.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().heap.is_empty()
    }

    /// Number of held tracepoints.
    pub fn len(&self) -> usize {
        self.inner.lock().heap.len()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> OrderedBufferStats {
        let inner = self.inner.lock();
        OrderedBufferStats {
            current_size: inner.heap.len(),
            watermark_ns: inner.watermark_ns,
            ..inner.stats
        }
    }

    /// Hold-back delay in nanoseconds.
    pub fn order_delay_ns(&self) -> u64 {
        self.order_delay_ns
    }

    /// Capacity; 0 means unbounded.
    pub fn max_size(&self) -> usize {
        self.max_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracebuffer::{SourceType, TracepointKind};
    use std::sync::Arc;
    use std::thread;

    fn tp(timestamp_ns: u64) -> Tracepoint {
        Tracepoint {
            tracebuffer: Arc::from("unit"),
            nr: 0,
            timestamp_ns,
            pid: 1,
            tid: 1,
            source_type: SourceType::Userspace,
            kind: TracepointKind::Dynamic {
                file: "unit.rs".into(),
                line: 1,
                message: String::new(),
            },
        }
    }

    fn timestamps(tracepoints: &[Tracepoint]) -> Vec<u64> {
        tracepoints.iter().map(|t| t.timestamp_ns).collect()
    }

    #[test]
    fn test_releases_in_timestamp_order() {
        let buffer = OrderedBuffer::new(100, 0);
        for ts in [3000, 1000, 2000, 5000, 4000] {
            assert!(buffer.push(tp(ts)));
        }
        buffer.update_watermark(10_000);
        assert_eq!(
            timestamps(&buffer.pop_all_ready()),
            vec![1000, 2000, 3000, 4000, 5000]
        );
    }

    #[test]
    fn test_drops_oldest_when_full() {
        let buffer = OrderedBuffer::new(3, 0);
        for ts in [1000, 2000, 3000, 4000] {
            buffer.push(tp(ts));
        }
        assert_eq!(buffer.stats().total_dropped, 1);
        assert_eq!(buffer.stats().high_water_mark, 3);
        buffer.update_watermark(100_000);
        assert_eq!(timestamps(&buffer.pop_all_ready()), vec![2000, 3000, 4000]);
    }

    #[test]
    fn test_watermark_gates_release() {
        let buffer = OrderedBuffer::new(100, 50_000_000);
        for ts in [100_000_000, 120_000_000, 200_000_000] {
            buffer.push(tp(ts));
        }
        buffer.update_watermark(160_000_000);
        assert_eq!(timestamps(&buffer.pop_all_ready()), vec![100_000_000]);
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn test_watermark_never_moves_back() {
        let buffer = OrderedBuffer::new(0, 0);
        buffer.update_watermark(500);
        buffer.update_watermark(100);
        assert_eq!(buffer.stats().watermark_ns, 500);
    }

    #[test]
    fn test_rejects_none() {
        let buffer = OrderedBuffer::default();
        assert!(!buffer.push(None));
        assert_eq!(buffer.stats().total_pushed, 0);
        assert_eq!(buffer.max_size(), DEFAULT_MAX_SIZE);
        assert_eq!(buffer.order_delay_ns(), DEFAULT_ORDER_DELAY_NS);
    }

    #[test]
    fn test_finish_is_not_sticky() {
        let buffer = OrderedBuffer::new(10, 1_000_000);
        buffer.push(tp(42));
        buffer.finish();
        assert!(!buffer.finished());
        assert_eq!(timestamps(&buffer.pop_all_ready()), vec![42]);
        assert!(buffer.finished());
        buffer.push(tp(43));
        assert!(!buffer.finished());
    }

    #[test]
    fn test_finish_idempotent() {
        let once = OrderedBuffer::new(10, 0);
        let many = OrderedBuffer::new(10, 0);
        for buffer in [&once, &many] {
            buffer.push(tp(7));
        }
        once.finish();
        for _ in 0..5 {
            many.finish();
        }
        assert_eq!(once.finished(), many.finished());
        assert_eq!(timestamps(&once.pop_all_ready()), timestamps(&many.pop_all_ready()));
        assert_eq!(once.stats(), many.stats());
    }

    #[test]
    fn test_pop_times_out() {
        let buffer = OrderedBuffer::new(10, 1_000);
        buffer.push(tp(5_000));
        let started = Instant::now();
        assert!(buffer.pop(Duration::from_millis(20)).is_none());
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_pop_wakes_on_watermark() {
        let buffer = Arc::new(OrderedBuffer::new(10, 1_000));
        buffer.push(tp(5_000));
        let producer = {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                buffer.update_watermark(10_000);
            })
        };
        let popped = buffer.pop(Duration::from_secs(5));
        producer.join().unwrap();
        assert_eq!(popped.map(|t| t.timestamp_ns), Some(5_000));
        assert_eq!(buffer.stats().total_popped, 1);
    }

    #[test]
    fn test_pop_wakes_on_finish() {
        let buffer = Arc::new(OrderedBuffer::new(10, 0));
        let finisher = {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                buffer.finish();
            })
        };
        let started = Instant::now();
        assert!(buffer.pop(Duration::from_secs(10)).is_none());
        assert!(started.elapsed() < Duration::from_secs(5));
        finisher.join().unwrap();
        assert!(buffer.finished());
    }
}
