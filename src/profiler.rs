//! Per-frame job trace ring consumed by an external reporter.
//!
//! Recording is a single `fetch_add` plus a slot write: never blocking,
//! never allocating, never panicking. Events past the ring capacity are
//! counted and dropped. The consumer reads between `frame_start` calls;
//! in-frame reads of a slot being written would tear, which is why the
//! snapshot is taken by `frame_end`.

use std::cell::UnsafeCell;
use std::io::Write;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;

/// One executed job.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct JobTrace {
    pub start_ns: u64,
    pub end_ns: u64,
    pub worker_id: u32,
    pub name: &'static str,
}

/// Everything recorded between a `frame_start`/`frame_end` pair.
#[derive(Debug, Clone, Serialize)]
pub struct FrameProfile {
    pub frame_start_ns: u64,
    pub frame_end_ns: u64,
    pub events: Vec<JobTrace>,
    /// Events that arrived after the ring filled up.
    pub dropped: u64,
}

impl FrameProfile {
    pub fn frame_duration_ns(&self) -> u64 {
        self.frame_end_ns.saturating_sub(self.frame_start_ns)
    }

    /// Writes the frame as a chrome://tracing / Perfetto JSON array.
    pub fn write_chrome_trace<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        write!(writer, "[")?;
        for (i, event) in self.events.iter().enumerate() {
            if i > 0 {
                write!(writer, ",")?;
            }
            write!(
                writer,
                "{{\"name\":\"{}\",\"ph\":\"X\",\"ts\":{},\"dur\":{},\"pid\":1,\"tid\":{}}}",
                event.name,
                event.start_ns / 1_000,
                (event.end_ns.saturating_sub(event.start_ns)) / 1_000,
                event.worker_id
            )?;
        }
        writeln!(writer, "]")?;
        writer.flush()
    }
}

pub(crate) struct Profiler {
    events: Box<[UnsafeCell<JobTrace>]>,
    count: AtomicUsize,
    frame_start_ns: AtomicU64,
    dropped: AtomicU64,
}

// SAFETY: a slot is written exactly once per frame by the worker that
// claimed its index via fetch_add; snapshots only read indices below the
// published count, after the frame has ended.
unsafe impl Sync for Profiler {}

const EMPTY_TRACE: JobTrace = JobTrace {
    start_ns: 0,
    end_ns: 0,
    worker_id: 0,
    name: "",
};

impl Profiler {
    pub(crate) fn new(capacity: usize) -> Profiler {
        let capacity = capacity.max(1);
        Profiler {
            events: (0..capacity).map(|_| UnsafeCell::new(EMPTY_TRACE)).collect(),
            count: AtomicUsize::new(0),
            frame_start_ns: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Begins a new frame, discarding the previous frame's events.
    pub(crate) fn frame_start(&self, now_ns: u64) {
        self.count.store(0, Ordering::Release);
        self.dropped.store(0, Ordering::Relaxed);
        self.frame_start_ns.store(now_ns, Ordering::Relaxed);
    }

    /// Records one job execution. Lock-free and infallible; overflow drops.
    pub(crate) fn record(&self, trace: JobTrace) {
        let index = self.count.fetch_add(1, Ordering::Relaxed);
        if index >= self.events.len() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        // SAFETY: fetch_add made `index` ours alone for this frame.
        unsafe { *self.events[index].get() = trace };
    }

    /// Ends the frame and snapshots it for the consumer.
    pub(crate) fn frame_end(&self, now_ns: u64) -> FrameProfile {
        let recorded = self.count.load(Ordering::Acquire).min(self.events.len());
        let events = (0..recorded)
            // SAFETY: indices below the count were fully written by their
            // recording workers before the frame ended.
            .map(|i| unsafe { *self.events[i].get() })
            .collect();
        FrameProfile {
            frame_start_ns: self.frame_start_ns.load(Ordering::Relaxed),
            frame_end_ns: now_ns,
            events,
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace(start: u64, end: u64, worker: u32) -> JobTrace {
        JobTrace {
            start_ns: start,
            end_ns: end,
            worker_id: worker,
            name: "t",
        }
    }

    #[test]
    fn records_and_snapshots() {
        let profiler = Profiler::new(8);
        profiler.frame_start(100);
        profiler.record(trace(110, 120, 0));
        profiler.record(trace(115, 130, 1));
        let frame = profiler.frame_end(200);
        assert_eq!(frame.events.len(), 2);
        assert_eq!(frame.dropped, 0);
        assert_eq!(frame.frame_duration_ns(), 100);
    }

    #[test]
    fn overflow_drops_not_panics() {
        let profiler = Profiler::new(2);
        profiler.frame_start(0);
        for i in 0..5 {
            profiler.record(trace(i, i + 1, 0));
        }
        let frame = profiler.frame_end(10);
        assert_eq!(frame.events.len(), 2);
        assert_eq!(frame.dropped, 3);
    }

    #[test]
    fn chrome_trace_is_valid_json_shape() {
        let profiler = Profiler::new(4);
        profiler.frame_start(0);
        profiler.record(trace(1_000, 3_000, 2));
        let frame = profiler.frame_end(5_000);
        let mut out = Vec::new();
        frame.write_chrome_trace(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with('['));
        assert!(text.contains("\"tid\":2"));
    }
}
