//! Per-file progress reporting.
//!
//! The core never renders anything. Hosts implement [`ProgressSink`] and
//! receive `(name, bytes_expected, bytes_done)` updates, throttled to the
//! reporting interval. Segmented files funnel all worker deltas through one
//! mutex-guarded counter, so updates are totals, never per-segment figures.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Minimum delay between two updates for the same file (completion always
/// reports).
pub const REPORT_INTERVAL: Duration = Duration::from_millis(100);

pub trait ProgressSink: Send + Sync {
    fn update(&self, name: &str, bytes_expected: u64, bytes_done: u64);
}

/// Sink that discards every update.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn update(&self, _name: &str, _bytes_expected: u64, _bytes_done: u64) {}
}

struct Counter {
    done: u64,
    last_emit: Option<Instant>,
}

/// Throttled progress counter for one file task.
pub struct FileProgress {
    name: String,
    expected: u64,
    counter: Mutex<Counter>,
    sink: Arc<dyn ProgressSink>,
}

impl FileProgress {
    pub fn new(name: &str, expected: u64, sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            name: name.to_owned(),
            expected,
            counter: Mutex::new(Counter { done: 0, last_emit: None }),
            sink,
        }
    }

    /// Record `delta` decompressed bytes; emits an update at most once per
    /// [`REPORT_INTERVAL`], and always when the expected total is reached.
    pub fn add(&self, delta: u64) {
        let Ok(mut c) = self.counter.lock() else { return };
        c.done += delta;
        let due = match c.last_emit {
            None => true,
            Some(t) => t.elapsed() >= REPORT_INTERVAL,
        };
        if due || c.done >= self.expected {
            self.sink.update(&self.name, self.expected, c.done);
            c.last_emit = Some(Instant::now());
        }
    }
}
