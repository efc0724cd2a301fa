//! Result Collector (spec §4.5): a fixed-capacity ring over responses that
//! coexists with streaming, plus the end-of-run aggregate.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

use crate::result::{MemoryStats, ResponseEntry, RunSummary};

/// Receives the retained responses at run termination and writes them out
/// in whatever format the implementation chooses (JSON, NDJSON, CSV, ...).
/// This is the "output sink" external collaborator of spec §6 — out of
/// scope for the core beyond this interface and the point at which it is
/// invoked.
pub trait OutputSink: Send + Sync {
    fn write(&self, responses: &[ResponseEntry]) -> Result<(), String>;
}

/// A minimal JSON-lines sink, provided as a usable default; richer formats
/// (CSV, pretty JSON) are left to callers per spec §1's scope note.
pub struct NdjsonFileSink {
    pub path: std::path::PathBuf,
}

impl OutputSink for NdjsonFileSink {
    fn write(&self, responses: &[ResponseEntry]) -> Result<(), String> {
        use std::io::Write;
        let mut file = std::fs::File::create(&self.path).map_err(|e| e.to_string())?;
        for entry in responses {
            let line = match entry {
                ResponseEntry::Http(r) => serde_json::json!({
                    "status": r.status,
                    "url": r.url,
                }),
                ResponseEntry::Curl(cmd) => serde_json::json!({ "curl": cmd }),
                ResponseEntry::Error(e) => serde_json::json!({
                    "error": e.message,
                    "status": e.status,
                }),
            };
            writeln!(file, "{line}").map_err(|e| e.to_string())?;
        }
        Ok(())
    }
}

/// Bounded ring of retained responses plus the monotonic run counters.
pub struct ResultCollector {
    ring: Mutex<VecDeque<ResponseEntry>>,
    capacity: usize,
    store: bool,
    request_count: AtomicU64,
    record_count: AtomicU64,
    error_count: AtomicU64,
    started_at: Instant,
}

impl ResultCollector {
    pub fn new(capacity: usize, store: bool) -> Self {
        Self {
            ring: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            store,
            request_count: AtomicU64::new(0),
            record_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    /// Record one terminal transition: one request attempt concluded
    /// (spec §3: `request_count` counts terminal attempts, not round
    /// trips), optionally with a retained response and/or an error.
    pub fn record_terminal(&self, entry: Option<ResponseEntry>, is_error: bool) {
        self.request_count.fetch_add(1, Ordering::AcqRel);
        if is_error {
            self.error_count.fetch_add(1, Ordering::AcqRel);
        }

        if let Some(entry) = entry {
            if self.store && self.capacity > 0 {
                let mut ring = self.ring.lock();
                if ring.len() >= self.capacity {
                    ring.pop_front();
                }
                ring.push_back(entry);
            }
        }
    }

    pub fn add_records(&self, n: u64) {
        self.record_count.fetch_add(n, Ordering::AcqRel);
    }

    pub fn set_record_count(&self, n: u64) {
        self.record_count.store(n, Ordering::Release);
    }

    /// Finalize the run, producing the `RunSummary` (spec §4.5).
    pub fn finalize(&self) -> RunSummary {
        let duration_ms = self.started_at.elapsed().as_millis() as u64;
        let request_count = self.request_count.load(Ordering::Acquire);
        let requests_per_second = if duration_ms > 0 {
            request_count * 1000 / duration_ms
        } else {
            0
        };

        RunSummary {
            responses: self.ring.lock().iter().cloned().collect(),
            request_count,
            record_count: self.record_count.load(Ordering::Acquire),
            error_count: self.error_count.load(Ordering::Acquire),
            duration_ms,
            requests_per_second,
            memory_stats: MemoryStats::sample(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorEnvelope;

    #[test]
    fn ring_evicts_oldest_entries_fifo() {
        let collector = ResultCollector::new(2, true);
        for i in 0..5u64 {
            collector.record_terminal(
                Some(ResponseEntry::Error(ErrorEnvelope {
                    spawn_ordinal: i,
                    attempt_count: 1,
                    message: format!("err-{i}"),
                    status: None,
                })),
                true,
            );
        }

        let summary = collector.finalize();
        assert_eq!(summary.responses.len(), 2);
        assert_eq!(summary.request_count, 5);
        assert_eq!(summary.error_count, 5);

        let ResponseEntry::Error(last) = &summary.responses[1] else {
            panic!("expected error entry");
        };
        assert_eq!(last.spawn_ordinal, 4);
    }

    #[test]
    fn store_responses_false_retains_nothing_but_counts_exactly() {
        let collector = ResultCollector::new(1000, false);
        for i in 0..3u64 {
            collector.record_terminal(
                Some(ResponseEntry::Error(ErrorEnvelope {
                    spawn_ordinal: i,
                    attempt_count: 1,
                    message: "x".into(),
                    status: None,
                })),
                true,
            );
        }

        let summary = collector.finalize();
        assert!(summary.responses.is_empty());
        assert_eq!(summary.request_count, 3);
        assert_eq!(summary.error_count, 3);
    }
}
