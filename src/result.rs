//! Wire-facing result types (spec §3): `HttpResponse`, `ResponseEntry`, and
//! the end-of-run `RunSummary`.

use indexmap::IndexMap;

use crate::error::ErrorEnvelope;

/// The parsed body of a successful response (spec §4.4 response body
/// parsing rules).
#[derive(Debug, Clone)]
pub enum ResponseData {
    Json(serde_json::Value),
    Text(String),
    Bytes(bytes::Bytes),
}

/// `{ data, status, status_text, url, method, headers? }` (spec §3).
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub data: ResponseData,
    pub status: u16,
    pub status_text: String,
    pub url: String,
    pub method: String,
    pub headers: Option<IndexMap<String, String>>,
}

/// One retained entry in the Result Collector's ring (spec §3).
#[derive(Debug, Clone)]
pub enum ResponseEntry {
    Http(HttpResponse),
    Curl(String),
    Error(ErrorEnvelope),
}

/// Best-effort process memory snapshot, sampled at finalization (spec
/// §4.5). Zeroed on platforms without a `/proc/self/status` to read.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryStats {
    pub heap_used_bytes: u64,
    pub rss_bytes: u64,
}

impl MemoryStats {
    /// Sample current process memory, best-effort.
    pub fn sample() -> Self {
        #[cfg(target_os = "linux")]
        {
            if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
                let rss_kb = status
                    .lines()
                    .find(|line| line.starts_with("VmRSS:"))
                    .and_then(|line| line.split_whitespace().nth(1))
                    .and_then(|kb| kb.parse::<u64>().ok())
                    .unwrap_or(0);
                return MemoryStats {
                    heap_used_bytes: rss_kb * 1024,
                    rss_bytes: rss_kb * 1024,
                };
            }
        }
        MemoryStats::default()
    }
}

/// `{ responses, request_count, record_count, error_count, duration_ms,
/// requests_per_second, memory_stats }` (spec §3).
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub responses: Vec<ResponseEntry>,
    pub request_count: u64,
    pub record_count: u64,
    pub error_count: u64,
    pub duration_ms: u64,
    pub requests_per_second: u64,
    pub memory_stats: MemoryStats,
}
