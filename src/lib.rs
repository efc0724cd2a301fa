//! bulkhttp
//!
//! Streaming, bulk HTTP delivery of record collections: pull records from a
//! source, batch them, and deliver each batch over HTTP with bounded
//! concurrency, retries, and backoff.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use bulkhttp::{DataSource, RunConfig};
//!
//! #[derive(Clone, serde::Serialize, serde::Deserialize)]
//! struct Event {
//!     id: u32,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), bulkhttp::Error> {
//!     let records: Vec<Event> = (0..100).map(|id| Event { id }).collect();
//!     let config = RunConfig::builder("https://example.com/ingest", DataSource::Materialized(records))
//!         .batch_size(10)
//!         .concurrency(4)
//!         .build()?;
//!
//!     let summary = bulkhttp::run(config).await?;
//!     println!("delivered {} records in {} requests", summary.record_count, summary.request_count);
//!     Ok(())
//! }
//! ```

mod batch;
mod collector;
mod config;
mod dispatcher;
mod error;
mod http_client;
mod result;
mod retry;
mod source;
mod transform;

pub use collector::{NdjsonFileSink, OutputSink};
pub use config::{
    BodyParams, DataSource, DryRun, ErrorHandler, Record, RunConfig, RunConfigBuilder, Transform,
};
pub use dispatcher::Cancellation;
pub use error::{Error, ErrorEnvelope};
pub use http_client::{CookieJar, DefaultMultipartBuilder, InMemoryCookieJar, MultipartBuilder, NoopCookieJar};
pub use result::{HttpResponse, MemoryStats, ResponseData, ResponseEntry, RunSummary};
pub use retry::{default_retry_on, Decision, Outcome, Retries, RetryPolicy, RetryPredicate};
pub use transform::{IdentityPreset, TransformPreset};

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};

/// Interval at which the optional memory monitor samples process RSS
/// against `max_memory_usage` (spec §7).
const MEMORY_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Reduces the independent results of a [`run_many`] call into a caller's
/// preferred shape.
pub type Reducer<T> = Box<dyn FnOnce(Vec<Result<RunSummary, Error>>) -> T + Send>;

/// Run one delivery to completion: pull the source, batch, dispatch over
/// HTTP with retries, and collect the terminal outcomes.
///
/// On success, returns the aggregate [`RunSummary`]. On a fatal error
/// (`ConfigurationInvalid`, `SourceParse`, `SourceIo`, `SourceInvalid`,
/// `TransformFailed`, or `MemoryExceeded`) returns `Error::Aborted`
/// carrying the best-effort partial summary collected before the abort.
#[cfg_attr(feature = "tracing", tracing::instrument(skip(config), fields(url = %config.url)))]
pub async fn run<R: Record>(mut config: RunConfig<R>) -> Result<RunSummary, Error> {
    let source_is_materializable = config.data.is_materializable();
    let data = std::mem::replace(&mut config.data, DataSource::Materialized(Vec::new()));
    let max_memory_usage = config.max_memory_usage;

    let config = Arc::new(config);
    let cancel = Cancellation::new();
    let collector = Arc::new(collector::ResultCollector::new(
        config.max_response_buffer,
        config.store_responses,
    ));
    let admission = Arc::new(Semaphore::new(config.max_tasks));

    let (source, source_handle) = source::SourceAdapter::spawn(data, config.high_water_mark, cancel.clone());
    let (tx, rx) = mpsc::channel(config.max_tasks);

    let memory_monitor = max_memory_usage.map(|ceiling| {
        let cancel = cancel.clone();
        tokio::spawn(async move { monitor_memory(ceiling, cancel).await })
    });

    let dispatcher_handle = tokio::spawn(dispatcher::run(
        config.clone(),
        rx,
        collector.clone(),
        cancel.clone(),
    ));

    let batch_result = batch::run(source, &config, source_is_materializable, tx, admission, cancel.clone()).await;

    let _ = source_handle.await;
    let _ = dispatcher_handle.await;

    // Work is fully drained; wake the memory monitor (if any) so it can
    // exit rather than poll forever.
    cancel.cancel();
    let memory_exceeded = match memory_monitor {
        Some(handle) => handle.await.ok().flatten(),
        None => None,
    };

    match batch_result {
        Ok(record_count) => {
            collector.set_record_count(record_count);
            let summary = collector.finalize();
            if let Some(observed) = memory_exceeded {
                let err = Error::MemoryExceeded {
                    observed,
                    ceiling: max_memory_usage.unwrap_or(observed),
                };
                #[cfg(feature = "tracing")]
                tracing::error!(observed, "memory ceiling exceeded, aborting run");
                return Err(err.aborted_with(summary));
            }
            Ok(summary)
        }
        Err(err) => {
            #[cfg(feature = "tracing")]
            tracing::error!(error = %err, "run aborted by fatal error");
            let summary = collector.finalize();
            Err(err.aborted_with(summary))
        }
    }
}

async fn monitor_memory(ceiling: u64, cancel: Cancellation) -> Option<u64> {
    loop {
        tokio::time::sleep(MEMORY_POLL_INTERVAL).await;
        if cancel.is_cancelled() {
            return None;
        }
        let stats = result::MemoryStats::sample();
        if stats.rss_bytes > ceiling {
            cancel.cancel();
            return Some(stats.rss_bytes);
        }
    }
}

/// Run each of `configs` to completion independently (spec §9's resolved
/// Open Question: one config's failure never aborts the others), then fold
/// the per-run results with `reducer`, or return them as-is when no
/// reducer is supplied.
pub async fn run_many<R, T>(configs: Vec<RunConfig<R>>, reducer: Option<Reducer<T>>) -> T
where
    R: Record,
    T: From<Vec<Result<RunSummary, Error>>>,
{
    let handles: Vec<_> = configs.into_iter().map(|config| tokio::spawn(run(config))).collect();

    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        results.push(handle.await.unwrap_or(Err(Error::Cancelled)));
    }

    match reducer {
        Some(reducer) => reducer(results),
        None => T::from(results),
    }
}
