//! Record Source Adapter (spec §4.1): normalizes any accepted input shape
//! into a uniform, pull-based, backpressure-aware sequence of records.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::DataSource;
use crate::dispatcher::Cancellation;
use crate::error::Error;

/// Average bytes assumed per record when converting `high_water_mark`
/// (a byte budget) into a channel depth (a record-count budget).
const ASSUMED_RECORD_BYTES: usize = 256;

/// A pull-based handle over the normalized record sequence, backed by a
/// bounded channel whose capacity enforces `high_water_mark` (spec §4.1).
pub struct SourceAdapter<R> {
    receiver: mpsc::Receiver<Result<R, Error>>,
    record_count: Arc<AtomicU64>,
}

impl<R: Send + 'static> SourceAdapter<R> {
    /// Spawn the background producer task and return a handle to pull from.
    pub fn spawn(
        data: DataSource<R>,
        high_water_mark: usize,
        cancel: Cancellation,
    ) -> (Self, JoinHandle<()>)
    where
        R: serde::de::DeserializeOwned,
    {
        let capacity = (high_water_mark / ASSUMED_RECORD_BYTES).max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let record_count = Arc::new(AtomicU64::new(0));
        let count_clone = record_count.clone();

        let handle = tokio::spawn(async move {
            produce(data, tx, count_clone, cancel).await;
        });

        (
            SourceAdapter {
                receiver: rx,
                record_count,
            },
            handle,
        )
    }

    /// Pull the next record, or `None` at end-of-source.
    pub async fn next(&mut self) -> Option<Result<R, Error>> {
        self.receiver.recv().await
    }

    /// Total records produced so far (spec §3 invariant: equals the total
    /// pulled from the source regardless of delivery outcome).
    pub fn record_count(&self) -> u64 {
        self.record_count.load(Ordering::Acquire)
    }
}

async fn produce<R>(
    data: DataSource<R>,
    tx: mpsc::Sender<Result<R, Error>>,
    record_count: Arc<AtomicU64>,
    cancel: Cancellation,
) where
    R: serde::de::DeserializeOwned + Send + 'static,
{
    macro_rules! emit {
        ($record:expr) => {{
            record_count.fetch_add(1, Ordering::AcqRel);
            if tx.send(Ok($record)).await.is_err() {
                return;
            }
        }};
    }

    match data {
        DataSource::Materialized(records) => {
            for record in records {
                if cancel.is_cancelled() {
                    return;
                }
                emit!(record);
            }
        }
        DataSource::Single(record) => {
            emit!(record);
        }
        DataSource::ObjectStream(mut stream) => {
            while let Some(item) = stream.next().await {
                if cancel.is_cancelled() {
                    return;
                }
                match item {
                    Ok(record) => emit!(record),
                    Err(err) => {
                        let _ = tx.send(Err(err)).await;
                        return;
                    }
                }
            }
        }
        DataSource::Path(path) => {
            let mut file = match tokio::fs::File::open(&path).await {
                Ok(f) => f,
                Err(e) => {
                    let _ = tx
                        .send(Err(Error::SourceIo(format!(
                            "opening {}: {e}",
                            path.display()
                        ))))
                        .await;
                    return;
                }
            };

            // Peek the first non-whitespace byte to distinguish a single
            // JSON array from newline-delimited JSON (spec §4.1).
            let mut probe = Vec::new();
            if let Err(e) = file.read_to_end(&mut probe).await {
                let _ = tx
                    .send(Err(Error::SourceIo(format!(
                        "reading {}: {e}",
                        path.display()
                    ))))
                    .await;
                return;
            }

            let first_non_ws = probe.iter().find(|b| !b.is_ascii_whitespace()).copied();
            if first_non_ws == Some(b'[') {
                match serde_json::from_slice::<Vec<R>>(&probe) {
                    Ok(records) => {
                        for record in records {
                            if cancel.is_cancelled() {
                                return;
                            }
                            emit!(record);
                        }
                    }
                    Err(e) => {
                        let _ = tx
                            .send(Err(Error::SourceParse(format!(
                                "invalid JSON array in {}: {e}",
                                path.display()
                            ))))
                            .await;
                    }
                }
            } else {
                run_ndjson(std::io::Cursor::new(probe), tx, record_count, cancel).await;
            }
        }
        DataSource::NdjsonReader(reader) => {
            run_ndjson(reader, tx, record_count, cancel).await;
        }
    }
}

/// Drives NDJSON parsing over any `AsyncRead`, implementing the exact
/// segmentation rule from spec §4.1: accumulate bytes, split on newline,
/// trim, parse non-empty segments; carry the trailing incomplete segment
/// across reads; parse a final non-empty trailing segment at EOF.
async fn run_ndjson<R, A>(
    mut reader: A,
    tx: mpsc::Sender<Result<R, Error>>,
    record_count: Arc<AtomicU64>,
    cancel: Cancellation,
) where
    R: serde::de::DeserializeOwned + Send + 'static,
    A: tokio::io::AsyncRead + Unpin,
{
    let mut carry: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 8192];

    loop {
        if cancel.is_cancelled() {
            return;
        }

        let n = match reader.read(&mut chunk).await {
            Ok(0) => {
                let segment = carry.trim_ascii();
                if !segment.is_empty() {
                    match parse_line::<R>(segment) {
                        Ok(record) => {
                            record_count.fetch_add(1, Ordering::AcqRel);
                            let _ = tx.send(Ok(record)).await;
                        }
                        Err(e) => {
                            let _ = tx.send(Err(e)).await;
                        }
                    }
                }
                return;
            }
            Ok(n) => n,
            Err(e) => {
                let _ = tx.send(Err(Error::SourceIo(e.to_string()))).await;
                return;
            }
        };

        carry.extend_from_slice(&chunk[..n]);

        loop {
            let Some(pos) = carry.iter().position(|&b| b == b'\n') else {
                break;
            };
            let line: Vec<u8> = carry.drain(..=pos).collect();
            let segment = line[..line.len() - 1].trim_ascii();
            if segment.is_empty() {
                continue;
            }
            match parse_line::<R>(segment) {
                Ok(record) => {
                    record_count.fetch_add(1, Ordering::AcqRel);
                    if tx.send(Ok(record)).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            }
        }
    }
}

fn parse_line<R: serde::de::DeserializeOwned>(segment: &[u8]) -> Result<R, Error> {
    serde_json::from_slice(segment)
        .map_err(|e| Error::SourceParse(format!("{e} in `{}`", String::from_utf8_lossy(segment))))
}

trait TrimAscii {
    fn trim_ascii(&self) -> &[u8];
}

impl TrimAscii for [u8] {
    fn trim_ascii(&self) -> &[u8] {
        let start = self.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(self.len());
        let end = self
            .iter()
            .rposition(|b| !b.is_ascii_whitespace())
            .map(|i| i + 1)
            .unwrap_or(start);
        &self[start..end]
    }
}

impl TrimAscii for Vec<u8> {
    fn trim_ascii(&self) -> &[u8] {
        self.as_slice().trim_ascii()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Cancellation;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Rec {
        id: u32,
    }

    #[tokio::test]
    async fn materialized_source_preserves_order_and_count() {
        let records: Vec<Rec> = (0..10).map(|id| Rec { id }).collect();
        let (mut adapter, handle) =
            SourceAdapter::spawn(DataSource::Materialized(records.clone()), 16384, Cancellation::new());

        let mut out = Vec::new();
        while let Some(item) = adapter.next().await {
            out.push(item.unwrap());
        }
        handle.await.unwrap();

        assert_eq!(out, records);
        assert_eq!(adapter.record_count(), 10);
    }

    #[tokio::test]
    async fn ndjson_stream_parses_and_reports_count() {
        let bytes = b"{\"id\":1}\n{\"id\":2}\n{\"id\":3}\n".to_vec();
        let reader: std::io::Cursor<Vec<u8>> = std::io::Cursor::new(bytes);
        let (mut adapter, handle) = SourceAdapter::spawn(
            DataSource::NdjsonReader(Box::pin(reader)),
            16384,
            Cancellation::new(),
        );

        let mut out = Vec::new();
        while let Some(item) = adapter.next().await {
            out.push(item.unwrap());
        }
        handle.await.unwrap();

        assert_eq!(out, vec![Rec { id: 1 }, Rec { id: 2 }, Rec { id: 3 }]);
        assert_eq!(adapter.record_count(), 3);
    }

    #[tokio::test]
    async fn ndjson_invalid_line_fails_the_run() {
        let bytes = b"{\"id\":1}\n{\"id\":4\n".to_vec();
        let reader: std::io::Cursor<Vec<u8>> = std::io::Cursor::new(bytes);
        let (mut adapter, handle) = SourceAdapter::spawn(
            DataSource::NdjsonReader(Box::pin(reader)),
            16384,
            Cancellation::new(),
        );

        let first = adapter.next().await.unwrap();
        assert!(first.is_ok());
        let second = adapter.next().await.unwrap();
        assert!(matches!(second, Err(Error::SourceParse(_))));
        handle.await.unwrap();
    }
}
