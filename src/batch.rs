//! Batcher (spec §4.2): groups the record sequence into fixed-size
//! batches and applies the optional per-record transform.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};

use crate::config::{ErrorHandler, RunConfig};
use crate::dispatcher::Cancellation;
use crate::error::Error;
use crate::source::SourceAdapter;
use crate::transform::TransformPreset;

/// The unit of dispatcher work: a batch plus its retry bookkeeping
/// (spec §3). The admission permit is held for the envelope's entire
/// lifetime and dropped only at its terminal transition, which is exactly
/// how spec §4.3's "queued OR in-flight" ceiling is enforced.
pub struct BatchEnvelope<R> {
    pub batch: Vec<R>,
    pub attempt_count: u32,
    pub spawn_ordinal: u64,
    _permit: tokio::sync::OwnedSemaphorePermit,
}

impl<R> BatchEnvelope<R> {
    pub fn record_count(&self) -> usize {
        self.batch.len()
    }
}

/// Runs the batching loop to completion, sending envelopes into `out` as
/// they fill. Returns the total record count pulled from the source
/// (spec §3 invariant), regardless of any transform or delivery failures
/// downstream.
pub async fn run<R>(
    mut source: SourceAdapter<R>,
    config: &RunConfig<R>,
    source_is_materializable: bool,
    out: mpsc::Sender<BatchEnvelope<R>>,
    admission: Arc<Semaphore>,
    cancel: Cancellation,
) -> Result<u64, Error>
where
    R: Clone + Send + 'static,
{
    let spawn_ordinal = Arc::new(AtomicU64::new(0));
    let materialized_single_batch = config.no_batch && source_is_materializable;

    if materialized_single_batch {
        return run_no_batch(&mut source, config, out, admission, cancel, &spawn_ordinal).await;
    }

    let mut pending: Vec<R> = Vec::new();

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let Some(item) = source.next().await else {
            break;
        };

        let mut record = item?;
        record = apply_transform(record, config)?;
        pending.push(record);

        let flush_each = config.batch_size == 0;
        if flush_each || (config.batch_size >= 1 && pending.len() >= config.batch_size) {
            let batch = std::mem::take(&mut pending);
            send_batch(batch, &out, &admission, &cancel, &spawn_ordinal).await?;
        }
    }

    if !pending.is_empty() {
        send_batch(pending, &out, &admission, &cancel, &spawn_ordinal).await?;
    }

    Ok(source.record_count())
}

async fn run_no_batch<R>(
    source: &mut SourceAdapter<R>,
    config: &RunConfig<R>,
    out: mpsc::Sender<BatchEnvelope<R>>,
    admission: Arc<Semaphore>,
    cancel: Cancellation,
    spawn_ordinal: &Arc<AtomicU64>,
) -> Result<u64, Error>
where
    R: Clone + Send + 'static,
{
    let mut all = Vec::new();
    while let Some(item) = source.next().await {
        if cancel.is_cancelled() {
            break;
        }
        all.push(apply_transform(item?, config)?);
    }

    if !all.is_empty() {
        send_batch(all, &out, &admission, &cancel, spawn_ordinal).await?;
    }

    Ok(source.record_count())
}

async fn send_batch<R>(
    batch: Vec<R>,
    out: &mpsc::Sender<BatchEnvelope<R>>,
    admission: &Arc<Semaphore>,
    cancel: &Cancellation,
    spawn_ordinal: &Arc<AtomicU64>,
) -> Result<(), Error> {
    // Acquiring the admission permit IS the BLOCK/ADMIT backpressure
    // handshake of spec §4.3: this suspends the Batcher exactly when
    // `max_tasks` envelopes are already queued or in flight.
    let permit = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Ok(()),
        permit = admission.clone().acquire_owned() => permit.expect("admission semaphore never closed"),
    };

    let envelope = BatchEnvelope {
        batch,
        attempt_count: 0,
        spawn_ordinal: spawn_ordinal.fetch_add(1, Ordering::AcqRel),
        _permit: permit,
    };

    let _ = out.send(envelope).await;
    Ok(())
}

fn apply_transform<R>(record: R, config: &RunConfig<R>) -> Result<R, Error>
where
    R: Clone,
{
    let working = if config.clone_before_transform {
        record.clone()
    } else {
        record
    };

    let after_preset = match &config.transform_preset {
        Some(preset) => run_preset(preset.as_ref(), working, &config.error_handler),
        None => Ok(working),
    }?;

    match &config.transform {
        Some(transform) => match transform(after_preset.clone()) {
            Ok(result) => Ok(result),
            Err(message) => {
                if let Some(handler) = &config.error_handler {
                    handler(&after_preset, &message);
                    Ok(after_preset)
                } else {
                    #[cfg(feature = "tracing")]
                    tracing::error!(error = %message, "transform failed, aborting run");
                    Err(Error::TransformFailed(message))
                }
            }
        },
        None => Ok(after_preset),
    }
}

fn run_preset<R: Clone>(
    preset: &dyn TransformPreset<R>,
    record: R,
    error_handler: &Option<ErrorHandler<R>>,
) -> Result<R, Error> {
    match preset.apply(record.clone()) {
        Ok(result) => Ok(result),
        Err(message) => {
            if let Some(handler) = error_handler {
                handler(&record, &message);
                Ok(record)
            } else {
                Err(Error::TransformFailed(message))
            }
        }
    }
}
