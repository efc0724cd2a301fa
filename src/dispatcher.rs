//! Dispatcher (spec §4.3): `concurrency` independent worker tasks pulling
//! admitted envelopes and driving each through the HTTP Client + Retry
//! Engine to a terminal transition.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::batch::BatchEnvelope;
use crate::collector::ResultCollector;
use crate::config::{DryRun, RunConfig};
use crate::error::{Error, ErrorEnvelope};
use crate::http_client::{Attempt, HttpExecutor};
use crate::result::ResponseEntry;
use crate::retry::{Decision, Outcome};

/// Cooperative cancellation, observed between attempts and while waiting
/// out a retry delay. Modeled on a single-shot watch channel rather than
/// an `AtomicBool` so that waiters can `.await` the transition instead of
/// polling (spec §4.3's "cancellation propagates promptly").
#[derive(Clone)]
pub struct Cancellation {
    tx: Arc<tokio::sync::watch::Sender<bool>>,
    rx: tokio::sync::watch::Receiver<bool>,
}

impl Cancellation {
    pub fn new() -> Self {
        let (tx, rx) = tokio::sync::watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested. Awaiting this when
    /// cancellation has already happened resolves immediately.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        let _ = rx.changed().await;
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

/// Drives the worker pool to completion: spawns `config.concurrency`
/// workers sharing one envelope queue, each delivering batches
/// independently until the queue is drained and closed (spec §4.3).
pub async fn run<R>(
    config: Arc<RunConfig<R>>,
    envelopes: mpsc::Receiver<BatchEnvelope<R>>,
    collector: Arc<ResultCollector>,
    cancel: Cancellation,
) where
    R: Serialize + Send + Sync + 'static,
{
    let shared_rx = Arc::new(AsyncMutex::new(envelopes));
    let executor = Arc::new(HttpExecutor::new(config.clone()));

    let mut workers = Vec::with_capacity(config.concurrency);
    for _ in 0..config.concurrency {
        let shared_rx = shared_rx.clone();
        let executor = executor.clone();
        let config = config.clone();
        let collector = collector.clone();
        let cancel = cancel.clone();

        workers.push(tokio::spawn(async move {
            worker_loop(shared_rx, executor, config, collector, cancel).await;
        }));
    }

    for worker in workers {
        let _ = worker.await;
    }
}

async fn worker_loop<R>(
    shared_rx: Arc<AsyncMutex<mpsc::Receiver<BatchEnvelope<R>>>>,
    executor: Arc<HttpExecutor<R>>,
    config: Arc<RunConfig<R>>,
    collector: Arc<ResultCollector>,
    cancel: Cancellation,
) where
    R: Serialize + Send + Sync + 'static,
{
    loop {
        let envelope = {
            let mut rx = shared_rx.lock().await;
            rx.recv().await
        };

        let Some(envelope) = envelope else {
            return;
        };

        if cancel.is_cancelled() {
            #[cfg(feature = "tracing")]
            tracing::warn!(spawn_ordinal = envelope.spawn_ordinal, "dropping queued envelope: run cancelled");
            collector.record_terminal(
                Some(ResponseEntry::Error(ErrorEnvelope::from_error(
                    envelope.spawn_ordinal,
                    envelope.attempt_count,
                    &Error::Cancelled,
                ))),
                true,
            );
            continue;
        }

        deliver(&executor, &config, envelope, &collector, &cancel).await;

        if !config.delay_between_requests.is_zero() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(config.delay_between_requests) => {}
            }
        }
    }
}

/// Delivers one envelope to its terminal transition, retrying per
/// `config.retry_policy` (spec §4.4).
#[cfg_attr(feature = "tracing", tracing::instrument(skip(executor, config, envelope, collector, cancel), fields(spawn_ordinal = envelope.spawn_ordinal)))]
async fn deliver<R: Serialize>(
    executor: &HttpExecutor<R>,
    config: &RunConfig<R>,
    envelope: BatchEnvelope<R>,
    collector: &ResultCollector,
    cancel: &Cancellation,
) {
    let spawn_ordinal = envelope.spawn_ordinal;

    if matches!(config.dry_run, DryRun::Silent) {
        collector.record_terminal(None, false);
        return;
    }

    let batch_json = match serde_json::to_value(&envelope.batch) {
        Ok(value) => value,
        Err(err) => {
            let error = Error::SourceParse(format!("failed to serialize batch: {err}"));
            collector.record_terminal(
                Some(ResponseEntry::Error(ErrorEnvelope::from_error(spawn_ordinal, 0, &error))),
                true,
            );
            return;
        }
    };

    let mut attempt_count: u32 = 0;
    let mut prev_delay = config.retry_policy.base_delay;

    loop {
        let attempt = match executor.attempt(&batch_json, cancel).await {
            Ok(attempt) => attempt,
            Err(err) => {
                collector.record_terminal(
                    Some(ResponseEntry::Error(ErrorEnvelope::from_error(
                        spawn_ordinal,
                        attempt_count + 1,
                        &err,
                    ))),
                    true,
                );
                return;
            }
        };

        match attempt {
            Attempt::CurlDryRun(command) => {
                collector.record_terminal(Some(ResponseEntry::Curl(command)), false);
                return;
            }
            Attempt::Cancelled => {
                collector.record_terminal(
                    Some(ResponseEntry::Error(ErrorEnvelope::from_error(
                        spawn_ordinal,
                        attempt_count + 1,
                        &Error::Cancelled,
                    ))),
                    true,
                );
                return;
            }
            Attempt::Success(response) => {
                collector.record_terminal(Some(ResponseEntry::Http(response)), false);
                return;
            }
            Attempt::FireAndForget => {
                collector.record_terminal(None, false);
                return;
            }
            Attempt::Classified { outcome, source, body } => {
                let decision = config.retry_policy.decide(&outcome, attempt_count, prev_delay);
                match decision {
                    Decision::Ok => {
                        collector.record_terminal(None, false);
                        return;
                    }
                    Decision::Failed => {
                        let error = outcome_to_error(outcome, source, body, config.retry_policy.timeout);
                        collector.record_terminal(
                            Some(ResponseEntry::Error(ErrorEnvelope::from_error(
                                spawn_ordinal,
                                attempt_count + 1,
                                &error,
                            ))),
                            true,
                        );
                        return;
                    }
                    Decision::GivenUp => {
                        let last = outcome_to_error(outcome, source, body, config.retry_policy.timeout);
                        let error = Error::GivenUp {
                            attempts: attempt_count + 1,
                            last: Box::new(last),
                        };
                        collector.record_terminal(
                            Some(ResponseEntry::Error(ErrorEnvelope::from_error(
                                spawn_ordinal,
                                attempt_count + 1,
                                &error,
                            ))),
                            true,
                        );
                        return;
                    }
                    Decision::Retry { delay } => {
                        attempt_count += 1;
                        prev_delay = delay;
                        #[cfg(feature = "tracing")]
                        tracing::warn!(spawn_ordinal, attempt_count, delay_ms = delay.as_millis() as u64, "retrying after transient outcome");
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }
    }
}

fn outcome_to_error(
    outcome: Outcome,
    source: Option<reqwest::Error>,
    body: Option<String>,
    timeout: Duration,
) -> Error {
    match outcome {
        Outcome::Ok => Error::ConfigurationInvalid("unreachable: Ok outcome carries no error".into()),
        Outcome::Network => match source {
            Some(err) => Error::Network(err),
            None => Error::ConfigurationInvalid("network outcome missing source error".into()),
        },
        Outcome::Timeout => Error::Timeout(timeout),
        Outcome::Tls => match source {
            Some(err) => Error::Tls(err),
            None => Error::ConfigurationInvalid("tls outcome missing source error".into()),
        },
        Outcome::RateLimited { delay_hint } => Error::RateLimited { delay_hint },
        Outcome::Transient { status } => Error::Transient { status },
        Outcome::Permanent { status } => Error::Permanent {
            status,
            body: body.unwrap_or_default(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancellation_resolves_after_cancel_is_called() {
        let cancel = Cancellation::new();
        assert!(!cancel.is_cancelled());

        let waiter = cancel.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
        });

        cancel.cancel();
        handle.await.unwrap();
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_future_resolves_immediately_if_already_cancelled() {
        let cancel = Cancellation::new();
        cancel.cancel();
        tokio::time::timeout(Duration::from_millis(50), cancel.cancelled())
            .await
            .expect("cancelled() must not block once already cancelled");
    }
}
