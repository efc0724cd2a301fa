//! Error types for the bulk delivery pipeline.

use std::time::Duration;
use thiserror::Error;

use crate::result::RunSummary;

/// Main error type for a delivery run.
#[derive(Debug, Error)]
pub enum Error {
    /// Missing URL, missing data for a body-bearing method, or an invalid
    /// option combination. Surfaced synchronously at entry; the run never
    /// starts.
    #[error("invalid configuration: {0}")]
    ConfigurationInvalid(String),

    /// NDJSON (or single-record) parsing failed while pulling from the
    /// source.
    #[error("failed to parse record from source: {0}")]
    SourceParse(String),

    /// The underlying source (file, byte stream) failed to read.
    #[error("source I/O error: {0}")]
    SourceIo(String),

    /// The `data` source shape is not one of the accepted variants.
    #[error("invalid record source: {0}")]
    SourceInvalid(String),

    /// A caller-supplied transform raised.
    #[error("transform failed: {0}")]
    TransformFailed(String),

    /// Connect refused, DNS failure, or other network-level error.
    #[error("network error: {0}")]
    Network(#[source] reqwest::Error),

    /// The per-attempt timeout expired.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// TLS verification failed.
    #[error("TLS error: {0}")]
    Tls(#[source] reqwest::Error),

    /// HTTP status present in `retry_on`.
    #[error("transient HTTP status {status}")]
    Transient { status: u16 },

    /// HTTP 429 with a `Retry-After` header.
    #[error("rate limited, retry after {delay_hint:?}")]
    RateLimited { delay_hint: Option<Duration> },

    /// HTTP status not eligible for retry.
    #[error("permanent HTTP status {status}: {body}")]
    Permanent { status: u16, body: String },

    /// All retry attempts were exhausted without a successful outcome.
    #[error("gave up after {attempts} attempts: {last}")]
    GivenUp {
        attempts: u32,
        #[source]
        last: Box<Error>,
    },

    /// A caller-supplied `max_memory_usage` ceiling was exceeded.
    #[error("memory usage {observed} exceeds configured ceiling {ceiling}")]
    MemoryExceeded { observed: u64, ceiling: u64 },

    /// The run was cancelled cooperatively before this unit of work could
    /// complete.
    #[error("run cancelled")]
    Cancelled,

    /// A fatal error aborted the run after some batches had already
    /// completed; `partial` is the collector's state at the point of abort.
    #[error("run aborted: {source}")]
    Aborted {
        #[source]
        source: Box<Error>,
        partial: Box<RunSummary>,
    },
}

impl Error {
    /// Whether this outcome is eligible for retry under the default,
    /// class-based policy (ignoring any caller-supplied `retry_predicate`).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Network(_)
                | Error::Timeout(_)
                | Error::Tls(_)
                | Error::Transient { .. }
                | Error::RateLimited { .. }
        )
    }

    /// HTTP status code, if this error arose from a classified HTTP
    /// response.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Error::Transient { status } => Some(*status),
            Error::Permanent { status, .. } => Some(*status),
            Error::RateLimited { .. } => Some(429),
            _ => None,
        }
    }

    /// True for the set of variants that abort an entire run rather than
    /// being captured per-batch (spec §7 propagation policy).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ConfigurationInvalid(_)
                | Error::SourceParse(_)
                | Error::SourceIo(_)
                | Error::SourceInvalid(_)
                | Error::TransformFailed(_)
                | Error::MemoryExceeded { .. }
        )
    }

    /// Wrap a fatal error together with the partial summary collected
    /// before the abort (spec §7).
    pub fn aborted_with(self, partial: RunSummary) -> Error {
        Error::Aborted {
            source: Box::new(self),
            partial: Box::new(partial),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Timeout(Duration::default())
        } else {
            Error::Network(err)
        }
    }
}

/// An error captured alongside the batch it occurred on, retained in the
/// result collector's ring when storage is enabled.
#[derive(Debug, Clone)]
pub struct ErrorEnvelope {
    pub spawn_ordinal: u64,
    pub attempt_count: u32,
    pub message: String,
    pub status: Option<u16>,
}

impl ErrorEnvelope {
    pub fn from_error(spawn_ordinal: u64, attempt_count: u32, err: &Error) -> Self {
        Self {
            spawn_ordinal,
            attempt_count,
            message: err.to_string(),
            status: err.status_code(),
        }
    }
}
