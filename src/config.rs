//! Run configuration: the single typed surface through which every
//! recognized option from spec §6 is set.

use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use indexmap::IndexMap;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::collector::OutputSink;
use crate::error::Error;
use crate::http_client::{CookieJar, MultipartBuilder, NoopCookieJar};
use crate::retry::{default_retry_on, Retries, RetryPolicy, RetryPredicate};
use crate::transform::TransformPreset;

/// Bound satisfied by every record type this crate can carry end to end.
///
/// `DeserializeOwned` is only exercised by [`DataSource::Path`] and
/// [`DataSource::NdjsonReader`] — materialized and object-stream sources
/// never parse `R` from bytes, but requiring it uniformly keeps the public
/// API monomorphic and simple (spec §9's "tagged variant constructor"
/// redesign still applies per-source, independent of this bound).
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}
impl<T> Record for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// How `dryRun` suppresses transport (spec §4.4).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum DryRun {
    #[default]
    Off,
    /// No transport, no response retention; record_count still reflects
    /// work offered.
    Silent,
    /// No transport; a shell-safe curl command string is retained instead.
    Curl,
}

/// The record source, one tagged variant per accepted shape (spec §4.1,
/// §9 redesign note).
pub enum DataSource<R> {
    /// An already-materialized ordered sequence.
    Materialized(Vec<R>),
    /// A single record, treated as a one-element sequence.
    Single(R),
    /// A filesystem path containing a JSON array or newline-delimited JSON.
    Path(PathBuf),
    /// A byte stream of newline-delimited JSON.
    NdjsonReader(Pin<Box<dyn tokio::io::AsyncRead + Send>>),
    /// A stream that already emits parsed records.
    ObjectStream(Pin<Box<dyn Stream<Item = Result<R, Error>> + Send>>),
}

impl<R> DataSource<R> {
    /// Whether the full record set is known up front, which is what makes
    /// `no_batch` collapsible into a single batch (spec §3).
    pub fn is_materializable(&self) -> bool {
        matches!(self, DataSource::Materialized(_) | DataSource::Single(_))
    }
}

/// Outer body wrapper: nests the batch under `data_key` alongside any other
/// top-level fields (spec §4.4).
#[derive(Clone, Debug, Default)]
pub struct BodyParams {
    pub data_key: Option<String>,
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Caller-supplied record transform, invoked once per record by the
/// Batcher (spec §4.2).
pub type Transform<R> = Arc<dyn Fn(R) -> Result<R, String> + Send + Sync>;

/// Invoked with a record that failed transformation, when the default
/// "transform failure aborts the run" behavior is not desired (spec §7).
pub type ErrorHandler<R> = Arc<dyn Fn(&R, &str) + Send + Sync>;

/// Full configuration for one run (spec §6).
pub struct RunConfig<R> {
    pub url: String,
    pub method: Method,
    pub data: DataSource<R>,
    pub batch_size: usize,
    pub no_batch: bool,
    pub concurrency: usize,
    pub max_tasks: usize,
    pub delay_between_requests: Duration,
    pub retry_policy: RetryPolicy,
    pub headers: IndexMap<String, String>,
    pub search_params: IndexMap<String, String>,
    pub body_params: Option<BodyParams>,
    pub transform: Option<Transform<R>>,
    pub transform_preset: Option<Arc<dyn TransformPreset<R>>>,
    pub clone_before_transform: bool,
    pub error_handler: Option<ErrorHandler<R>>,
    pub dry_run: DryRun,
    pub store_responses: bool,
    pub max_response_buffer: usize,
    pub high_water_mark: usize,
    pub enable_connection_pooling: bool,
    pub include_response_headers: bool,
    pub max_memory_usage: Option<u64>,
    pub header_resolver: Option<Arc<dyn Fn() -> IndexMap<String, String> + Send + Sync>>,
    pub multipart_builder: Option<Arc<dyn MultipartBuilder>>,
    pub cookie_jar: Arc<dyn CookieJar>,
    pub output_sink: Option<Arc<dyn OutputSink>>,
}

impl<R: Record> RunConfig<R> {
    pub fn builder(url: impl Into<String>, data: DataSource<R>) -> RunConfigBuilder<R> {
        RunConfigBuilder::new(url, data)
    }
}

/// Builder for [`RunConfig`], one method per spec §6 option row.
pub struct RunConfigBuilder<R> {
    url: String,
    method: Method,
    data: DataSource<R>,
    batch_size: usize,
    no_batch: bool,
    concurrency: usize,
    max_tasks: Option<usize>,
    delay_between_requests: Duration,
    retry_policy: RetryPolicy,
    headers: IndexMap<String, String>,
    search_params: IndexMap<String, String>,
    body_params: Option<BodyParams>,
    transform: Option<Transform<R>>,
    transform_preset: Option<Arc<dyn TransformPreset<R>>>,
    clone_before_transform: bool,
    error_handler: Option<ErrorHandler<R>>,
    dry_run: DryRun,
    store_responses: bool,
    max_response_buffer: usize,
    high_water_mark: usize,
    enable_connection_pooling: bool,
    include_response_headers: bool,
    max_memory_usage: Option<u64>,
    header_resolver: Option<Arc<dyn Fn() -> IndexMap<String, String> + Send + Sync>>,
    multipart_builder: Option<Arc<dyn MultipartBuilder>>,
    cookie_jar: Option<Arc<dyn CookieJar>>,
    output_sink: Option<Arc<dyn OutputSink>>,
}

impl<R: Record> RunConfigBuilder<R> {
    pub fn new(url: impl Into<String>, data: DataSource<R>) -> Self {
        Self {
            url: url.into(),
            method: Method::POST,
            data,
            batch_size: 1,
            no_batch: false,
            concurrency: 10,
            max_tasks: None,
            delay_between_requests: Duration::ZERO,
            retry_policy: RetryPolicy::default(),
            headers: IndexMap::new(),
            search_params: IndexMap::new(),
            body_params: None,
            transform: None,
            transform_preset: None,
            clone_before_transform: false,
            error_handler: None,
            dry_run: DryRun::Off,
            store_responses: true,
            max_response_buffer: 1000,
            high_water_mark: 16 * 1024,
            enable_connection_pooling: true,
            include_response_headers: false,
            max_memory_usage: None,
            header_resolver: None,
            multipart_builder: None,
            cookie_jar: None,
            output_sink: None,
        }
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn no_batch(mut self, enabled: bool) -> Self {
        self.no_batch = enabled;
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.concurrency = n;
        self
    }

    pub fn max_tasks(mut self, n: usize) -> Self {
        self.max_tasks = Some(n);
        self
    }

    pub fn delay_between_requests(mut self, delay: Duration) -> Self {
        self.delay_between_requests = delay;
        self
    }

    pub fn retries(mut self, retries: Retries) -> Self {
        self.retry_policy.retries = retries;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_policy.base_delay = delay;
        self
    }

    pub fn retry_on(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.retry_policy.retry_on = codes.into_iter().collect();
        self
    }

    pub fn use_static_retry_delay(mut self, enabled: bool) -> Self {
        self.retry_policy.static_delay = enabled;
        self
    }

    pub fn retry_predicate(mut self, predicate: RetryPredicate) -> Self {
        self.retry_policy.retry_predicate = Some(predicate);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.retry_policy.timeout = timeout;
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn search_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.search_params.insert(key.into(), value.into());
        self
    }

    pub fn body_params(mut self, params: BodyParams) -> Self {
        self.body_params = Some(params);
        self
    }

    pub fn transform(mut self, transform: Transform<R>) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn transform_preset(mut self, preset: Arc<dyn TransformPreset<R>>) -> Self {
        self.transform_preset = Some(preset);
        self
    }

    pub fn clone_before_transform(mut self, enabled: bool) -> Self {
        self.clone_before_transform = enabled;
        self
    }

    pub fn error_handler(mut self, handler: ErrorHandler<R>) -> Self {
        self.error_handler = Some(handler);
        self
    }

    pub fn dry_run(mut self, mode: DryRun) -> Self {
        self.dry_run = mode;
        self
    }

    pub fn store_responses(mut self, enabled: bool) -> Self {
        self.store_responses = enabled;
        self
    }

    pub fn max_response_buffer(mut self, n: usize) -> Self {
        self.max_response_buffer = n;
        self
    }

    pub fn high_water_mark(mut self, bytes: usize) -> Self {
        self.high_water_mark = bytes;
        self
    }

    pub fn enable_connection_pooling(mut self, enabled: bool) -> Self {
        self.enable_connection_pooling = enabled;
        self
    }

    pub fn include_response_headers(mut self, enabled: bool) -> Self {
        self.include_response_headers = enabled;
        self
    }

    pub fn max_memory_usage(mut self, bytes: u64) -> Self {
        self.max_memory_usage = Some(bytes);
        self
    }

    pub fn header_resolver<F>(mut self, resolver: F) -> Self
    where
        F: Fn() -> IndexMap<String, String> + Send + Sync + 'static,
    {
        self.header_resolver = Some(Arc::new(resolver));
        self
    }

    pub fn multipart_builder(mut self, builder: Arc<dyn MultipartBuilder>) -> Self {
        self.multipart_builder = Some(builder);
        self
    }

    pub fn cookie_jar(mut self, jar: Arc<dyn CookieJar>) -> Self {
        self.cookie_jar = Some(jar);
        self
    }

    pub fn output_sink(mut self, sink: Arc<dyn OutputSink>) -> Self {
        self.output_sink = Some(sink);
        self
    }

    /// Validate and build the final configuration (spec §7.2).
    pub fn build(self) -> Result<RunConfig<R>, Error> {
        if self.url.trim().is_empty() {
            return Err(Error::ConfigurationInvalid("url must not be empty".into()));
        }

        let carries_body = matches!(
            self.method,
            Method::POST | Method::PUT | Method::PATCH | Method::DELETE
        );
        if carries_body {
            let empty = match &self.data {
                DataSource::Materialized(v) => v.is_empty(),
                _ => false,
            };
            if empty {
                return Err(Error::ConfigurationInvalid(
                    "method carries a body but data source is empty".into(),
                ));
            }
        }

        if self.concurrency == 0 {
            return Err(Error::ConfigurationInvalid(
                "concurrency must be at least 1".into(),
            ));
        }

        let max_tasks = self.max_tasks.unwrap_or(self.concurrency + 15);
        if max_tasks == 0 {
            return Err(Error::ConfigurationInvalid(
                "max_tasks must be at least 1".into(),
            ));
        }

        #[cfg(feature = "tracing")]
        if self.max_response_buffer > 0 && !self.store_responses {
            tracing::debug!(
                max_response_buffer = self.max_response_buffer,
                "max_response_buffer set but store_responses is false; buffer is unused"
            );
        }

        Ok(RunConfig {
            url: self.url,
            method: self.method,
            data: self.data,
            batch_size: self.batch_size,
            no_batch: self.no_batch,
            concurrency: self.concurrency,
            max_tasks,
            delay_between_requests: self.delay_between_requests,
            retry_policy: self.retry_policy,
            headers: self.headers,
            search_params: self.search_params,
            body_params: self.body_params,
            transform: self.transform,
            transform_preset: self.transform_preset,
            clone_before_transform: self.clone_before_transform,
            error_handler: self.error_handler,
            dry_run: self.dry_run,
            store_responses: self.store_responses,
            max_response_buffer: self.max_response_buffer,
            high_water_mark: self.high_water_mark,
            enable_connection_pooling: self.enable_connection_pooling,
            include_response_headers: self.include_response_headers,
            max_memory_usage: self.max_memory_usage,
            header_resolver: self.header_resolver,
            multipart_builder: self.multipart_builder,
            cookie_jar: self.cookie_jar.unwrap_or_else(|| Arc::new(NoopCookieJar)),
            output_sink: self.output_sink,
        })
    }
}

/// Default retry-eligible status codes, re-exported for convenience.
pub fn default_retry_statuses() -> std::collections::HashSet<u16> {
    default_retry_on()
}
