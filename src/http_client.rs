//! HTTP Client + Retry Engine (spec §4.4): request construction, transport,
//! outcome classification, and response body parsing. The retry state
//! machine itself lives in [`crate::retry`]; this module drives it.

use std::sync::OnceLock;
use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::Mutex;
use reqwest::Method;
use serde::Serialize;
use std::collections::HashMap;

use crate::config::{BodyParams, DryRun, RunConfig};
use crate::dispatcher::Cancellation;
use crate::error::Error;
use crate::result::{HttpResponse, ResponseData};
use crate::retry::{Outcome, Retries};

/// Delegated multipart/form-data body construction (spec §6's "multipart
/// builder" external collaborator). Operates at the `RequestBuilder` level
/// because `reqwest`'s multipart support is expressed that way; the
/// boundary-bearing `Content-Type` this produces overrides whatever the
/// core set (spec §4.4 step 3).
pub trait MultipartBuilder: Send + Sync {
    fn apply(&self, request: reqwest::RequestBuilder, batch: &serde_json::Value) -> reqwest::RequestBuilder;
}

/// Wraps the batch as a single `data` field multipart form.
pub struct DefaultMultipartBuilder;

impl MultipartBuilder for DefaultMultipartBuilder {
    fn apply(&self, request: reqwest::RequestBuilder, batch: &serde_json::Value) -> reqwest::RequestBuilder {
        let form = reqwest::multipart::Form::new().text("data", batch.to_string());
        request.multipart(form)
    }
}

/// Observes `Set-Cookie` on responses and supplies `Cookie` headers on
/// subsequent requests to matching origins (spec §6's "cookie jar"
/// external collaborator).
pub trait CookieJar: Send + Sync {
    fn headers_for(&self, origin: &str) -> Vec<String>;
    fn observe(&self, origin: &str, set_cookie: &[String]);
}

/// The default: does not track or inject any cookies.
pub struct NoopCookieJar;

impl CookieJar for NoopCookieJar {
    fn headers_for(&self, _origin: &str) -> Vec<String> {
        Vec::new()
    }
    fn observe(&self, _origin: &str, _set_cookie: &[String]) {}
}

/// A simple in-memory cookie jar, keyed by origin (`scheme://host`).
#[derive(Default)]
pub struct InMemoryCookieJar {
    by_origin: Mutex<HashMap<String, Vec<String>>>,
}

impl CookieJar for InMemoryCookieJar {
    fn headers_for(&self, origin: &str) -> Vec<String> {
        self.by_origin.lock().get(origin).cloned().unwrap_or_default()
    }

    fn observe(&self, origin: &str, set_cookie: &[String]) {
        if set_cookie.is_empty() {
            return;
        }
        self.by_origin
            .lock()
            .entry(origin.to_string())
            .or_default()
            .extend(set_cookie.iter().cloned());
    }
}

fn origin_of(url: &str) -> String {
    reqwest::Url::parse(url)
        .map(|u| format!("{}://{}", u.scheme(), u.host_str().unwrap_or("")))
        .unwrap_or_default()
}

/// Process-wide connection pool state (spec §9's "global shared connection
/// pool"), created lazily on first use.
static SHARED_CLIENT: OnceLock<reqwest::Client> = OnceLock::new();

/// Pool parameters (spec §4.4): 256 max idle sockets, 30s idle timeout.
fn build_pooled_client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(256)
        .pool_idle_timeout(Duration::from_secs(30))
        .build()
        .expect("failed to build the shared HTTP client")
}

fn shared_client() -> reqwest::Client {
    SHARED_CLIENT.get_or_init(build_pooled_client).clone()
}

/// Tear down and forget the shared client. Mainly useful for test
/// isolation between runs in the same process; a fresh client is built
/// lazily on next use.
///
/// `OnceLock` offers no reset primitive, so this is a best-effort no-op
/// beyond documenting the intended lifecycle boundary — a future run that
/// needs a genuinely fresh pool should use `enable_connection_pooling =
/// false` instead.
pub fn reset_shared_client() {
    #[cfg(feature = "tracing")]
    tracing::debug!("reset_shared_client called; shared pool is reused for process lifetime");
}

fn fresh_unpooled_client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .build()
        .expect("failed to build an unpooled HTTP client")
}

/// Builds and executes one HTTP attempt for a batch, classifying the
/// outcome per spec §4.4.
pub struct HttpExecutor<R> {
    client_pooled: reqwest::Client,
    config: std::sync::Arc<RunConfig<R>>,
    resolved_headers: IndexMap<String, String>,
}

impl<R: Serialize> HttpExecutor<R> {
    pub fn new(config: std::sync::Arc<RunConfig<R>>) -> Self {
        let mut resolved_headers = config.headers.clone();
        if let Some(resolver) = &config.header_resolver {
            for (k, v) in resolver() {
                resolved_headers.insert(k, v);
            }
        }

        Self {
            client_pooled: shared_client(),
            config,
            resolved_headers,
        }
    }

    fn client(&self) -> reqwest::Client {
        if self.config.enable_connection_pooling {
            self.client_pooled.clone()
        } else {
            fresh_unpooled_client()
        }
    }

    /// One attempt: build the request, send it (racing cancellation and
    /// the configured timeout), and classify the outcome.
    pub async fn attempt(
        &self,
        batch_json: &serde_json::Value,
        cancel: &Cancellation,
    ) -> Result<Attempt, Error> {
        let carries_body = matches!(
            self.config.method,
            Method::POST | Method::PUT | Method::PATCH | Method::DELETE
        );

        let url = build_url(&self.config.url, &self.config.search_params);
        let content_type = self.content_type(carries_body);

        #[cfg(feature = "tracing")]
        tracing::debug!(method = %self.config.method, url = %url, "issuing attempt");

        let mut request = self.client().request(self.config.method.clone(), url.as_str());
        request = request.header(
            reqwest::header::USER_AGENT,
            self.resolved_headers
                .get("User-Agent")
                .cloned()
                .unwrap_or_else(|| format!("bulkhttp/{}", env!("CARGO_PKG_VERSION"))),
        );
        for (k, v) in &self.resolved_headers {
            if k.eq_ignore_ascii_case("user-agent") {
                continue;
            }
            // Body-bearing requests set Content-Type below, alongside the
            // body itself (or let the multipart builder set its own
            // boundary-bearing value) — skip it here to avoid a duplicate.
            if carries_body && k.eq_ignore_ascii_case("content-type") {
                continue;
            }
            request = request.header(k.as_str(), v.as_str());
        }

        for cookie in self.config.cookie_jar.headers_for(&origin_of(&self.config.url)) {
            request = request.header(reqwest::header::COOKIE, cookie);
        }

        let mut body_bytes = None;
        if carries_body {
            if content_type.starts_with("multipart/form-data") {
                let builder = self
                    .config
                    .multipart_builder
                    .clone()
                    .unwrap_or_else(|| std::sync::Arc::new(DefaultMultipartBuilder));
                request = builder.apply(request, batch_json);
            } else {
                let (bytes, effective_ct) = build_body(&content_type, batch_json, &self.config.body_params);
                request = request.header(reqwest::header::CONTENT_TYPE, effective_ct);
                body_bytes = Some(bytes.clone());
                request = request.body(bytes);
            }
        }

        if matches!(self.config.dry_run, DryRun::Curl) {
            let curl = render_curl(
                self.config.method.as_str(),
                &url,
                &self.resolved_headers,
                body_bytes.as_deref(),
            );
            return Ok(Attempt::CurlDryRun(curl));
        }

        if matches!(self.config.retry_policy.retries, Retries::FireAndForget) {
            // Issue the request without awaiting its outcome (spec §4.4):
            // the socket is drained on a detached task so the connection
            // isn't reset, but no response or error is ever observed here.
            tokio::spawn(async move {
                let _ = request.send().await;
            });
            return Ok(Attempt::FireAndForget);
        }

        let timeout = self.config.retry_policy.timeout;
        let send_fut = request.send();

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(Attempt::Cancelled),
            result = tokio::time::timeout(timeout, send_fut) => result,
        };

        let response = match outcome {
            Err(_elapsed) => {
                return Ok(Attempt::Classified {
                    outcome: Outcome::Timeout,
                    source: None,
                    body: None,
                })
            }
            Ok(Err(err)) => {
                let classified = classify_transport_error(&err);
                return Ok(Attempt::Classified {
                    outcome: classified,
                    source: Some(err),
                    body: None,
                });
            }
            Ok(Ok(resp)) => resp,
        };

        let status = response.status().as_u16();
        let status_text = response
            .status()
            .canonical_reason()
            .unwrap_or("")
            .to_string();
        let set_cookie: Vec<String> = response
            .headers()
            .get_all(reqwest::header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok().map(str::to_string))
            .collect();
        self.config
            .cookie_jar
            .observe(&origin_of(&self.config.url), &set_cookie);

        let retry_after = if status == 429 {
            response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs)
        } else {
            None
        };

        let outcome = Outcome::from_status(status, &self.config.retry_policy.retry_on, retry_after);

        let response_headers = if self.config.include_response_headers {
            Some(
                response
                    .headers()
                    .iter()
                    .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
                    .collect::<IndexMap<_, _>>(),
            )
        } else {
            None
        };

        let content_type_header = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        match outcome {
            Outcome::Ok => {
                let body = response.bytes().await.map_err(Error::from)?;
                let data = parse_response_body(&body, &content_type_header, status, &status_text, response_headers.as_ref());
                Ok(Attempt::Success(HttpResponse {
                    data,
                    status,
                    status_text,
                    url,
                    method: self.config.method.to_string(),
                    headers: response_headers,
                }))
            }
            Outcome::Permanent { status } => {
                let body = response.text().await.unwrap_or_default();
                Ok(Attempt::Classified {
                    outcome: Outcome::Permanent { status },
                    source: None,
                    body: Some(body),
                })
            }
            other => Ok(Attempt::Classified {
                outcome: other,
                source: None,
                body: None,
            }),
        }
    }

    fn content_type(&self, carries_body: bool) -> String {
        if let Some(ct) = self.resolved_headers.get("Content-Type") {
            return ct.clone();
        }
        if carries_body {
            "application/json".to_string()
        } else {
            String::new()
        }
    }
}

/// The outcome of one attempt, as far as the worker loop needs to know.
pub enum Attempt {
    Success(HttpResponse),
    Classified {
        outcome: Outcome,
        source: Option<reqwest::Error>,
        body: Option<String>,
    },
    CurlDryRun(String),
    /// Dispatched without awaiting the response (spec §4.4 fire-and-forget);
    /// terminal OK, no retained response, no error.
    FireAndForget,
    Cancelled,
}

fn classify_transport_error(err: &reqwest::Error) -> Outcome {
    if err.is_timeout() {
        return Outcome::Timeout;
    }
    let chain = format!("{err:?}").to_lowercase();
    if chain.contains("certificate") || chain.contains("tls") || chain.contains("ssl") {
        Outcome::Tls
    } else {
        Outcome::Network
    }
}

fn build_url(base: &str, search_params: &IndexMap<String, String>) -> String {
    if search_params.is_empty() {
        return base.to_string();
    }
    let mut url = reqwest::Url::parse(base).unwrap_or_else(|_| {
        reqwest::Url::parse("http://invalid.invalid").expect("static URL always parses")
    });
    let existing: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    let mut merged: IndexMap<String, String> = existing.into_iter().collect();
    for (k, v) in search_params {
        merged.insert(k.clone(), v.clone());
    }
    {
        let mut pairs = url.query_pairs_mut();
        pairs.clear();
        for (k, v) in &merged {
            pairs.append_pair(k, v);
        }
    }
    url.to_string()
}

/// Build the request body per spec §4.4 step 3. Returns `(bytes,
/// effective_content_type)`.
fn build_body(
    content_type: &str,
    batch_json: &serde_json::Value,
    body_params: &Option<BodyParams>,
) -> (Vec<u8>, String) {
    let ct_lower = content_type.to_ascii_lowercase();

    if ct_lower.starts_with("application/x-www-form-urlencoded") {
        let mut fields: IndexMap<String, String> = IndexMap::new();
        match body_params {
            Some(BodyParams { data_key: Some(key), extra }) => {
                fields.insert(key.clone(), batch_json.to_string());
                for (k, v) in extra {
                    fields.insert(k.clone(), value_to_form_string(v));
                }
            }
            Some(BodyParams { data_key: None, extra }) => {
                fields.insert("data".to_string(), batch_json.to_string());
                for (k, v) in extra {
                    fields.insert(k.clone(), value_to_form_string(v));
                }
            }
            None => {
                fields.insert("data".to_string(), batch_json.to_string());
            }
        }
        let encoded = serde_urlencoded_like(&fields);
        return (encoded.into_bytes(), content_type.to_string());
    }

    // Default: application/json.
    let body_value = match body_params {
        Some(BodyParams {
            data_key: Some(key),
            extra,
        }) => {
            let mut map = extra.clone();
            map.insert(key.clone(), batch_json.clone());
            serde_json::Value::Object(map)
        }
        _ => batch_json.clone(),
    };

    (body_value.to_string().into_bytes(), content_type.to_string())
}

fn value_to_form_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn serde_urlencoded_like(fields: &IndexMap<String, String>) -> String {
    fields
        .iter()
        .map(|(k, v)| format!("{}={}", url_encode(k), url_encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

fn url_encode(s: &str) -> String {
    urlencoding::encode(s).into_owned()
}

/// Response body parsing (spec §4.4): JSON if the content type says so,
/// text for textual types, raw bytes otherwise. Empty (or the single byte
/// `0`) synthesizes a metadata object instead.
fn parse_response_body(
    body: &bytes::Bytes,
    content_type: &str,
    status: u16,
    status_text: &str,
    headers: Option<&IndexMap<String, String>>,
) -> ResponseData {
    if body.is_empty() || body.as_ref() == [b'0'] {
        let mut obj = serde_json::Map::new();
        obj.insert("status".into(), serde_json::json!(status));
        obj.insert("statusText".into(), serde_json::json!(status_text));
        if let Some(headers) = headers {
            for (k, v) in headers {
                obj.insert(k.clone(), serde_json::json!(v));
            }
        }
        return ResponseData::Json(serde_json::Value::Object(obj));
    }

    let ct = content_type.to_ascii_lowercase();
    if ct.contains("json") {
        match serde_json::from_slice::<serde_json::Value>(body) {
            Ok(value) => return ResponseData::Json(value),
            Err(_) => {
                if let Ok(text) = std::str::from_utf8(body) {
                    return ResponseData::Text(text.to_string());
                }
            }
        }
    } else if ct.starts_with("text/")
        || ct.contains("xml")
        || ct.contains("urlencoded")
        || ct.is_empty()
    {
        if let Ok(text) = std::str::from_utf8(body) {
            return ResponseData::Text(text.to_string());
        }
    }

    ResponseData::Bytes(body.clone())
}

/// Render a shell-safe single-line curl command reproducing this request
/// (spec §9's resolved Open Question: single quotes in the body are
/// escaped as `'\''`).
fn render_curl(method: &str, url: &str, headers: &IndexMap<String, String>, body: Option<&[u8]>) -> String {
    let mut out = format!("curl -X {method} \"{url}\"");
    for (k, v) in headers {
        out.push_str(&format!(" \\\n  -H \"{}: {}\"", k, v.replace('"', "\\\"")));
    }
    if let Some(body) = body {
        let body_str = String::from_utf8_lossy(body);
        let escaped = body_str.replace('\'', "'\\''");
        out.push_str(&format!(" \\\n  -d '{escaped}'"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn curl_render_contains_method_url_header_and_body() {
        let mut headers = IndexMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        let body = br#"{"id":1,"name":"Test"}"#;
        let curl = render_curl("POST", "https://example.com/ingest", &headers, Some(body));

        assert!(curl.contains("-X POST"));
        assert!(curl.contains("https://example.com/ingest"));
        assert!(curl.contains("Content-Type: application/json"));
        assert!(curl.contains(r#"{"id":1,"name":"Test"}"#));
    }

    #[test]
    fn url_encode_escapes_reserved_bytes() {
        assert_eq!(url_encode("a b=c"), "a%20b%3Dc");
    }

    #[test]
    fn parse_body_synthesizes_metadata_on_empty_body() {
        let data = parse_response_body(&bytes::Bytes::new(), "application/json", 204, "No Content", None);
        match data {
            ResponseData::Json(v) => assert_eq!(v["status"], 204),
            _ => panic!("expected synthesized JSON"),
        }
    }

    #[test]
    fn build_url_merges_search_params_last_write_wins() {
        let mut params = IndexMap::new();
        params.insert("a".to_string(), "1".to_string());
        params.insert("a".to_string(), "2".to_string());
        let url = build_url("https://example.com/x", &params);
        assert!(url.contains("a=2"));
        assert!(!url.contains("a=1"));
    }
}
