//! End-to-end delivery scenarios against a mock HTTP server (spec §8).

use std::time::Duration;

use bulkhttp::{DataSource, DryRun, Error, Retries, RunConfig, RunConfigBuilder};
use serde::{Deserialize, Serialize};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct Record {
    id: u32,
}

fn records(n: u32) -> Vec<Record> {
    (0..n).map(|id| Record { id }).collect()
}

fn builder(url: &str, data: Vec<Record>) -> RunConfigBuilder<Record> {
    RunConfig::builder(url, DataSource::Materialized(data))
}

#[tokio::test]
async fn batches_ten_records_into_four_requests_of_size_three() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/ingest"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
        .expect(4)
        .mount(&server)
        .await;

    let config = builder(&format!("{}/ingest", server.uri()), records(10))
        .batch_size(3)
        .concurrency(4)
        .retries(Retries::Bounded(0))
        .build()
        .unwrap();

    let summary = bulkhttp::run(config).await.unwrap();

    assert_eq!(summary.record_count, 10);
    assert_eq!(summary.request_count, 4);
    assert_eq!(summary.error_count, 0);
}

#[tokio::test]
async fn transient_failures_are_retried_then_succeed() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/ingest"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/ingest"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
        .mount(&server)
        .await;

    let config = builder(&format!("{}/ingest", server.uri()), records(1))
        .no_batch(true)
        .retries(Retries::Bounded(5))
        .retry_delay(Duration::from_millis(5))
        .build()
        .unwrap();

    let summary = bulkhttp::run(config).await.unwrap();

    assert_eq!(summary.request_count, 1);
    assert_eq!(summary.error_count, 0);
}

#[tokio::test]
async fn permanent_failure_is_not_retried_and_counts_as_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/ingest"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
        .expect(1)
        .mount(&server)
        .await;

    let config = builder(&format!("{}/ingest", server.uri()), records(1))
        .no_batch(true)
        .retries(Retries::Bounded(5))
        .build()
        .unwrap();

    let summary = bulkhttp::run(config).await.unwrap();

    assert_eq!(summary.request_count, 1);
    assert_eq!(summary.error_count, 1);
}

#[tokio::test]
async fn rate_limit_retry_after_is_honored_then_succeeds() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/ingest"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "1"))
        .up_to_n_times(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/ingest"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
        .mount(&server)
        .await;

    let config = builder(&format!("{}/ingest", server.uri()), records(1))
        .no_batch(true)
        .retries(Retries::Bounded(3))
        .build()
        .unwrap();

    let start = std::time::Instant::now();
    let summary = bulkhttp::run(config).await.unwrap();

    assert_eq!(summary.request_count, 1);
    assert_eq!(summary.error_count, 0);
    assert!(start.elapsed() >= Duration::from_millis(900));
}

#[tokio::test]
async fn fire_and_forget_does_not_await_the_response() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/ingest"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(10)))
        .mount(&server)
        .await;

    let config = builder(&format!("{}/ingest", server.uri()), records(1))
        .no_batch(true)
        .retries(Retries::FireAndForget)
        .build()
        .unwrap();

    let summary = tokio::time::timeout(Duration::from_secs(2), bulkhttp::run(config))
        .await
        .expect("fire-and-forget must not wait for the slow response")
        .unwrap();

    assert_eq!(summary.request_count, 1);
    assert_eq!(summary.error_count, 0);
}

#[tokio::test]
async fn curl_dry_run_retains_a_shell_safe_command_without_sending_requests() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/ingest"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let config = builder(&format!("{}/ingest", server.uri()), records(2))
        .no_batch(true)
        .dry_run(DryRun::Curl)
        .build()
        .unwrap();

    let summary = bulkhttp::run(config).await.unwrap();

    assert_eq!(summary.responses.len(), 1);
    match &summary.responses[0] {
        bulkhttp::ResponseEntry::Curl(command) => {
            assert!(command.starts_with("curl -X POST"));
            assert!(command.contains(&server.uri()));
        }
        other => panic!("expected a curl entry, got {other:?}"),
    }
}

#[tokio::test]
async fn silent_dry_run_counts_requests_without_sending_or_retaining() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/ingest"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let config = builder(&format!("{}/ingest", server.uri()), records(3))
        .batch_size(1)
        .dry_run(DryRun::Silent)
        .build()
        .unwrap();

    let summary = bulkhttp::run(config).await.unwrap();

    assert_eq!(summary.record_count, 3);
    assert_eq!(summary.request_count, 3);
    assert!(summary.responses.is_empty());
}

#[tokio::test]
async fn configuration_invalid_url_is_rejected_before_any_run() {
    let err = RunConfig::<Record>::builder("", DataSource::Materialized(records(1)))
        .build()
        .unwrap_err();
    assert!(matches!(err, Error::ConfigurationInvalid(_)));
}
