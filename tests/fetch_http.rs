/*
 * swiftfetch - High-throughput multi-protocol transfer engine.
 * Copyright (C) 2025  swiftfetch contributors
 */

//! End-to-end HTTP fetch scenarios against a mock origin.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{sha256_hex, test_body, RangeOrigin, RecordingSink, ServeOrigin};
use swiftfetch::engine::integrity::EMPTY_SHA256;
use swiftfetch::engine::plan::{FetchPlan, PartialMeta, Validators};
use swiftfetch::{ErrorKind, FetchController, FetchRequest, NullSink};

const MIB: usize = 1024 * 1024;

/// Mount an origin whose HEAD is blocked, so probes use the range
/// fallback, and whose GET goes through the fixture.
async fn start_origin(origin: Arc<RangeOrigin>) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(405))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ServeOrigin(origin))
        .mount(&server)
        .await;
    server
}

fn request_for(server: &MockServer, output: &std::path::Path) -> FetchRequest {
    let mut request = FetchRequest::new(format!("{}/file.bin", server.uri()));
    request.output = Some(output.to_path_buf());
    request.max_connections = 8;
    // Small chunks so a 1 MiB object exercises real parallelism.
    request.min_chunk = 64 * 1024;
    request.max_chunk = 256 * 1024;
    request
}

#[tokio::test]
async fn parallel_fetch_verifies_and_lands_every_byte() {
    let body = test_body(MIB);
    let expected_sha = sha256_hex(&body);
    let origin = RangeOrigin::new(body.clone());
    let server = start_origin(origin.clone()).await;

    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("file.bin");
    let mut request = request_for(&server, &output);
    request.expected_sha256 = Some(expected_sha.clone());

    let controller = FetchController::new(Arc::new(NullSink), CancellationToken::new());
    let report = controller.fetch(request).await.expect("fetch should succeed");

    assert_eq!(report.bytes, MIB as u64);
    assert_eq!(report.sha256, expected_sha);
    assert!(report.connections_used >= 1 && report.connections_used <= 8);
    assert!(
        origin.data_ranges.load(Ordering::SeqCst) >= 2,
        "a 1 MiB object with 256 KiB chunks must use several ranges"
    );

    let on_disk = std::fs::read(&output).unwrap();
    assert_eq!(on_disk, body);
    assert_eq!(sha256_hex(&on_disk), expected_sha);

    // No leftovers after finalize.
    assert!(!FetchPlan::partial_path_for(&output).exists());
    assert!(!FetchPlan::meta_path_for(&output).exists());
}

#[tokio::test]
async fn wrong_expected_hash_fails_and_removes_partial() {
    let body = test_body(MIB);
    let origin = RangeOrigin::new(body);
    let server = start_origin(origin).await;

    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("file.bin");
    let mut request = request_for(&server, &output);
    request.expected_sha256 = Some("0".repeat(64));

    let controller = FetchController::new(Arc::new(NullSink), CancellationToken::new());
    let failure = controller.fetch(request).await.expect_err("hash must not match");

    assert_eq!(failure.kind, ErrorKind::IntegrityMismatch);
    assert!(!failure.can_resume);
    assert!(!output.exists(), "target path must not appear");
    assert!(!FetchPlan::partial_path_for(&output).exists());
    assert!(!FetchPlan::meta_path_for(&output).exists());
}

#[tokio::test]
async fn server_without_ranges_degrades_to_single_stream() {
    let body = test_body(MIB);
    let expected_sha = sha256_hex(&body);
    let origin = RangeOrigin::without_ranges(body.clone());
    let server = start_origin(origin.clone()).await;

    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("file.bin");
    let request = request_for(&server, &output);

    let controller = FetchController::new(Arc::new(NullSink), CancellationToken::new());
    let report = controller.fetch(request).await.expect("fetch should succeed");

    assert_eq!(report.bytes, MIB as u64);
    assert_eq!(report.sha256, expected_sha);
    assert_eq!(report.connections_used, 1, "single stream uses one connection");
    assert_eq!(
        origin.data_ranges.load(Ordering::SeqCst),
        0,
        "no data ranges on a range-less server"
    );
    assert_eq!(std::fs::read(&output).unwrap(), body);
}

#[tokio::test]
async fn resume_continues_from_partial_and_matches_full_fetch() {
    let body = test_body(MIB);
    let expected_sha = sha256_hex(&body);
    let origin = RangeOrigin::new(body.clone());
    let server = start_origin(origin.clone()).await;

    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("file.bin");
    let resume_offset = MIB / 2;

    // Seed an interrupted transfer: half the body plus matching metadata.
    std::fs::write(FetchPlan::partial_path_for(&output), &body[..resume_offset]).unwrap();
    PartialMeta::new(
        &format!("{}/file.bin", server.uri()),
        MIB as u64,
        Validators {
            etag: Some("\"v1\"".to_string()),
            last_modified: None,
        },
        256 * 1024,
    )
    .store(&FetchPlan::meta_path_for(&output))
    .unwrap();

    let request = request_for(&server, &output);
    let controller = FetchController::new(Arc::new(NullSink), CancellationToken::new());
    let report = controller.fetch(request).await.expect("resume should succeed");

    assert!(report.resumed);
    assert_eq!(report.bytes, MIB as u64);
    assert_eq!(report.sha256, expected_sha);
    assert_eq!(
        std::fs::read(&output).unwrap(),
        body,
        "resumed file must be bit-identical to an uninterrupted fetch"
    );
    assert!(
        origin.min_range_start.load(Ordering::SeqCst) >= resume_offset,
        "no data may be re-fetched below the resume offset"
    );
}

#[tokio::test]
async fn stale_validators_restart_from_scratch() {
    let body = test_body(MIB);
    let origin = RangeOrigin::new(body.clone());
    let server = start_origin(origin.clone()).await;

    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("file.bin");

    // Partial recorded against a different entity version.
    std::fs::write(FetchPlan::partial_path_for(&output), &body[..1024]).unwrap();
    PartialMeta::new(
        &format!("{}/file.bin", server.uri()),
        MIB as u64,
        Validators {
            etag: Some("\"stale\"".to_string()),
            last_modified: None,
        },
        256 * 1024,
    )
    .store(&FetchPlan::meta_path_for(&output))
    .unwrap();

    let request = request_for(&server, &output);
    let controller = FetchController::new(Arc::new(NullSink), CancellationToken::new());
    let report = controller.fetch(request).await.expect("fetch should succeed");

    assert!(!report.resumed, "mismatched validators must not resume");
    assert_eq!(std::fs::read(&output).unwrap(), body);
    assert_eq!(origin.min_range_start.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn throttle_halves_concurrency_and_fetch_still_succeeds() {
    let body = test_body(MIB);
    let expected_sha = sha256_hex(&body);
    let origin = RangeOrigin::throttling_once(body.clone());
    let server = start_origin(origin.clone()).await;

    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("file.bin");
    let request = request_for(&server, &output);

    let sink = Arc::new(RecordingSink::default());
    let controller = FetchController::new(sink.clone(), CancellationToken::new());
    let started = Instant::now();
    let report = controller.fetch(request).await.expect("fetch should succeed");

    assert_eq!(report.sha256, expected_sha);
    assert_eq!(std::fs::read(&output).unwrap(), body);

    let throttles = sink.throttle_targets.lock().unwrap().clone();
    assert_eq!(throttles, vec![4], "a 429 must halve the target of 8");

    let retries = sink.retries.lock().unwrap().clone();
    assert!(!retries.is_empty(), "the throttled chunk must be retried");
    let (_, delay, _) = retries[0];
    assert_eq!(delay, Duration::from_secs(1), "Retry-After: 1 must be honored");
    assert!(
        started.elapsed() >= Duration::from_secs(1),
        "the retry must actually wait out the Retry-After"
    );
}

#[tokio::test]
async fn empty_object_succeeds_without_scheduler_activity() {
    let origin = RangeOrigin::new(Vec::new());
    let server = start_origin(origin.clone()).await;

    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("empty.bin");
    let request = request_for(&server, &output);

    let controller = FetchController::new(Arc::new(NullSink), CancellationToken::new());
    let report = controller.fetch(request).await.expect("fetch should succeed");

    assert_eq!(report.bytes, 0);
    assert_eq!(report.sha256, EMPTY_SHA256);
    assert_eq!(report.connections_used, 0);
    assert_eq!(origin.data_ranges.load(Ordering::SeqCst), 0);
    assert_eq!(std::fs::read(&output).unwrap(), Vec::<u8>::new());
}

#[tokio::test]
async fn second_fetch_is_idempotent() {
    let body = test_body(256 * 1024);
    let origin = RangeOrigin::new(body.clone());
    let server = start_origin(origin).await;

    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("file.bin");

    let controller = FetchController::new(Arc::new(NullSink), CancellationToken::new());
    let first = controller
        .fetch(request_for(&server, &output))
        .await
        .expect("first fetch");
    let second = controller
        .fetch(request_for(&server, &output))
        .await
        .expect("second fetch");

    assert_eq!(first.sha256, second.sha256);
    assert_eq!(std::fs::read(&output).unwrap(), body);
}

#[tokio::test]
async fn probe_failure_is_fatal_with_no_partial() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("missing.bin");
    let mut request = FetchRequest::new(format!("{}/missing.bin", server.uri()));
    request.output = Some(output.clone());

    let controller = FetchController::new(Arc::new(NullSink), CancellationToken::new());
    let failure = controller.fetch(request).await.expect_err("404 must fail");

    assert_eq!(failure.partial_bytes, 0);
    assert!(!failure.can_resume);
    assert!(!output.exists());
}
