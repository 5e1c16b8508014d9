/*
 * swiftfetch - High-throughput multi-protocol transfer engine.
 * Copyright (C) 2025  swiftfetch contributors
 */

//! Shared fixtures for the HTTP end-to-end tests.
#![allow(dead_code)]

use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wiremock::{Request, Respond, ResponseTemplate};

use swiftfetch::engine::retry::RetryCategory;
use swiftfetch::events::{ConcurrencyReason, EventSink};

/// Deterministic pseudo-random body of `len` bytes.
pub fn test_body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i.wrapping_mul(31).wrapping_add(7) % 251) as u8).collect()
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Range-aware responder backing a mock origin.
///
/// HEAD is mounted separately as 405, so probes go through the 1-byte
/// range fallback and land here.
pub struct RangeOrigin {
    body: Vec<u8>,
    etag: Option<String>,
    /// Serve 200 with the full body even when a Range header is present.
    ignore_ranges: bool,
    /// Answer the first data range (more than one byte) with 429 once.
    throttle_once: AtomicBool,
    /// Count of data-range requests served (probe ranges excluded).
    pub data_ranges: AtomicUsize,
    /// Smallest data-range start offset observed.
    pub min_range_start: AtomicUsize,
}

impl RangeOrigin {
    pub fn new(body: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            body,
            etag: Some("\"v1\"".to_string()),
            ignore_ranges: false,
            throttle_once: AtomicBool::new(false),
            data_ranges: AtomicUsize::new(0),
            min_range_start: AtomicUsize::new(usize::MAX),
        })
    }

    pub fn without_ranges(body: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            body,
            etag: Some("\"v1\"".to_string()),
            ignore_ranges: true,
            throttle_once: AtomicBool::new(false),
            data_ranges: AtomicUsize::new(0),
            min_range_start: AtomicUsize::new(usize::MAX),
        })
    }

    pub fn throttling_once(body: Vec<u8>) -> Arc<Self> {
        let origin = Self {
            body,
            etag: Some("\"v1\"".to_string()),
            ignore_ranges: false,
            throttle_once: AtomicBool::new(true),
            data_ranges: AtomicUsize::new(0),
            min_range_start: AtomicUsize::new(usize::MAX),
        };
        Arc::new(origin)
    }

    fn full_response(&self) -> ResponseTemplate {
        let mut resp = ResponseTemplate::new(200)
            .insert_header("accept-ranges", if self.ignore_ranges { "none" } else { "bytes" })
            .set_body_bytes(self.body.clone());
        if let Some(etag) = &self.etag {
            resp = resp.insert_header("etag", etag.as_str());
        }
        resp
    }
}

/// Mountable face of a shared [`RangeOrigin`], so tests can keep a handle
/// to the counters after the mock server takes ownership of the responder.
pub struct ServeOrigin(pub Arc<RangeOrigin>);

impl Respond for ServeOrigin {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        self.0.respond(request)
    }
}

impl RangeOrigin {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let range = request
            .headers
            .get("range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_range);

        let Some((start, end)) = range else {
            return self.full_response();
        };

        if self.ignore_ranges || self.body.is_empty() {
            return self.full_response();
        }

        let end = end.min(self.body.len() - 1);
        let is_probe = end - start <= 1 && start == 0;

        if !is_probe {
            self.data_ranges.fetch_add(1, Ordering::SeqCst);
            self.min_range_start.fetch_min(start, Ordering::SeqCst);

            if self.throttle_once.swap(false, Ordering::SeqCst) {
                return ResponseTemplate::new(429)
                    .insert_header("retry-after", "1")
                    .set_delay(Duration::from_millis(10));
            }
        }

        let mut resp = ResponseTemplate::new(206)
            .insert_header(
                "content-range",
                format!("bytes {start}-{end}/{}", self.body.len()).as_str(),
            )
            .insert_header("accept-ranges", "bytes")
            .set_body_bytes(self.body[start..=end].to_vec());
        if let Some(etag) = &self.etag {
            resp = resp.insert_header("etag", etag.as_str());
        }
        resp
    }
}

fn parse_range(value: &str) -> Option<(usize, usize)> {
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

/// Event sink that records what the engine reported.
#[derive(Default)]
pub struct RecordingSink {
    pub throttle_targets: Mutex<Vec<usize>>,
    pub retries: Mutex<Vec<(RetryCategory, Duration, u32)>>,
    pub max_concurrency_seen: AtomicUsize,
}

impl EventSink for RecordingSink {
    fn on_concurrency_changed(&self, target: usize, reason: ConcurrencyReason) {
        self.max_concurrency_seen.fetch_max(target, Ordering::SeqCst);
        if reason == ConcurrencyReason::Throttle {
            self.throttle_targets.lock().unwrap().push(target);
        }
    }

    fn on_retry(&self, category: RetryCategory, delay: Duration, attempt: u32) {
        self.retries.lock().unwrap().push((category, delay, attempt));
    }
}
