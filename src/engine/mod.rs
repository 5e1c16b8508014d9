/*
 * swiftfetch - High-throughput multi-protocol transfer engine.
 * Copyright (C) 2025  swiftfetch contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 */

//! Adaptive parallel transfer engine.
//!
//! The fetch controller probes the target, plans the transfer, drives
//! ranged chunks across a dynamically sized connection pool, verifies
//! integrity incrementally, and finalizes atomically with crash-safe
//! resume.

pub mod bandwidth;
pub mod chunk;
pub mod chunker;
pub mod controller;
pub mod integrity;
pub mod optimizer;
pub mod plan;
pub mod retry;
pub mod scheduler;

pub use controller::FetchController;

use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::Config;
use crate::error::ErrorKind;

/// A fetch request as handed to the controller.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// One URL for a plain fetch, several for mirror selection.
    pub urls: Vec<String>,
    /// Output path; inferred from the URL when absent.
    pub output: Option<PathBuf>,
    /// Stream the body to stdout instead of a file.
    pub to_stdout: bool,
    pub max_connections: usize,
    pub min_chunk: u64,
    pub max_chunk: u64,
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub proxy: Option<String>,
    pub verify_tls: bool,
    /// Pinned certificate fingerprints (hostname -> SHA-256 hex).
    pub pins: HashMap<String, String>,
    pub expected_sha256: Option<String>,
    pub resume: bool,
    /// Pre-resolved request headers.
    pub headers: Vec<(String, String)>,
    pub cookie: Option<String>,
    pub user_agent: String,
    /// Attempt HTTP/3 when the server advertises it.
    pub http3: bool,
}

impl FetchRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self::mirror(vec![url.into()])
    }

    pub fn mirror(urls: Vec<String>) -> Self {
        let defaults = Config::default();
        let mut request = Self::from_config(&defaults);
        request.urls = urls;
        request
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            urls: Vec::new(),
            output: None,
            to_stdout: false,
            max_connections: config.transfer.max_connections,
            min_chunk: config.transfer.min_chunk_bytes,
            max_chunk: config.transfer.max_chunk_bytes,
            timeout: Duration::from_secs(config.transfer.timeout_secs),
            connect_timeout: Duration::from_secs(config.transfer.connect_timeout_secs),
            proxy: config.transfer.proxy.clone(),
            verify_tls: config.tls.verify,
            pins: config.tls.pins.clone(),
            expected_sha256: None,
            resume: config.transfer.resume,
            headers: Vec::new(),
            cookie: None,
            user_agent: config.transfer.user_agent.clone(),
            http3: config.transfer.http3,
        }
    }
}

/// Terminal record of a successful fetch.
#[derive(Debug, Clone, Serialize)]
pub struct FetchReport {
    pub url: String,
    pub output: Option<PathBuf>,
    pub bytes: u64,
    #[serde(serialize_with = "serialize_duration_secs")]
    pub duration: Duration,
    /// Average throughput in bytes per second.
    pub avg_throughput: f64,
    pub sha256: String,
    pub protocol_used: String,
    pub connections_used: usize,
    pub resumed: bool,
}

/// Terminal record of a failed fetch.
#[derive(Debug, Clone, Serialize)]
pub struct FetchFailure {
    pub kind: ErrorKind,
    pub message: String,
    /// Bytes preserved in the `.partial` file, if any.
    pub partial_bytes: u64,
    /// Whether the partial is consistent and validators are known, so a
    /// later invocation can resume.
    pub can_resume: bool,
}

/// What a fetch ultimately produced.
pub type FetchOutcome = Result<FetchReport, FetchFailure>;

fn serialize_duration_secs<S: serde::Serializer>(
    duration: &Duration,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults() {
        let request = FetchRequest::new("https://example.com/x");
        assert_eq!(request.urls.len(), 1);
        assert_eq!(request.max_connections, 8);
        assert!(request.verify_tls);
        assert!(request.resume);
        assert!(!request.http3);
        assert_eq!(request.timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_report_serializes_duration_as_seconds() {
        let report = FetchReport {
            url: "u".into(),
            output: None,
            bytes: 10,
            duration: Duration::from_millis(1500),
            avg_throughput: 5.0,
            sha256: "00".into(),
            protocol_used: "HTTP/2".into(),
            connections_used: 2,
            resumed: false,
        };
        let json: serde_json::Value = serde_json::to_value(&report).unwrap();
        assert!((json["duration"].as_f64().unwrap() - 1.5).abs() < 1e-9);
    }
}
