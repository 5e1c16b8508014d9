/*
 * swiftfetch - High-throughput multi-protocol transfer engine.
 * Copyright (C) 2025  swiftfetch contributors
 */

//! Structured transfer events consumed by progress renderers.
//!
//! The engine emits these through an [`EventSink`] supplied by its caller;
//! the CLI progress bar and the JSON renderer are pure consumers.

use std::time::Duration;

use crate::engine::plan::FetchPlan;
use crate::engine::retry::RetryCategory;
use crate::engine::FetchOutcome;
use crate::protocols::ProbeReport;

/// Why the target concurrency changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcurrencyReason {
    /// Throughput improved, one more connection admitted.
    Ramp,
    /// Throughput degraded, one connection retired.
    Backoff,
    /// Server throttle signal halved the target.
    Throttle,
    /// Handler stream limit clamped the target.
    Clamp,
}

/// A progress snapshot emitted on the monitor tick.
#[derive(Debug, Clone)]
pub struct Progress {
    pub bytes: u64,
    pub total: Option<u64>,
    /// Smoothed rate in bytes per second.
    pub rate: f64,
    pub eta: Option<Duration>,
}

/// Observability hook for a single fetch.
///
/// All methods have empty default bodies so sinks implement only what they
/// render.
pub trait EventSink: Send + Sync {
    fn on_probe(&self, _probe: &ProbeReport) {}
    fn on_plan(&self, _plan: &FetchPlan) {}
    fn on_chunk_landed(&self, _offset: u64, _length: u64, _duration: Duration) {}
    fn on_concurrency_changed(&self, _target: usize, _reason: ConcurrencyReason) {}
    fn on_retry(&self, _category: RetryCategory, _delay: Duration, _attempt: u32) {}
    fn on_progress(&self, _progress: &Progress) {}
    fn on_complete(&self, _outcome: &FetchOutcome) {}
}

/// Sink that drops every event.
pub struct NullSink;

impl EventSink for NullSink {}
