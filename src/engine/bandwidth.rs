/*
 * swiftfetch - High-throughput multi-protocol transfer engine.
 * Copyright (C) 2025  swiftfetch contributors
 */

//! Online bandwidth estimation from a sliding sample window.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Samples below this rate are treated as "no signal" for ETA purposes.
const EPSILON: f64 = 1.0;

/// Minimum samples before an ETA is reported.
const MIN_SAMPLES_FOR_ETA: usize = 3;

/// One completed transfer observation.
#[derive(Debug, Clone, Copy)]
struct TransferSample {
    bytes: u64,
    elapsed: Duration,
}

/// Estimates current and smoothed bandwidth from recent samples.
///
/// Keeps a fixed-capacity ring of the most recent samples for the window
/// rate and an exponential moving average for the smoothed rate.
#[derive(Debug)]
pub struct BandwidthEstimator {
    window: VecDeque<TransferSample>,
    capacity: usize,
    alpha: f64,
    ema: Option<f64>,
    last_record: Instant,
    total_bytes: u64,
}

impl BandwidthEstimator {
    pub fn new() -> Self {
        Self::with_window(30, 0.3)
    }

    pub fn with_window(capacity: usize, alpha: f64) -> Self {
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
            alpha,
            ema: None,
            last_record: Instant::now(),
            total_bytes: 0,
        }
    }

    /// Record bytes transferred since the previous call. O(1).
    pub fn record(&mut self, bytes: u64) {
        let now = Instant::now();
        let elapsed = now - self.last_record;
        self.last_record = now;
        self.push_sample(bytes, elapsed);
    }

    /// Record a sample with an explicit duration. Samples with a
    /// non-positive duration are ignored.
    pub(crate) fn push_sample(&mut self, bytes: u64, elapsed: Duration) {
        if elapsed.is_zero() {
            return;
        }
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(TransferSample { bytes, elapsed });
        self.total_bytes += bytes;

        let rate = bytes as f64 / elapsed.as_secs_f64();
        self.ema = Some(match self.ema {
            None => rate,
            Some(prev) => self.alpha * rate + (1.0 - self.alpha) * prev,
        });
    }

    /// Bytes per second over the sample window.
    pub fn instant_rate(&self) -> f64 {
        let bytes: u64 = self.window.iter().map(|s| s.bytes).sum();
        let secs: f64 = self.window.iter().map(|s| s.elapsed.as_secs_f64()).sum();
        if secs <= 0.0 {
            return 0.0;
        }
        bytes as f64 / secs
    }

    /// EMA-smoothed rate in bytes per second.
    pub fn smoothed_rate(&self) -> f64 {
        self.ema.unwrap_or(0.0)
    }

    /// Total bytes observed.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Estimated time to transfer `remaining` bytes.
    ///
    /// Unknown (`None`) until at least three samples exist or while the
    /// smoothed rate is effectively zero.
    pub fn eta(&self, remaining: u64) -> Option<Duration> {
        if self.window.len() < MIN_SAMPLES_FOR_ETA {
            return None;
        }
        let rate = self.smoothed_rate();
        if rate < EPSILON {
            return None;
        }
        Some(Duration::from_secs_f64(remaining as f64 / rate))
    }
}

impl Default for BandwidthEstimator {
    fn default() -> Self {
        Self::new()
    }
}
