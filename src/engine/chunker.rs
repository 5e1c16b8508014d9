/*
 * swiftfetch - High-throughput multi-protocol transfer engine.
 * Copyright (C) 2025  swiftfetch contributors
 */

//! Adaptive chunk sizing from throughput trend.

/// Smallest chunk the engine will request.
pub const MIN_CHUNK: u64 = 256 * 1024;
/// Largest chunk the engine will request.
pub const MAX_CHUNK: u64 = 16 * 1024 * 1024;
/// Size of the first chunk of a fetch.
pub const INITIAL_CHUNK: u64 = 1024 * 1024;

/// Growth/shrink threshold relative to the rate at the last size change.
const TREND_THRESHOLD: f64 = 0.20;

/// Emits the byte size for the next chunk based on the smoothed throughput
/// trend. Sizes are powers of two within [min, max]; a change applies only
/// to future chunks.
#[derive(Debug)]
pub struct AdaptiveChunker {
    size: u64,
    min: u64,
    max: u64,
    /// Smoothed rate observed when the size last changed (or was first
    /// observed). The trend is measured against this baseline.
    rate_at_last_change: Option<f64>,
}

impl AdaptiveChunker {
    pub fn new() -> Self {
        Self::with_bounds(MIN_CHUNK, MAX_CHUNK)
    }

    /// Bounds are rounded to powers of two so doubling and halving always
    /// stay on power-of-two sizes.
    pub fn with_bounds(min: u64, max: u64) -> Self {
        let min = round_pow2(min.max(1)).max(1);
        let max = round_pow2(max.max(min));
        let size = INITIAL_CHUNK.clamp(min, max);
        Self {
            size,
            min,
            max,
            rate_at_last_change: None,
        }
    }

    /// Current size without consulting the trend.
    pub fn current(&self) -> u64 {
        self.size
    }

    /// Size for the next chunk given the current smoothed rate.
    pub fn next_size(&mut self, smoothed_rate: f64) -> u64 {
        let baseline = match self.rate_at_last_change {
            Some(b) => b,
            None => {
                if smoothed_rate > 0.0 {
                    self.rate_at_last_change = Some(smoothed_rate);
                }
                return self.size;
            }
        };

        if smoothed_rate > baseline * (1.0 + TREND_THRESHOLD) {
            let grown = (self.size * 2).min(self.max);
            if grown != self.size {
                self.size = grown;
                self.rate_at_last_change = Some(smoothed_rate);
            }
        } else if smoothed_rate < baseline * (1.0 - TREND_THRESHOLD) {
            let shrunk = (self.size / 2).max(self.min);
            if shrunk != self.size {
                self.size = shrunk;
                self.rate_at_last_change = Some(smoothed_rate);
            }
        }

        self.size
    }
}

impl Default for AdaptiveChunker {
    fn default() -> Self {
        Self::new()
    }
}

/// Round down to the nearest power of two (0 maps to 1).
fn round_pow2(n: u64) -> u64 {
    if n == 0 {
        return 1;
    }
    1u64 << (63 - n.leading_zeros())
}
