/*
 * swiftfetch - High-throughput multi-protocol transfer engine.
 * Copyright (C) 2025  swiftfetch contributors
 */

//! Adaptive connection-count control.

use std::time::Duration;

/// Hard ceiling on target concurrency, independent of configuration.
pub const ABSOLUTE_MAX_CONNECTIONS: usize = 32;

/// Interval between optimizer evaluations.
pub const TICK_INTERVAL: Duration = Duration::from_secs(2);

/// Tick adjustment threshold: throughput must move by more than this
/// fraction to change the target.
const TICK_THRESHOLD: f64 = 0.10;

/// Direction of the last adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
    Steady,
}

/// Owns the advisory target concurrency N.
///
/// Evaluated on the scheduler's monitor tick and on throttle events. The
/// target is advisory: the scheduler admits new chunks lazily against it
/// and never cancels in-flight work on a decrease.
#[derive(Debug)]
pub struct ConnectionOptimizer {
    target: usize,
    min: usize,
    max: usize,
    rate_at_last_tick: f64,
    suppressed_ticks: u8,
    last_direction: Direction,
}

impl ConnectionOptimizer {
    pub fn new(max: usize) -> Self {
        let max = max.clamp(1, ABSOLUTE_MAX_CONNECTIONS);
        Self {
            target: max.min(8),
            min: 1,
            max,
            rate_at_last_tick: 0.0,
            suppressed_ticks: 0,
            last_direction: Direction::Steady,
        }
    }

    /// Current advisory target.
    pub fn target(&self) -> usize {
        self.target
    }

    pub fn last_direction(&self) -> Direction {
        self.last_direction
    }

    /// Clamp the ceiling to a handler-advertised stream limit. Returns the
    /// new target if it shrank.
    pub fn clamp_max(&mut self, limit: usize) -> Option<usize> {
        let limit = limit.clamp(self.min, ABSOLUTE_MAX_CONNECTIONS);
        if limit < self.max {
            self.max = limit;
        }
        if self.target > self.max {
            self.target = self.max;
            return Some(self.target);
        }
        None
    }

    /// Monitor tick: compare the smoothed rate with the value at the
    /// previous tick and nudge the target. Returns the new target and
    /// direction when it changed.
    pub fn on_tick(&mut self, smoothed_rate: f64) -> Option<(usize, Direction)> {
        if self.suppressed_ticks > 0 {
            self.suppressed_ticks -= 1;
            self.rate_at_last_tick = smoothed_rate;
            return None;
        }

        let previous = std::mem::replace(&mut self.rate_at_last_tick, smoothed_rate);
        if previous <= 0.0 {
            return None;
        }

        if smoothed_rate > previous * (1.0 + TICK_THRESHOLD) {
            let next = (self.target + 1).min(self.max);
            if next != self.target {
                self.target = next;
                self.last_direction = Direction::Up;
                return Some((next, Direction::Up));
            }
        } else if smoothed_rate < previous * (1.0 - TICK_THRESHOLD) {
            let next = self.target.saturating_sub(1).max(self.min);
            if next != self.target {
                self.target = next;
                self.last_direction = Direction::Down;
                return Some((next, Direction::Down));
            }
        } else {
            self.last_direction = Direction::Steady;
        }
        None
    }

    /// Server throttle signal: halve the target immediately and suppress
    /// the next two ticks so the reduced rate is not mistaken for a
    /// degradation worth punishing further.
    pub fn on_throttle(&mut self) -> usize {
        self.target = (self.target / 2).max(self.min);
        self.suppressed_ticks = 2;
        self.last_direction = Direction::Down;
        self.target
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_target() {
        assert_eq!(ConnectionOptimizer::new(16).target(), 8);
        assert_eq!(ConnectionOptimizer::new(4).target(), 4);
        assert_eq!(ConnectionOptimizer::new(0).target(), 1);
        // Configured max above the absolute ceiling is clamped
        assert_eq!(ConnectionOptimizer::new(100).max, ABSOLUTE_MAX_CONNECTIONS);
    }

    #[test]
    fn test_ramp_up_on_improvement() {
        let mut opt = ConnectionOptimizer::new(16);
        assert!(opt.on_tick(1000.0).is_none()); // first tick establishes baseline
        assert_eq!(opt.on_tick(1200.0), Some((9, Direction::Up)));
    }

    #[test]
    fn test_back_off_on_degradation() {
        let mut opt = ConnectionOptimizer::new(16);
        opt.on_tick(1000.0);
        assert_eq!(opt.on_tick(800.0), Some((7, Direction::Down)));
    }

    #[test]
    fn test_steady_within_threshold() {
        let mut opt = ConnectionOptimizer::new(16);
        opt.on_tick(1000.0);
        assert!(opt.on_tick(1050.0).is_none());
        assert!(opt.on_tick(990.0).is_none());
        assert_eq!(opt.target(), 8);
    }

    #[test]
    fn test_throttle_halves_and_suppresses() {
        let mut opt = ConnectionOptimizer::new(16);
        assert_eq!(opt.on_throttle(), 4);
        assert_eq!(opt.last_direction(), Direction::Down);
        // The next two ticks must not adjust, even on big swings.
        assert!(opt.on_tick(10_000.0).is_none());
        assert!(opt.on_tick(100.0).is_none());
        assert_eq!(opt.target(), 4);
        // Third tick adapts again.
        assert_eq!(opt.on_tick(200.0), Some((5, Direction::Up)));
    }

    #[test]
    fn test_throttle_floor_is_one() {
        let mut opt = ConnectionOptimizer::new(2);
        assert_eq!(opt.on_throttle(), 1);
        assert_eq!(opt.on_throttle(), 1);
    }

    #[test]
    fn test_bounds_hold_under_pressure() {
        let mut opt = ConnectionOptimizer::new(10);
        let mut rate = 100.0;
        opt.on_tick(rate);
        for _ in 0..50 {
            rate *= 1.5;
            opt.on_tick(rate);
            assert!(opt.target() >= 1 && opt.target() <= 10);
        }
        assert_eq!(opt.target(), 10);
        for _ in 0..50 {
            rate *= 0.5;
            opt.on_tick(rate);
            assert!(opt.target() >= 1 && opt.target() <= 10);
        }
        assert_eq!(opt.target(), 1);
    }

    #[test]
    fn test_clamp_to_stream_limit() {
        let mut opt = ConnectionOptimizer::new(16);
        assert_eq!(opt.clamp_max(4), Some(4));
        assert_eq!(opt.target(), 4);
        // Ramp-up never exceeds the clamped ceiling.
        opt.on_tick(100.0);
        opt.on_tick(1000.0);
        assert_eq!(opt.target(), 4);
    }
}
