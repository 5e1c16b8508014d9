/*
 * swiftfetch - High-throughput multi-protocol transfer engine.
 * Copyright (C) 2025  swiftfetch contributors
 */

//! Retry classification with full-jitter exponential backoff.

use rand::Rng;
use std::time::Duration;

use crate::error::FetchError;

/// Cap on any computed backoff delay.
const MAX_BACKOFF: Duration = Duration::from_secs(30);
/// Largest Retry-After value we will honor.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(120);
/// Attempts per chunk before giving up.
const MAX_ATTEMPTS: u32 = 5;

/// Error category for reporting and for the optimizer's throttle signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryCategory {
    TransientNetwork,
    ServerBackoff,
    RangeViolation,
    Fatal,
}

impl std::fmt::Display for RetryCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RetryCategory::TransientNetwork => "transient-network",
            RetryCategory::ServerBackoff => "server-backoff",
            RetryCategory::RangeViolation => "range-violation",
            RetryCategory::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

/// What to do with a failed chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryNow {
        category: RetryCategory,
    },
    RetryAfter {
        delay: Duration,
        category: RetryCategory,
    },
    Fail {
        category: RetryCategory,
    },
}

impl RetryDecision {
    pub fn category(&self) -> RetryCategory {
        match self {
            RetryDecision::RetryNow { category }
            | RetryDecision::RetryAfter { category, .. }
            | RetryDecision::Fail { category } => *category,
        }
    }

    /// True when this decision signals a server throttle that should halve
    /// the connection target.
    pub fn is_throttle(&self) -> bool {
        self.category() == RetryCategory::ServerBackoff
            && !matches!(self, RetryDecision::Fail { .. })
    }
}

/// Maps transport errors to retry decisions.
#[derive(Debug)]
pub struct RetryClassifier {
    base: Duration,
    max_attempts: u32,
}

impl RetryClassifier {
    pub fn new() -> Self {
        Self {
            base: Duration::from_secs(1),
            max_attempts: MAX_ATTEMPTS,
        }
    }

    #[cfg(test)]
    fn with_base(base: Duration) -> Self {
        Self {
            base,
            max_attempts: MAX_ATTEMPTS,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Classify `err` for a chunk on its `attempt`-th try (1-based).
    pub fn classify(&self, err: &FetchError, attempt: u32) -> RetryDecision {
        match err {
            FetchError::TransientNetwork { .. } => {
                if attempt >= self.max_attempts {
                    return RetryDecision::Fail {
                        category: RetryCategory::TransientNetwork,
                    };
                }
                RetryDecision::RetryAfter {
                    delay: self.backoff(attempt),
                    category: RetryCategory::TransientNetwork,
                }
            }
            FetchError::ServerBackoff { retry_after, .. } => {
                if attempt >= self.max_attempts {
                    return RetryDecision::Fail {
                        category: RetryCategory::ServerBackoff,
                    };
                }
                // Honor a sane Retry-After verbatim; fall back to the
                // exponential schedule otherwise.
                let delay = match retry_after {
                    Some(d) if *d <= MAX_RETRY_AFTER => *d,
                    _ => self.backoff(attempt),
                };
                RetryDecision::RetryAfter {
                    delay,
                    category: RetryCategory::ServerBackoff,
                }
            }
            // Range violations are unrecoverable at chunk level; the
            // controller re-plans the whole fetch as a single stream.
            FetchError::ProtocolDegraded { .. } => RetryDecision::Fail {
                category: RetryCategory::RangeViolation,
            },
            FetchError::TlsFailure { .. }
            | FetchError::PinMismatch { .. }
            | FetchError::IntegrityMismatch { .. }
            | FetchError::LocalIo { .. }
            | FetchError::Cancelled
            | FetchError::UnsupportedScheme { .. }
            | FetchError::HttpStatus { .. } => RetryDecision::Fail {
                category: RetryCategory::Fatal,
            },
        }
    }

    /// Exponential backoff with full jitter: uniform in
    /// [0, base * 2^(attempt-1)], capped at 30 s.
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let ceiling = self
            .base
            .saturating_mul(1u32 << exp)
            .min(MAX_BACKOFF)
            .as_secs_f64();
        let jittered = rand::thread_rng().gen_range(0.0..=ceiling);
        Duration::from_secs_f64(jittered)
    }
}

impl Default for RetryClassifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff_err() -> FetchError {
        FetchError::ServerBackoff {
            status: 429,
            retry_after: None,
        }
    }

    #[test]
    fn test_transient_retries_then_fails() {
        let classifier = RetryClassifier::new();
        let err = FetchError::transient("reset");
        for attempt in 1..MAX_ATTEMPTS {
            assert!(matches!(
                classifier.classify(&err, attempt),
                RetryDecision::RetryAfter {
                    category: RetryCategory::TransientNetwork,
                    ..
                }
            ));
        }
        assert!(matches!(
            classifier.classify(&err, MAX_ATTEMPTS),
            RetryDecision::Fail {
                category: RetryCategory::TransientNetwork
            }
        ));
    }

    #[test]
    fn test_backoff_within_jitter_bounds() {
        let classifier = RetryClassifier::with_base(Duration::from_secs(1));
        for attempt in 1..=4u32 {
            let ceiling = Duration::from_secs(1 << (attempt - 1));
            for _ in 0..50 {
                let delay = classifier.backoff(attempt);
                assert!(
                    delay <= ceiling,
                    "attempt {attempt}: {delay:?} above ceiling {ceiling:?}"
                );
            }
        }
    }

    #[test]
    fn test_backoff_capped_at_thirty_seconds() {
        let classifier = RetryClassifier::new();
        for _ in 0..50 {
            assert!(classifier.backoff(20) <= MAX_BACKOFF);
        }
    }

    #[test]
    fn test_retry_after_honored_when_sane() {
        let classifier = RetryClassifier::new();
        let err = FetchError::ServerBackoff {
            status: 429,
            retry_after: Some(Duration::from_secs(7)),
        };
        match classifier.classify(&err, 1) {
            RetryDecision::RetryAfter { delay, category } => {
                assert_eq!(delay, Duration::from_secs(7));
                assert_eq!(category, RetryCategory::ServerBackoff);
            }
            other => panic!("unexpected decision: {other:?}"),
        }
    }

    #[test]
    fn test_insane_retry_after_falls_back_to_schedule() {
        let classifier = RetryClassifier::new();
        let err = FetchError::ServerBackoff {
            status: 503,
            retry_after: Some(Duration::from_secs(600)),
        };
        match classifier.classify(&err, 1) {
            RetryDecision::RetryAfter { delay, .. } => {
                assert!(delay <= Duration::from_secs(1));
            }
            other => panic!("unexpected decision: {other:?}"),
        }
    }

    #[test]
    fn test_backoff_is_throttle_signal() {
        let classifier = RetryClassifier::new();
        assert!(classifier.classify(&backoff_err(), 1).is_throttle());
        assert!(!classifier
            .classify(&FetchError::transient("x"), 1)
            .is_throttle());
    }

    #[test]
    fn test_fatal_errors_fail_immediately() {
        let classifier = RetryClassifier::new();
        let fatal = [
            FetchError::PinMismatch {
                host: "h".into(),
                expected: "a".into(),
                actual: "b".into(),
            },
            FetchError::TlsFailure {
                host: "h".into(),
                message: "handshake".into(),
            },
            FetchError::io("out", std::io::Error::other("disk full")),
            FetchError::HttpStatus {
                status: 404,
                message: "not found".into(),
            },
            FetchError::UnsupportedScheme {
                scheme: "gopher".into(),
            },
        ];
        for err in fatal {
            assert!(
                matches!(
                    classifier.classify(&err, 1),
                    RetryDecision::Fail {
                        category: RetryCategory::Fatal
                    }
                ),
                "{err} should be fatal"
            );
        }
    }

    #[test]
    fn test_range_violation_fails_with_its_own_category() {
        let classifier = RetryClassifier::new();
        let err = FetchError::degraded("server returned 200 for a range request");
        assert!(matches!(
            classifier.classify(&err, 1),
            RetryDecision::Fail {
                category: RetryCategory::RangeViolation
            }
        ));
    }
}
