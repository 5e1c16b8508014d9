/*
 * swiftfetch - High-throughput multi-protocol transfer engine.
 * Copyright (C) 2025  swiftfetch contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Transfer error types with classification helpers.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Error kinds surfaced to callers.
///
/// Every terminal failure of a fetch carries exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// DNS, connect, reset, or read timeout.
    TransientNetwork,
    /// 429 / 503 style server pushback.
    ServerBackoff,
    /// Range request refused or truncated.
    ProtocolDegraded,
    /// TLS or SSH secure-channel establishment failed.
    TlsFailure,
    /// Host pin present and fingerprint differs.
    PinMismatch,
    /// Computed hash differs from the expected hash.
    IntegrityMismatch,
    /// Disk full, permission denied, rename failed.
    LocalIo,
    /// Caller-initiated cancellation.
    Cancelled,
    /// No handler claims the URL scheme.
    UnsupportedScheme,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::TransientNetwork => "transient network error",
            ErrorKind::ServerBackoff => "server backoff",
            ErrorKind::ProtocolDegraded => "protocol degraded",
            ErrorKind::TlsFailure => "TLS failure",
            ErrorKind::PinMismatch => "certificate pin mismatch",
            ErrorKind::IntegrityMismatch => "integrity mismatch",
            ErrorKind::LocalIo => "local I/O error",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::UnsupportedScheme => "unsupported scheme",
        };
        f.write_str(s)
    }
}

/// Main error type for transfer operations.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Transient transport errors: DNS failure, connection refused/reset,
    /// handshake timeout, stalled reads.
    #[error("network error: {message}")]
    TransientNetwork {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Server asked us to slow down (HTTP 429, 503, stream refusal).
    #[error("server backoff (HTTP {status})")]
    ServerBackoff {
        status: u16,
        /// Parsed Retry-After, if the server sent one.
        retry_after: Option<Duration>,
    },

    /// The server refused or truncated a range request; the fetch can be
    /// re-planned as a single stream.
    #[error("range protocol degraded: {message}")]
    ProtocolDegraded { message: String },

    /// TLS (or SSH) secure-channel establishment failed for a non-timeout
    /// reason: bad certificate, hostname mismatch, rejected authentication.
    #[error("TLS failure for {host}: {message}")]
    TlsFailure { host: String, message: String },

    /// A pin is configured for the host and the observed certificate
    /// fingerprint does not match it.
    #[error("certificate pin mismatch for {host}: expected {expected}, got {actual}")]
    PinMismatch {
        host: String,
        expected: String,
        actual: String,
    },

    /// The completed object hashes differently than the caller expected.
    #[error("integrity mismatch: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },

    /// Filesystem error on the assembly file or the final rename.
    #[error("I/O error for '{path}': {source}")]
    LocalIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The fetch was cancelled by the caller.
    #[error("transfer cancelled")]
    Cancelled,

    /// No registered handler claims the URL scheme.
    #[error("unsupported URL scheme '{scheme}'")]
    UnsupportedScheme { scheme: String },

    /// HTTP status that terminates the fetch (4xx other than 408/429).
    #[error("HTTP {status}: {message}")]
    HttpStatus { status: u16, message: String },
}

impl FetchError {
    /// Create a transient network error from a plain message.
    pub fn transient(message: impl Into<String>) -> Self {
        FetchError::TransientNetwork {
            message: message.into(),
            source: None,
        }
    }

    /// Create a transient network error wrapping a source error.
    pub fn transient_with<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        FetchError::TransientNetwork {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a local I/O error tagged with the offending path.
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        FetchError::LocalIo {
            path: path.into(),
            source,
        }
    }

    /// Create a degraded-range error.
    pub fn degraded(message: impl Into<String>) -> Self {
        FetchError::ProtocolDegraded {
            message: message.into(),
        }
    }

    /// Classify a reqwest transport error.
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            return FetchError::transient_with("request failed", err);
        }
        // Body/decode errors mid-stream behave like a dropped connection.
        FetchError::transient_with("transfer interrupted", err)
    }

    /// Classify an HTTP response status that was not a success.
    pub fn from_status(status: u16, retry_after: Option<Duration>) -> Self {
        match status {
            429 | 503 => FetchError::ServerBackoff {
                status,
                retry_after,
            },
            408 | 500 | 502 | 504 => FetchError::transient(format!("HTTP {status}")),
            _ => FetchError::HttpStatus {
                status,
                message: "request rejected".into(),
            },
        }
    }

    /// The surfaced kind for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            FetchError::TransientNetwork { .. } => ErrorKind::TransientNetwork,
            FetchError::ServerBackoff { .. } => ErrorKind::ServerBackoff,
            FetchError::ProtocolDegraded { .. } => ErrorKind::ProtocolDegraded,
            FetchError::TlsFailure { .. } => ErrorKind::TlsFailure,
            FetchError::PinMismatch { .. } => ErrorKind::PinMismatch,
            FetchError::IntegrityMismatch { .. } => ErrorKind::IntegrityMismatch,
            FetchError::LocalIo { .. } => ErrorKind::LocalIo,
            FetchError::Cancelled => ErrorKind::Cancelled,
            FetchError::UnsupportedScheme { .. } => ErrorKind::UnsupportedScheme,
            FetchError::HttpStatus { .. } => ErrorKind::TransientNetwork,
        }
    }

    /// Whether an I/O error kind is a transient connection problem rather
    /// than a persistent filesystem fault.
    pub fn io_is_transient(kind: std::io::ErrorKind) -> bool {
        matches!(
            kind,
            std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::NotConnected
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::Interrupted
        )
    }
}

/// Result type alias for transfer operations.
pub type FetchResult<T> = std::result::Result<T, FetchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            FetchError::transient("reset").kind(),
            ErrorKind::TransientNetwork
        );
        assert_eq!(
            FetchError::ServerBackoff {
                status: 429,
                retry_after: None
            }
            .kind(),
            ErrorKind::ServerBackoff
        );
        assert_eq!(FetchError::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(
            FetchError::UnsupportedScheme {
                scheme: "gopher".into()
            }
            .kind(),
            ErrorKind::UnsupportedScheme
        );
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            FetchError::from_status(429, Some(Duration::from_secs(1))),
            FetchError::ServerBackoff { status: 429, .. }
        ));
        assert!(matches!(
            FetchError::from_status(503, None),
            FetchError::ServerBackoff { status: 503, .. }
        ));
        assert!(matches!(
            FetchError::from_status(500, None),
            FetchError::TransientNetwork { .. }
        ));
        assert!(matches!(
            FetchError::from_status(404, None),
            FetchError::HttpStatus { status: 404, .. }
        ));
    }

    #[test]
    fn test_display() {
        let err = FetchError::UnsupportedScheme {
            scheme: "gopher".into(),
        };
        assert_eq!(format!("{err}"), "unsupported URL scheme 'gopher'");

        let err = FetchError::PinMismatch {
            host: "example.com".into(),
            expected: "aa".into(),
            actual: "bb".into(),
        };
        assert!(format!("{err}").contains("example.com"));
    }

    #[test]
    fn test_io_transience() {
        assert!(FetchError::io_is_transient(
            std::io::ErrorKind::ConnectionReset
        ));
        assert!(!FetchError::io_is_transient(
            std::io::ErrorKind::PermissionDenied
        ));
    }
}
