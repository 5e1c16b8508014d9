/*
 * swiftfetch - High-throughput multi-protocol transfer engine.
 * Copyright (C) 2025  swiftfetch contributors
 */

//! Transfer planning and crash-safe resume metadata.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{FetchError, FetchResult};
use crate::protocols::ProbeReport;

/// How the controller moves the bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    /// Ranged chunks across a connection pool.
    Parallel,
    /// One ranged or plain stream into the assembly file.
    Single,
    /// One plain stream into a caller-provided sink, no assembly file.
    Stream,
    /// Probe several URLs, then fetch the winner.
    Mirror,
}

/// Server-supplied identifiers that authorize resuming a transfer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validators {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl Validators {
    pub fn from_probe(probe: &ProbeReport) -> Self {
        Self {
            etag: probe.etag.clone(),
            last_modified: probe.last_modified.clone(),
        }
    }

    /// Resume is only safe when at least one validator is known.
    pub fn usable(&self) -> bool {
        self.etag.is_some() || self.last_modified.is_some()
    }
}

/// Execution plan derived from the probe and the user request.
#[derive(Debug, Clone)]
pub struct FetchPlan {
    pub mode: TransferMode,
    pub url: String,
    pub output: PathBuf,
    pub partial_path: PathBuf,
    pub meta_path: PathBuf,
    pub total_size: Option<u64>,
    pub resume_offset: u64,
    pub initial_concurrency: usize,
    pub max_connections: usize,
    pub min_chunk: u64,
    pub max_chunk: u64,
    pub expected_sha256: Option<String>,
    pub validators: Validators,
}

impl FetchPlan {
    /// Paths derived from the output path.
    pub fn partial_path_for(output: &Path) -> PathBuf {
        let mut name = output.as_os_str().to_os_string();
        name.push(".partial");
        PathBuf::from(name)
    }

    pub fn meta_path_for(output: &Path) -> PathBuf {
        let mut name = output.as_os_str().to_os_string();
        name.push(".partial.meta");
        PathBuf::from(name)
    }
}

/// Sidecar record describing an interrupted transfer.
///
/// The meta file, not the partial's mtime, is the authoritative witness
/// for resume decisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialMeta {
    pub url: String,
    pub total_size: u64,
    pub validators: Validators,
    /// Chunk size in use when the transfer was interrupted.
    pub chunk_size: u64,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl PartialMeta {
    pub fn new(url: &str, total_size: u64, validators: Validators, chunk_size: u64) -> Self {
        Self {
            url: url.to_string(),
            total_size,
            validators,
            chunk_size,
            created_at: chrono::Utc::now(),
        }
    }

    pub fn load(path: &Path) -> Option<Self> {
        let content = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&content).ok()
    }

    pub fn store(&self, path: &Path) -> FetchResult<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| FetchError::io(path.display().to_string(), std::io::Error::other(e)))?;
        std::fs::write(path, content).map_err(|e| FetchError::io(path.display().to_string(), e))
    }

    /// Whether a fresh probe still describes the same entity this partial
    /// was taken from. Requires at least one recorded validator and every
    /// recorded validator to match.
    pub fn matches(&self, probe: &ProbeReport, total_size: u64) -> bool {
        if !self.validators.usable() {
            return false;
        }
        if self.total_size != total_size {
            return false;
        }
        if let Some(etag) = &self.validators.etag {
            if probe.etag.as_deref() != Some(etag.as_str()) {
                return false;
            }
        }
        if let Some(lm) = &self.validators.last_modified {
            if probe.last_modified.as_deref() != Some(lm.as_str()) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::ProbeReport;

    fn probe(etag: Option<&str>, lm: Option<&str>) -> ProbeReport {
        ProbeReport {
            etag: etag.map(str::to_string),
            last_modified: lm.map(str::to_string),
            ..ProbeReport::default()
        }
    }

    #[test]
    fn test_derived_paths() {
        let output = Path::new("/tmp/file.iso");
        assert_eq!(
            FetchPlan::partial_path_for(output),
            PathBuf::from("/tmp/file.iso.partial")
        );
        assert_eq!(
            FetchPlan::meta_path_for(output),
            PathBuf::from("/tmp/file.iso.partial.meta")
        );
    }

    #[test]
    fn test_meta_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.partial.meta");

        let meta = PartialMeta::new(
            "https://example.com/x",
            4096,
            Validators {
                etag: Some("\"v1\"".into()),
                last_modified: None,
            },
            1024,
        );
        meta.store(&path).unwrap();

        let loaded = PartialMeta::load(&path).unwrap();
        assert_eq!(loaded.url, meta.url);
        assert_eq!(loaded.total_size, 4096);
        assert_eq!(loaded.validators.etag.as_deref(), Some("\"v1\""));
    }

    #[test]
    fn test_load_missing_or_corrupt() {
        assert!(PartialMeta::load(Path::new("/nonexistent/meta")).is_none());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrupt.meta");
        std::fs::write(&path, "not json").unwrap();
        assert!(PartialMeta::load(&path).is_none());
    }

    #[test]
    fn test_resume_refused_without_validators() {
        let meta = PartialMeta::new("u", 100, Validators::default(), 1024);
        assert!(!meta.matches(&probe(Some("\"v1\""), None), 100));
    }

    #[test]
    fn test_resume_validator_match() {
        let meta = PartialMeta::new(
            "u",
            100,
            Validators {
                etag: Some("\"v1\"".into()),
                last_modified: None,
            },
            1024,
        );
        assert!(meta.matches(&probe(Some("\"v1\""), None), 100));
        assert!(!meta.matches(&probe(Some("\"v2\""), None), 100));
        assert!(!meta.matches(&probe(None, None), 100));
        // Size change always invalidates
        assert!(!meta.matches(&probe(Some("\"v1\""), None), 200));
    }

    #[test]
    fn test_last_modified_only_is_usable() {
        let meta = PartialMeta::new(
            "u",
            100,
            Validators {
                etag: None,
                last_modified: Some("Wed, 21 Oct 2015 07:28:00 GMT".into()),
            },
            1024,
        );
        assert!(meta.matches(&probe(None, Some("Wed, 21 Oct 2015 07:28:00 GMT")), 100));
        assert!(!meta.matches(&probe(None, Some("Thu, 22 Oct 2015 07:28:00 GMT")), 100));
    }
}
