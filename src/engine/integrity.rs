/*
 * swiftfetch - High-throughput multi-protocol transfer engine.
 * Copyright (C) 2025  swiftfetch contributors
 */

//! Incremental integrity verification in file-offset order.

use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// SHA-256 of the empty input.
pub const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// Feeds landed chunks into a running SHA-256 in strictly increasing
/// offset order.
///
/// Chunks that land ahead of the cursor are buffered and drained once the
/// gap closes, so every byte is hashed exactly once.
#[derive(Debug)]
pub struct IntegrityVerifier {
    hasher: Sha256,
    cursor: u64,
    pending: BTreeMap<u64, Bytes>,
    buffered_bytes: u64,
}

impl IntegrityVerifier {
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
            cursor: 0,
            pending: BTreeMap::new(),
            buffered_bytes: 0,
        }
    }

    /// Current in-order cursor: every byte below it has been hashed.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Bytes parked in the reorder buffer.
    pub fn buffered_bytes(&self) -> u64 {
        self.buffered_bytes
    }

    /// True when no out-of-order chunks are parked.
    pub fn is_consistent(&self) -> bool {
        self.pending.is_empty()
    }

    /// Hash bytes that are already known to be in order (resume prefix).
    pub fn absorb(&mut self, data: &[u8]) {
        debug_assert!(self.pending.is_empty());
        self.hasher.update(data);
        self.cursor += data.len() as u64;
    }

    /// Submit a landed chunk at `offset`. Returns the cursor after any
    /// in-order drain.
    pub fn submit(&mut self, offset: u64, data: Bytes) -> u64 {
        if offset != self.cursor {
            self.buffered_bytes += data.len() as u64;
            self.pending.insert(offset, data);
            return self.cursor;
        }

        self.hasher.update(&data);
        self.cursor += data.len() as u64;

        // Drain any buffered chunks that are now contiguous.
        while let Some(entry) = self.pending.first_entry() {
            if *entry.key() != self.cursor {
                break;
            }
            let chunk = entry.remove();
            self.buffered_bytes -= chunk.len() as u64;
            self.hasher.update(&chunk);
            self.cursor += chunk.len() as u64;
        }

        self.cursor
    }

    /// Finish and return the hex digest.
    pub fn finalize(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

impl Default for IntegrityVerifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest_of(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    #[test]
    fn test_empty_digest() {
        let verifier = IntegrityVerifier::new();
        assert_eq!(verifier.finalize(), EMPTY_SHA256);
    }

    #[test]
    fn test_in_order_hashing() {
        let mut verifier = IntegrityVerifier::new();
        assert_eq!(verifier.submit(0, Bytes::from_static(b"hello ")), 6);
        assert_eq!(verifier.submit(6, Bytes::from_static(b"world")), 11);
        assert!(verifier.is_consistent());
        assert_eq!(verifier.finalize(), digest_of(b"hello world"));
    }

    #[test]
    fn test_out_of_order_buffering_and_drain() {
        let mut verifier = IntegrityVerifier::new();
        // Chunks land as 2, 0, 1; the digest must match the linear input.
        assert_eq!(verifier.submit(8, Bytes::from_static(b"cccc")), 0);
        assert!(!verifier.is_consistent());
        assert_eq!(verifier.buffered_bytes(), 4);

        assert_eq!(verifier.submit(0, Bytes::from_static(b"aaaa")), 4);
        assert_eq!(verifier.submit(4, Bytes::from_static(b"bbbb")), 12);
        assert!(verifier.is_consistent());
        assert_eq!(verifier.buffered_bytes(), 0);
        assert_eq!(verifier.finalize(), digest_of(b"aaaabbbbcccc"));
    }

    #[test]
    fn test_absorb_seeds_resume_prefix() {
        let mut verifier = IntegrityVerifier::new();
        verifier.absorb(b"prefix-");
        assert_eq!(verifier.cursor(), 7);
        verifier.submit(7, Bytes::from_static(b"rest"));
        assert_eq!(verifier.finalize(), digest_of(b"prefix-rest"));
    }

    #[test]
    fn test_deep_reorder() {
        let data: Vec<u8> = (0u8..200).collect();
        let mut verifier = IntegrityVerifier::new();
        // Submit every 20-byte slice in reverse order.
        for start in (0..200).step_by(20).rev() {
            verifier.submit(start as u64, Bytes::copy_from_slice(&data[start..start + 20]));
        }
        assert!(verifier.is_consistent());
        assert_eq!(verifier.cursor(), 200);
        assert_eq!(verifier.finalize(), digest_of(&data));
    }
}
