/*
 * swiftfetch - High-throughput multi-protocol transfer engine.
 * Copyright (C) 2025  swiftfetch contributors
 */

//! Chunk descriptors and the pending-work queue.

use std::collections::VecDeque;

/// Lifecycle of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    Pending,
    InFlight,
    Landed,
    Failed,
}

/// A contiguous byte range [offset, offset + length) of the target.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub offset: u64,
    pub length: u64,
    /// Number of times this chunk has been attempted (1-based once taken).
    pub attempt: u32,
    /// Handler-assigned stream id, unique within the fetch.
    pub stream_id: u64,
    pub state: ChunkState,
}

/// Pending-work queue for the parallel scheduler.
///
/// Seeded with a single descriptor covering the remaining range; the
/// scheduler takes work units off the head, splitting them at the
/// chunker's current size. Near the end of the transfer the queue stops
/// splitting so it never produces sub-minimum fragments.
#[derive(Debug)]
pub struct ChunkQueue {
    pending: VecDeque<Chunk>,
    in_flight: usize,
    landed_bytes: u64,
    next_stream_id: u64,
}

impl ChunkQueue {
    /// Seed with one descriptor covering [offset, total). An empty range
    /// produces an empty queue.
    pub fn seed(offset: u64, total: u64) -> Self {
        let mut pending = VecDeque::new();
        if total > offset {
            pending.push_back(Chunk {
                offset,
                length: total - offset,
                attempt: 0,
                stream_id: 0,
                state: ChunkState::Pending,
            });
        }
        Self {
            pending,
            in_flight: 0,
            landed_bytes: 0,
            next_stream_id: 1,
        }
    }

    pub fn pending_bytes(&self) -> u64 {
        self.pending.iter().map(|c| c.length).sum()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn landed_bytes(&self) -> u64 {
        self.landed_bytes
    }

    /// All work is done: nothing pending, nothing in flight.
    pub fn is_drained(&self) -> bool {
        self.pending.is_empty() && self.in_flight == 0
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Take the next work unit.
    ///
    /// The head descriptor is split at `split_size`. Splitting stops once
    /// the remaining pending bytes drop below `min_size * target` (or the
    /// split would leave a sub-minimum tail), so the tail of the transfer
    /// is assigned as whole ranges instead of fragments.
    pub fn take_next(&mut self, split_size: u64, min_size: u64, target: usize) -> Option<Chunk> {
        let split_size = split_size.max(1);
        let remaining = self.pending_bytes();
        let mut head = self.pending.pop_front()?;

        let stop_splitting = remaining < min_size.saturating_mul(target.max(1) as u64)
            || head.length.saturating_sub(split_size) < min_size;
        if head.length > split_size && !stop_splitting {
            let rest = Chunk {
                offset: head.offset + split_size,
                length: head.length - split_size,
                attempt: 0,
                stream_id: 0,
                state: ChunkState::Pending,
            };
            head.length = split_size;
            self.pending.push_front(rest);
        }

        head.state = ChunkState::InFlight;
        if head.attempt == 0 {
            head.attempt = 1;
        }
        head.stream_id = self.next_stream_id;
        self.next_stream_id += 1;
        self.in_flight += 1;
        Some(head)
    }

    /// Record a landed chunk.
    pub fn complete(&mut self, chunk: &Chunk) {
        debug_assert!(self.in_flight > 0);
        self.in_flight -= 1;
        self.landed_bytes += chunk.length;
    }

    /// Drop a failed chunk from the in-flight count. The chunk either
    /// comes back through [`push_retry`](Self::push_retry) after its
    /// backoff delay or is abandoned on a fatal failure.
    pub fn abandon(&mut self) {
        debug_assert!(self.in_flight > 0);
        self.in_flight -= 1;
    }

    /// Re-enqueue a failed chunk at the head with its attempt count
    /// advanced.
    pub fn push_retry(&mut self, mut chunk: Chunk) {
        chunk.attempt += 1;
        chunk.state = ChunkState::Pending;
        self.pending.push_front(chunk);
    }
}
