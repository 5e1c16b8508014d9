/*
 * swiftfetch - High-throughput multi-protocol transfer engine.
 * Copyright (C) 2025  swiftfetch contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 */

//! Bounded-concurrency scheduler for parallel range reads.
//!
//! Drives chunks from the pending queue through protocol sessions,
//! feeding throughput samples to the estimator, consulting the chunker
//! for split sizes and the optimizer for the admission bound, and routing
//! failures through the retry classifier.

use bytes::{Bytes, BytesMut};
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use std::io::SeekFrom;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::bandwidth::BandwidthEstimator;
use super::chunk::{Chunk, ChunkQueue};
use super::chunker::AdaptiveChunker;
use super::integrity::IntegrityVerifier;
use super::optimizer::{ConnectionOptimizer, TICK_INTERVAL};
use super::plan::FetchPlan;
use super::retry::{RetryClassifier, RetryDecision};
use crate::error::{FetchError, FetchResult};
use crate::events::{ConcurrencyReason, EventSink, Progress};
use crate::protocols::{ProtocolHandler, ProtocolSession, RequestOptions, Target};

/// Grace period for in-flight chunks on cancellation or fatal error.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Everything the scheduler needs besides the plan.
pub struct SchedulerContext {
    pub handler: Arc<dyn ProtocolHandler>,
    pub target: Target,
    pub request: RequestOptions,
    /// Per-chunk stall timeout.
    pub stall_timeout: Duration,
    pub events: Arc<dyn EventSink>,
    pub cancel: CancellationToken,
}

/// Summary of a completed parallel run.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerStats {
    /// Bytes landed by this run (excluding any resume prefix).
    pub bytes: u64,
    /// Peak simultaneous connections observed.
    pub connections_used: usize,
    /// Total chunk attempts, including retries.
    pub attempts: u64,
}

type WorkerOutput = Result<Landed, (Chunk, FetchError)>;

struct Landed {
    chunk: Chunk,
    data: Bytes,
    duration: Duration,
    session: Box<dyn ProtocolSession>,
}

/// Run a PARALLEL plan to completion.
///
/// The verifier is advanced in offset order as chunks land; on success the
/// queue's landed set partitions [resume_offset, total).
pub async fn run_parallel(
    plan: &FetchPlan,
    ctx: &SchedulerContext,
    verifier: &mut IntegrityVerifier,
) -> FetchResult<SchedulerStats> {
    let total = plan
        .total_size
        .expect("parallel plans always carry a total size");

    let mut queue = ChunkQueue::seed(plan.resume_offset, total);
    let mut chunker = AdaptiveChunker::with_bounds(plan.min_chunk, plan.max_chunk);
    let mut optimizer = ConnectionOptimizer::new(plan.max_connections);
    let estimator = Arc::new(Mutex::new(BandwidthEstimator::new()));
    let classifier = RetryClassifier::new();

    if let Some(limit) = ctx.handler.capabilities().max_concurrent_streams {
        if let Some(clamped) = optimizer.clamp_max(limit) {
            ctx.events
                .on_concurrency_changed(clamped, ConcurrencyReason::Clamp);
        }
    }

    let mut workers: JoinSet<WorkerOutput> = JoinSet::new();
    let mut idle_sessions: Vec<Box<dyn ProtocolSession>> = Vec::new();
    let mut delayed: FuturesUnordered<futures::future::BoxFuture<'static, Chunk>> =
        FuturesUnordered::new();
    let mut tick = tokio::time::interval(TICK_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut stats = SchedulerStats {
        bytes: 0,
        connections_used: 0,
        attempts: 0,
    };

    let result = 'run: loop {
        // Admission: fill the pool up to the advisory target. The target
        // is re-read every pass, so decreases take effect lazily without
        // cancelling in-flight work.
        while queue.has_pending() && queue.in_flight() < optimizer.target() {
            let split = chunker.next_size(estimator.lock().unwrap().smoothed_rate());
            let Some(chunk) = queue.take_next(split, plan.min_chunk, optimizer.target()) else {
                break;
            };
            stats.attempts += 1;

            let session = match idle_sessions.pop() {
                Some(session) => session,
                None => match ctx.handler.open(&ctx.target, &ctx.request).await {
                    Ok(session) => session,
                    Err(err) => {
                        queue.abandon();
                        match classifier.classify(&err, chunk.attempt) {
                            RetryDecision::Fail { .. } => break 'run Err(err),
                            decision => {
                                handle_retry(
                                    decision,
                                    chunk,
                                    &mut queue,
                                    &mut optimizer,
                                    &mut delayed,
                                    ctx,
                                );
                                continue;
                            }
                        }
                    }
                },
            };

            stats.connections_used = stats.connections_used.max(queue.in_flight());
            workers.spawn(run_chunk(
                chunk,
                session,
                plan.partial_path.clone(),
                ctx.stall_timeout,
                estimator.clone(),
                ctx.cancel.clone(),
            ));
        }

        if queue.is_drained() && delayed.is_empty() {
            break 'run Ok(());
        }

        tokio::select! {
            biased;

            _ = ctx.cancel.cancelled() => {
                break 'run Err(FetchError::Cancelled);
            }

            Some(joined) = workers.join_next(), if !workers.is_empty() => {
                let output = match joined {
                    Ok(output) => output,
                    Err(join_err) => {
                        break 'run Err(FetchError::transient(format!("chunk task failed: {join_err}")));
                    }
                };
                match output {
                    Ok(landed) => {
                        queue.complete(&landed.chunk);
                        stats.bytes += landed.chunk.length;
                        verifier.submit(landed.chunk.offset, landed.data);
                        ctx.events.on_chunk_landed(
                            landed.chunk.offset,
                            landed.chunk.length,
                            landed.duration,
                        );
                        // Keep the session for reuse unless the pool
                        // already covers the target.
                        let mut session = landed.session;
                        if idle_sessions.len() + queue.in_flight() < optimizer.target() {
                            idle_sessions.push(session);
                        } else {
                            session.close().await;
                        }
                    }
                    Err((chunk, err)) => {
                        queue.abandon();
                        match classifier.classify(&err, chunk.attempt) {
                            RetryDecision::Fail { .. } => {
                                break 'run Err(err);
                            }
                            decision => handle_retry(
                                decision,
                                chunk,
                                &mut queue,
                                &mut optimizer,
                                &mut delayed,
                                ctx,
                            ),
                        }
                    }
                }
            }

            Some(chunk) = delayed.next(), if !delayed.is_empty() => {
                queue.push_retry(chunk);
            }

            _ = tick.tick() => {
                let rate = estimator.lock().unwrap().smoothed_rate();
                if let Some((target, direction)) = optimizer.on_tick(rate) {
                    let reason = match direction {
                        super::optimizer::Direction::Up => ConcurrencyReason::Ramp,
                        _ => ConcurrencyReason::Backoff,
                    };
                    ctx.events.on_concurrency_changed(target, reason);
                }

                let landed = plan.resume_offset + queue.landed_bytes();
                let eta = estimator.lock().unwrap().eta(total - landed);
                ctx.events.on_progress(&Progress {
                    bytes: landed,
                    total: Some(total),
                    rate,
                    eta,
                });
            }
        }
    };

    match result {
        Ok(()) => {
            for mut session in idle_sessions {
                session.close().await;
            }
            Ok(stats)
        }
        Err(err) => {
            drain_with_grace(&mut workers).await;
            for mut session in idle_sessions {
                session.close().await;
            }
            Err(err)
        }
    }
}

/// Route a retryable failure: throttle the optimizer when the server asked
/// for it, then schedule the chunk's return to the queue.
fn handle_retry(
    decision: RetryDecision,
    chunk: Chunk,
    queue: &mut ChunkQueue,
    optimizer: &mut ConnectionOptimizer,
    delayed: &mut FuturesUnordered<futures::future::BoxFuture<'static, Chunk>>,
    ctx: &SchedulerContext,
) {
    if decision.is_throttle() {
        let target = optimizer.on_throttle();
        ctx.events
            .on_concurrency_changed(target, ConcurrencyReason::Throttle);
    }

    match decision {
        RetryDecision::RetryNow { category } => {
            ctx.events.on_retry(category, Duration::ZERO, chunk.attempt);
            queue.push_retry(chunk);
        }
        RetryDecision::RetryAfter { delay, category } => {
            ctx.events.on_retry(category, delay, chunk.attempt);
            delayed.push(Box::pin(async move {
                tokio::time::sleep(delay).await;
                chunk
            }));
        }
        RetryDecision::Fail { .. } => unreachable!("fail handled by caller"),
    }
}

/// Give in-flight chunks a short grace period, then abandon them.
async fn drain_with_grace(workers: &mut JoinSet<WorkerOutput>) {
    let _ = tokio::time::timeout(DRAIN_GRACE, async {
        while workers.join_next().await.is_some() {}
    })
    .await;
    workers.abort_all();
    while workers.join_next().await.is_some() {}
}

/// Read one chunk through a session, write it at its file offset, and
/// hand the bytes back for in-order hashing.
async fn run_chunk(
    chunk: Chunk,
    mut session: Box<dyn ProtocolSession>,
    partial_path: std::path::PathBuf,
    stall_timeout: Duration,
    estimator: Arc<Mutex<BandwidthEstimator>>,
    cancel: CancellationToken,
) -> WorkerOutput {
    let started = Instant::now();

    let result = read_chunk_bytes(&chunk, &mut *session, stall_timeout, &estimator, &cancel).await;
    let data = match result {
        Ok(data) => data,
        Err(err) => {
            session.close().await;
            return Err((chunk, err));
        }
    };

    // Positioned write into the pre-sized assembly file.
    if let Err(err) = write_at(&partial_path, chunk.offset, &data).await {
        session.close().await;
        return Err((chunk, err));
    }

    Ok(Landed {
        duration: started.elapsed(),
        chunk,
        data,
        session,
    })
}

async fn read_chunk_bytes(
    chunk: &Chunk,
    session: &mut dyn ProtocolSession,
    stall_timeout: Duration,
    estimator: &Mutex<BandwidthEstimator>,
    cancel: &CancellationToken,
) -> FetchResult<Bytes> {
    let mut stream = session.read_range(chunk.offset, chunk.length).await?;
    let mut buf = BytesMut::with_capacity(chunk.length as usize);

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            next = tokio::time::timeout(stall_timeout, stream.next()) => next,
        };

        match next {
            Ok(Some(Ok(bytes))) => {
                estimator.lock().unwrap().record(bytes.len() as u64);
                buf.extend_from_slice(&bytes);
                if buf.len() as u64 >= chunk.length {
                    break;
                }
            }
            Ok(Some(Err(err))) => return Err(err),
            Ok(None) => break,
            Err(_) => {
                return Err(FetchError::transient(format!(
                    "chunk at offset {} stalled for {:?}",
                    chunk.offset, stall_timeout
                )))
            }
        }
    }

    let got = buf.len() as u64;
    if got == 0 && chunk.length > 0 {
        return Err(FetchError::transient("empty range read"));
    }
    if got < chunk.length {
        return Err(FetchError::degraded(format!(
            "short range read: wanted {} bytes at offset {}, got {got}",
            chunk.length, chunk.offset
        )));
    }

    buf.truncate(chunk.length as usize);
    Ok(buf.freeze())
}

async fn write_at(path: &std::path::Path, offset: u64, data: &[u8]) -> FetchResult<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .open(path)
        .await
        .map_err(|e| FetchError::io(path.display().to_string(), e))?;
    file.seek(SeekFrom::Start(offset))
        .await
        .map_err(|e| FetchError::io(path.display().to_string(), e))?;
    file.write_all(data)
        .await
        .map_err(|e| FetchError::io(path.display().to_string(), e))?;
    Ok(())
}
