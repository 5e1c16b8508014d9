/*
 * swiftfetch - High-throughput multi-protocol transfer engine.
 * Copyright (C) 2025  swiftfetch contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 */

//! Top-level fetch state machine.
//!
//! probe -> plan -> execute -> verify -> finalize, with mirror selection,
//! crash-safe resume, and degradation from parallel ranges to a single
//! stream when the server misbehaves.

use futures::StreamExt;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use super::bandwidth::BandwidthEstimator;
use super::integrity::{IntegrityVerifier, EMPTY_SHA256};
use super::plan::{FetchPlan, PartialMeta, TransferMode, Validators};
use super::retry::{RetryClassifier, RetryDecision};
use super::scheduler::{self, SchedulerContext};
use super::{FetchFailure, FetchOutcome, FetchReport, FetchRequest};
use crate::error::{FetchError, FetchResult};
use crate::events::{EventSink, NullSink, Progress};
use crate::protocols::{
    HandlerRegistry, ProbeReport, ProtocolHandler, RequestOptions, Target, TransportOptions,
};

/// Drives fetches end to end. Handlers and the event sink are injected at
/// construction; per-fetch state lives inside each call.
pub struct FetchController {
    events: Arc<dyn EventSink>,
    cancel: CancellationToken,
    extra_handlers: Vec<Arc<dyn ProtocolHandler>>,
}

impl FetchController {
    pub fn new(events: Arc<dyn EventSink>, cancel: CancellationToken) -> Self {
        Self {
            events,
            cancel,
            extra_handlers: Vec::new(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(Arc::new(NullSink), CancellationToken::new())
    }

    /// Register an external protocol handler. Registered handlers win over
    /// the built-ins for the schemes they claim.
    pub fn register_handler(&mut self, handler: Arc<dyn ProtocolHandler>) {
        self.extra_handlers.push(handler);
    }

    /// Run a fetch to its terminal record.
    pub async fn fetch(&self, request: FetchRequest) -> FetchOutcome {
        let outcome = match self.run(&request).await {
            Ok(report) => Ok(report),
            Err(err) => Err(self.failure_record(&request, err)),
        };
        self.events.on_complete(&outcome);
        outcome
    }

    async fn run(&self, request: &FetchRequest) -> FetchResult<FetchReport> {
        let started = Instant::now();
        let transport = transport_options(request);
        let mut registry = HandlerRegistry::with_defaults(&transport)?;
        for handler in &self.extra_handlers {
            registry.register(handler.clone());
        }
        let request_options = RequestOptions {
            headers: request.headers.clone(),
            cookie: request.cookie.clone(),
        };

        // PROBING (mirror requests fan out and keep the winner).
        let (target, handler, probe) = self
            .probe_targets(request, &registry, &request_options)
            .await?;
        self.events.on_probe(&probe);

        let output = match &request.output {
            Some(path) => path.clone(),
            None => PathBuf::from(target.filename()),
        };

        // PLANNING.
        let mut plan = self.build_plan(request, &target, &probe, output)?;
        self.events.on_plan(&plan);

        if plan.mode == TransferMode::Stream {
            return self
                .execute_stream(request, &target, handler, &request_options, &probe, started)
                .await;
        }

        // The empty object completes without touching the scheduler.
        if plan.total_size == Some(0) {
            return self
                .finalize_empty(request, &plan, &probe, started)
                .await;
        }

        let mut resumed_from = plan.resume_offset;
        let ctx = SchedulerContext {
            handler,
            target: target.clone(),
            request: request_options.clone(),
            stall_timeout: request.timeout,
            events: self.events.clone(),
            cancel: self.cancel.clone(),
        };

        // Resume that already covers the whole object skips execution.
        let execute = plan.total_size != Some(plan.resume_offset);

        let mut verifier = self.seed_verifier(&plan).await?;

        if execute {
            self.prepare_partial(&plan).await?;

            let result = match plan.mode {
                TransferMode::Parallel => scheduler::run_parallel(&plan, &ctx, &mut verifier)
                    .await
                    .map(|stats| stats.connections_used),
                _ => self
                    .execute_single(&plan, &ctx, &mut verifier, &probe)
                    .await
                    .map(|_| 1),
            };

            let connections_used = match result {
                Ok(n) => n,
                // Range-mode degradation: re-plan as a single stream from
                // scratch and try once more.
                Err(FetchError::ProtocolDegraded { message }) if plan.mode == TransferMode::Parallel => {
                    tracing::warn!(%message, "parallel ranges degraded, falling back to single stream");
                    plan.mode = TransferMode::Single;
                    plan.resume_offset = 0;
                    resumed_from = 0;
                    verifier = IntegrityVerifier::new();
                    self.remove_partial_files(&plan).await;
                    self.prepare_partial(&plan).await?;
                    self.events.on_plan(&plan);
                    self.execute_single(&plan, &ctx, &mut verifier, &probe)
                        .await
                        .map_err(|err| self.teardown(&plan, &verifier, err))?;
                    1
                }
                Err(err) => return Err(self.teardown(&plan, &verifier, err)),
            };

            return self
                .verify_and_finalize(
                    request,
                    &plan,
                    &probe,
                    verifier,
                    started,
                    connections_used,
                    resumed_from,
                )
                .await;
        }

        self.verify_and_finalize(request, &plan, &probe, verifier, started, 0, resumed_from)
            .await
    }

    // ------------------------------------------------------------------
    // Probing
    // ------------------------------------------------------------------

    async fn probe_targets(
        &self,
        request: &FetchRequest,
        registry: &HandlerRegistry,
        request_options: &RequestOptions,
    ) -> FetchResult<(Target, Arc<dyn ProtocolHandler>, ProbeReport)> {
        if request.urls.is_empty() {
            return Err(FetchError::transient("no URL supplied"));
        }

        let mut candidates = Vec::new();
        for raw in &request.urls {
            let target = Target::parse(raw)?;
            let handler = registry.resolve(target.scheme())?;
            candidates.push((target, handler));
        }

        if candidates.len() == 1 {
            let (target, handler) = candidates.remove(0);
            let probe = handler.probe(&target, request_options).await?;
            return Ok((target, handler, probe));
        }

        // MIRROR: probe all in parallel, keep the lowest latency; ties
        // prefer a known content length, then the lexicographic URL.
        let probes = futures::future::join_all(candidates.into_iter().map(
            |(target, handler)| async {
                let result = handler.probe(&target, request_options).await;
                (target, handler, result)
            },
        ))
        .await;

        let mut winners: Vec<_> = Vec::new();
        let mut first_error = None;
        for (target, handler, result) in probes {
            match result {
                Ok(probe) => winners.push((target, handler, probe)),
                Err(err) => {
                    tracing::debug!(url = target.as_str(), error = %err, "mirror probe failed");
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }

        winners.sort_by(|a, b| {
            a.2.latency
                .cmp(&b.2.latency)
                .then_with(|| a.2.content_length.is_none().cmp(&b.2.content_length.is_none()))
                .then_with(|| a.0.as_str().cmp(b.0.as_str()))
        });

        winners.into_iter().next().ok_or_else(|| {
            first_error.unwrap_or_else(|| FetchError::transient("all mirrors failed probing"))
        })
    }

    // ------------------------------------------------------------------
    // Planning
    // ------------------------------------------------------------------

    fn build_plan(
        &self,
        request: &FetchRequest,
        target: &Target,
        probe: &ProbeReport,
        output: PathBuf,
    ) -> FetchResult<FetchPlan> {
        let partial_path = FetchPlan::partial_path_for(&output);
        let meta_path = FetchPlan::meta_path_for(&output);

        let mode = if request.to_stdout {
            TransferMode::Stream
        } else if probe.supports_range
            && probe.content_length.is_some()
            && probe.content_length.unwrap_or(0) > request.min_chunk
            && request.max_connections > 1
        {
            TransferMode::Parallel
        } else {
            TransferMode::Single
        };

        let mut plan = FetchPlan {
            mode,
            url: target.as_str().to_string(),
            output,
            partial_path,
            meta_path,
            total_size: probe.content_length,
            resume_offset: 0,
            initial_concurrency: request.max_connections.min(8),
            max_connections: request.max_connections,
            min_chunk: request.min_chunk,
            max_chunk: request.max_chunk,
            expected_sha256: request.expected_sha256.clone(),
            validators: Validators::from_probe(probe),
        };

        if plan.mode != TransferMode::Stream {
            plan.resume_offset = self.resume_offset(request, &plan, probe);
        }

        Ok(plan)
    }

    /// Decide whether the existing partial may be continued. The meta
    /// sidecar is the authoritative witness; without matching validators
    /// the partial is discarded.
    fn resume_offset(&self, request: &FetchRequest, plan: &FetchPlan, probe: &ProbeReport) -> u64 {
        if !request.resume || !probe.supports_range {
            return 0;
        }
        let Some(total) = plan.total_size else {
            return 0;
        };
        let Ok(partial) = std::fs::metadata(&plan.partial_path) else {
            return 0;
        };
        let Some(meta) = PartialMeta::load(&plan.meta_path) else {
            return 0;
        };
        if !meta.matches(probe, total) {
            tracing::info!(
                path = %plan.partial_path.display(),
                "partial no longer matches the remote entity, starting over"
            );
            return 0;
        }
        partial.len().min(total)
    }

    // ------------------------------------------------------------------
    // Execution helpers
    // ------------------------------------------------------------------

    /// Create the assembly file (pre-sized and sparse where the kernel
    /// allows) and write the resume metadata sidecar.
    async fn prepare_partial(&self, plan: &FetchPlan) -> FetchResult<()> {
        let path = &plan.partial_path;
        if plan.resume_offset == 0 {
            let file = tokio::fs::File::create(path)
                .await
                .map_err(|e| FetchError::io(path.display().to_string(), e))?;
            if let Some(total) = plan.total_size {
                file.set_len(total)
                    .await
                    .map_err(|e| FetchError::io(path.display().to_string(), e))?;
            }
        } else if let Some(total) = plan.total_size {
            let file = tokio::fs::OpenOptions::new()
                .write(true)
                .open(path)
                .await
                .map_err(|e| FetchError::io(path.display().to_string(), e))?;
            file.set_len(total)
                .await
                .map_err(|e| FetchError::io(path.display().to_string(), e))?;
        }

        if let Some(total) = plan.total_size {
            let meta = PartialMeta::new(&plan.url, total, plan.validators.clone(), plan.max_chunk);
            meta.store(&plan.meta_path)?;
        }
        Ok(())
    }

    /// Re-hash the resumed prefix so the final digest covers every byte.
    async fn seed_verifier(&self, plan: &FetchPlan) -> FetchResult<IntegrityVerifier> {
        let mut verifier = IntegrityVerifier::new();
        if plan.resume_offset == 0 {
            return Ok(verifier);
        }

        let path = plan.partial_path.clone();
        let offset = plan.resume_offset;
        let seeded = tokio::task::spawn_blocking(move || -> std::io::Result<IntegrityVerifier> {
            use std::io::Read;
            let mut file = std::fs::File::open(&path)?;
            let mut inner = IntegrityVerifier::new();
            let mut remaining = offset;
            let mut buf = vec![0u8; 256 * 1024];
            while remaining > 0 {
                let want = (remaining as usize).min(buf.len());
                let n = file.read(&mut buf[..want])?;
                if n == 0 {
                    break;
                }
                inner.absorb(&buf[..n]);
                remaining -= n as u64;
            }
            Ok(inner)
        })
        .await
        .map_err(|e| FetchError::transient_with("verifier seed task failed", e))?
        .map_err(|e| FetchError::io(plan.partial_path.display().to_string(), e))?;

        verifier = seeded;
        Ok(verifier)
    }

    /// Single ranged/plain stream into the assembly file, with its own
    /// retry loop.
    async fn execute_single(
        &self,
        plan: &FetchPlan,
        ctx: &SchedulerContext,
        verifier: &mut IntegrityVerifier,
        probe: &ProbeReport,
    ) -> FetchResult<()> {
        let classifier = RetryClassifier::new();
        let mut estimator = BandwidthEstimator::new();
        let mut attempt = 1u32;

        loop {
            let result = self
                .single_pass(plan, ctx, verifier, probe, &mut estimator)
                .await;
            let err = match result {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };

            match classifier.classify(&err, attempt) {
                RetryDecision::Fail { .. } => return Err(err),
                RetryDecision::RetryNow { category } => {
                    self.events.on_retry(category, Duration::ZERO, attempt);
                }
                RetryDecision::RetryAfter { delay, category } => {
                    self.events.on_retry(category, delay, attempt);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancel.cancelled() => return Err(FetchError::Cancelled),
                    }
                }
            }
            attempt += 1;

            // Without range support a restart begins from byte zero.
            if !probe.supports_range {
                *verifier = IntegrityVerifier::new();
            }
        }
    }

    async fn single_pass(
        &self,
        plan: &FetchPlan,
        ctx: &SchedulerContext,
        verifier: &mut IntegrityVerifier,
        probe: &ProbeReport,
        estimator: &mut BandwidthEstimator,
    ) -> FetchResult<()> {
        let offset = verifier.cursor();
        let mut session = ctx.handler.open(&ctx.target, &ctx.request).await?;

        let mut stream = if offset > 0 && probe.supports_range {
            match plan.total_size {
                Some(total) if offset < total => session.read_range(offset, total - offset).await?,
                Some(_) => return Ok(()),
                None => session.read_all().await?,
            }
        } else {
            session.read_all().await?
        };

        let path = &plan.partial_path;
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .open(path)
            .await
            .map_err(|e| FetchError::io(path.display().to_string(), e))?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| FetchError::io(path.display().to_string(), e))?;

        let mut last_progress = Instant::now();
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => {
                    session.close().await;
                    return Err(FetchError::Cancelled);
                }
                next = tokio::time::timeout(ctx.stall_timeout, stream.next()) => next,
            };

            match next {
                Ok(Some(Ok(bytes))) => {
                    estimator.record(bytes.len() as u64);
                    file.write_all(&bytes)
                        .await
                        .map_err(|e| FetchError::io(path.display().to_string(), e))?;
                    verifier.submit(verifier.cursor(), bytes);

                    if last_progress.elapsed() >= Duration::from_millis(500) {
                        last_progress = Instant::now();
                        let done = verifier.cursor();
                        self.events.on_progress(&Progress {
                            bytes: done,
                            total: plan.total_size,
                            rate: estimator.smoothed_rate(),
                            eta: plan
                                .total_size
                                .and_then(|t| estimator.eta(t.saturating_sub(done))),
                        });
                    }
                }
                Ok(Some(Err(err))) => {
                    session.close().await;
                    return Err(err);
                }
                Ok(None) => break,
                Err(_) => {
                    session.close().await;
                    return Err(FetchError::transient(format!(
                        "stream stalled for {:?}",
                        ctx.stall_timeout
                    )));
                }
            }
        }

        session.close().await;

        // Servers without a content length define done as EOF; with one,
        // a short stream is a protocol violation.
        if let Some(total) = plan.total_size {
            if verifier.cursor() < total {
                return Err(FetchError::degraded(format!(
                    "stream ended at {} of {total} bytes",
                    verifier.cursor()
                )));
            }
            // A stream longer than the advertised size would desync the
            // assembly file.
            file.set_len(total)
                .await
                .map_err(|e| FetchError::io(path.display().to_string(), e))?;
        } else {
            let len = verifier.cursor();
            file.set_len(len)
                .await
                .map_err(|e| FetchError::io(path.display().to_string(), e))?;
        }

        Ok(())
    }

    /// STREAM mode: one pass to a stdout sink, no assembly file, no resume.
    async fn execute_stream(
        &self,
        request: &FetchRequest,
        target: &Target,
        handler: Arc<dyn ProtocolHandler>,
        request_options: &RequestOptions,
        probe: &ProbeReport,
        started: Instant,
    ) -> FetchResult<FetchReport> {
        let mut session = handler.open(target, request_options).await?;
        let mut stream = session.read_all().await?;
        let mut verifier = IntegrityVerifier::new();
        let mut estimator = BandwidthEstimator::new();
        let mut stdout = tokio::io::stdout();

        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => {
                    session.close().await;
                    return Err(FetchError::Cancelled);
                }
                next = tokio::time::timeout(request.timeout, stream.next()) => next,
            };

            match next {
                Ok(Some(Ok(bytes))) => {
                    estimator.record(bytes.len() as u64);
                    stdout
                        .write_all(&bytes)
                        .await
                        .map_err(|e| FetchError::io("stdout", e))?;
                    verifier.submit(verifier.cursor(), bytes);
                }
                Ok(Some(Err(err))) => {
                    session.close().await;
                    return Err(err);
                }
                Ok(None) => break,
                Err(_) => {
                    session.close().await;
                    return Err(FetchError::transient("stream stalled"));
                }
            }
        }

        stdout
            .flush()
            .await
            .map_err(|e| FetchError::io("stdout", e))?;
        session.close().await;

        let bytes = verifier.cursor();
        let sha256 = verifier.finalize();
        if let Some(expected) = &request.expected_sha256 {
            if !expected.eq_ignore_ascii_case(&sha256) {
                return Err(FetchError::IntegrityMismatch {
                    expected: expected.clone(),
                    actual: sha256,
                });
            }
        }

        let duration = started.elapsed();
        Ok(FetchReport {
            url: target.as_str().to_string(),
            output: None,
            bytes,
            duration,
            avg_throughput: bytes as f64 / duration.as_secs_f64().max(0.001),
            sha256,
            protocol_used: probe.protocol.clone(),
            connections_used: 1,
            resumed: false,
        })
    }

    // ------------------------------------------------------------------
    // Verify / finalize / teardown
    // ------------------------------------------------------------------

    async fn finalize_empty(
        &self,
        request: &FetchRequest,
        plan: &FetchPlan,
        probe: &ProbeReport,
        started: Instant,
    ) -> FetchResult<FetchReport> {
        if let Some(expected) = &request.expected_sha256 {
            if !expected.eq_ignore_ascii_case(EMPTY_SHA256) {
                return Err(FetchError::IntegrityMismatch {
                    expected: expected.clone(),
                    actual: EMPTY_SHA256.to_string(),
                });
            }
        }

        tokio::fs::File::create(&plan.output)
            .await
            .map_err(|e| FetchError::io(plan.output.display().to_string(), e))?;
        self.remove_partial_files(plan).await;

        let duration = started.elapsed();
        Ok(FetchReport {
            url: plan.url.clone(),
            output: Some(plan.output.clone()),
            bytes: 0,
            duration,
            avg_throughput: 0.0,
            sha256: EMPTY_SHA256.to_string(),
            protocol_used: probe.protocol.clone(),
            connections_used: 0,
            resumed: false,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn verify_and_finalize(
        &self,
        request: &FetchRequest,
        plan: &FetchPlan,
        probe: &ProbeReport,
        verifier: IntegrityVerifier,
        started: Instant,
        connections_used: usize,
        resumed_from: u64,
    ) -> FetchResult<FetchReport> {
        // VERIFYING.
        let landed = verifier.cursor();
        if !verifier.is_consistent() {
            return Err(FetchError::degraded("landed chunks left a gap"));
        }
        if let Some(total) = plan.total_size {
            if landed != total {
                return Err(FetchError::degraded(format!(
                    "landed {landed} of {total} bytes"
                )));
            }
        }

        let sha256 = verifier.finalize();
        if let Some(expected) = &request.expected_sha256 {
            if !expected.eq_ignore_ascii_case(&sha256) {
                // A corrupt partial must not survive for resume.
                self.remove_partial_files(plan).await;
                return Err(FetchError::IntegrityMismatch {
                    expected: expected.clone(),
                    actual: sha256,
                });
            }
        }

        // FINALIZING: fsync, then the atomic rename is the last action.
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&plan.partial_path)
            .await
            .map_err(|e| FetchError::io(plan.partial_path.display().to_string(), e))?;
        file.sync_all()
            .await
            .map_err(|e| FetchError::io(plan.partial_path.display().to_string(), e))?;
        drop(file);

        tokio::fs::rename(&plan.partial_path, &plan.output)
            .await
            .map_err(|e| FetchError::io(plan.output.display().to_string(), e))?;
        let _ = tokio::fs::remove_file(&plan.meta_path).await;

        let duration = started.elapsed();
        let transferred = landed - resumed_from;
        Ok(FetchReport {
            url: plan.url.clone(),
            output: Some(plan.output.clone()),
            bytes: landed,
            duration,
            avg_throughput: transferred as f64 / duration.as_secs_f64().max(0.001),
            sha256,
            protocol_used: probe.protocol.clone(),
            connections_used,
            resumed: resumed_from > 0,
        })
    }

    /// Leave the partial in a resumable state: truncate to the verified
    /// contiguous prefix, or remove it when nothing usable landed.
    fn teardown(&self, plan: &FetchPlan, verifier: &IntegrityVerifier, err: FetchError) -> FetchError {
        let cursor = verifier.cursor();
        let keep = cursor > 0
            && plan.validators.usable()
            && !matches!(err, FetchError::IntegrityMismatch { .. });

        if keep {
            if let Ok(file) = std::fs::OpenOptions::new()
                .write(true)
                .open(&plan.partial_path)
            {
                let _ = file.set_len(cursor);
                let _ = file.sync_all();
            }
        } else {
            let _ = std::fs::remove_file(&plan.partial_path);
            let _ = std::fs::remove_file(&plan.meta_path);
        }
        err
    }

    async fn remove_partial_files(&self, plan: &FetchPlan) {
        let _ = tokio::fs::remove_file(&plan.partial_path).await;
        let _ = tokio::fs::remove_file(&plan.meta_path).await;
    }

    /// Build the terminal failure record from whatever survived on disk.
    fn failure_record(&self, request: &FetchRequest, err: FetchError) -> FetchFailure {
        let (partial_bytes, can_resume) = self
            .partial_state(request)
            .unwrap_or((0, false));

        FetchFailure {
            kind: err.kind(),
            message: err.to_string(),
            partial_bytes,
            can_resume,
        }
    }

    fn partial_state(&self, request: &FetchRequest) -> Option<(u64, bool)> {
        let output = match &request.output {
            Some(path) => path.clone(),
            None => {
                let target = Target::parse(request.urls.first()?).ok()?;
                PathBuf::from(target.filename())
            }
        };
        let partial = FetchPlan::partial_path_for(&output);
        let meta_path = FetchPlan::meta_path_for(&output);

        let size = std::fs::metadata(&partial).ok()?.len();
        let resumable = PartialMeta::load(&meta_path)
            .map(|meta| meta.validators.usable())
            .unwrap_or(false);
        Some((size, size > 0 && resumable))
    }
}

fn transport_options(request: &FetchRequest) -> TransportOptions {
    TransportOptions {
        timeout: request.timeout,
        connect_timeout: request.connect_timeout,
        proxy: request.proxy.clone(),
        verify_tls: request.verify_tls,
        pins: request.pins.clone(),
        user_agent: request.user_agent.clone(),
        http3: request.http3,
    }
}

/// Probe a single URL without transferring anything.
pub async fn probe_only(request: &FetchRequest) -> FetchResult<ProbeReport> {
    let transport = transport_options(request);
    let registry = HandlerRegistry::with_defaults(&transport)?;
    let target = Target::parse(
        request
            .urls
            .first()
            .ok_or_else(|| FetchError::transient("no URL supplied"))?,
    )?;
    let handler = registry.resolve(target.scheme())?;
    handler
        .probe(
            &target,
            &RequestOptions {
                headers: request.headers.clone(),
                cookie: request.cookie.clone(),
            },
        )
        .await
}
