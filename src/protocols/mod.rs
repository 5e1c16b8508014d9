/*
 * swiftfetch - High-throughput multi-protocol transfer engine.
 * Copyright (C) 2025  swiftfetch contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 */

//! Uniform probe + range-read contract over HTTP, FTP, and SSH transports.
//!
//! Every transport implements [`ProtocolHandler`]; the engine treats the
//! built-in handlers and any externally registered ones identically through
//! the [`HandlerRegistry`].

mod ftp;
mod http;
mod ssh;

pub use ftp::FtpHandler;
pub use http::HttpHandler;
pub use ssh::{SshHandler, SshMode};

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::error::{FetchError, FetchResult};
use crate::tls::TlsSummary;

/// A parsed fetch target. Immutable for the duration of a fetch.
#[derive(Debug, Clone)]
pub struct Target {
    url: Url,
}

impl Target {
    pub fn parse(raw: &str) -> FetchResult<Self> {
        let url = Url::parse(raw).map_err(|_| FetchError::UnsupportedScheme {
            scheme: raw.split(':').next().unwrap_or(raw).to_string(),
        })?;
        Ok(Self { url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    pub fn port(&self) -> Option<u16> {
        self.url.port_or_known_default()
    }

    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }

    /// Last path segment, used to infer an output filename.
    pub fn filename(&self) -> String {
        self.url
            .path_segments()
            .and_then(|segments| segments.filter(|s| !s.is_empty()).next_back())
            .map(str::to_string)
            .unwrap_or_else(|| "download".to_string())
    }
}

/// Per-fetch transport configuration shared by all handlers.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub proxy: Option<String>,
    pub verify_tls: bool,
    /// Pinned certificate fingerprints (hostname -> SHA-256 hex).
    pub pins: HashMap<String, String>,
    pub user_agent: String,
    /// Attempt HTTP/3 when the server advertises it.
    pub http3: bool,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            proxy: None,
            verify_tls: true,
            pins: HashMap::new(),
            user_agent: format!("swiftfetch/{}", env!("CARGO_PKG_VERSION")),
            http3: false,
        }
    }
}

/// Resolved per-request headers and cookies, supplied by the caller.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub headers: Vec<(String, String)>,
    pub cookie: Option<String>,
}

/// Result of a metadata probe.
#[derive(Debug, Clone, Default)]
pub struct ProbeReport {
    /// Negotiated protocol label, e.g. "HTTP/2" or "SFTP".
    pub protocol: String,
    pub peer_addr: Option<SocketAddr>,
    /// Server identity string, if the transport exposes one.
    pub server: Option<String>,
    pub latency: Duration,
    pub tls: Option<TlsSummary>,
    /// Total content length; None when the server does not report one.
    pub content_length: Option<u64>,
    pub supports_range: bool,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    /// The server advertised HTTP/3 (Alt-Svc or explicit).
    pub h3_advertised: bool,
}

/// Static capabilities a handler advertises for its schemes.
#[derive(Debug, Clone, Copy)]
pub struct HandlerCapabilities {
    pub supports_range: bool,
    pub supports_resume: bool,
    /// Upper bound on parallel streams; the scheduler clamps N to this.
    pub max_concurrent_streams: Option<usize>,
}

/// A pull stream of body bytes.
pub type ByteStream = Pin<Box<dyn Stream<Item = FetchResult<Bytes>> + Send>>;

/// One logical connection to the remote. Handlers for stateless protocols
/// may hand out cheap clones of a shared client.
#[async_trait]
pub trait ProtocolSession: Send {
    /// Stream exactly `length` bytes starting at `offset`. Streams that end
    /// early are surfaced by the scheduler as short reads.
    async fn read_range(&mut self, offset: u64, length: u64) -> FetchResult<ByteStream>;

    /// Stream the whole object to EOF.
    async fn read_all(&mut self) -> FetchResult<ByteStream>;

    /// Tear down the connection. Errors during close are ignored.
    async fn close(&mut self);
}

/// Uniform transport contract: probe, open, ranged reads.
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    /// URL schemes this handler claims.
    fn schemes(&self) -> &'static [&'static str];

    fn capabilities(&self) -> HandlerCapabilities;

    /// Lightweight metadata request: protocol, size, range support, TLS.
    async fn probe(&self, target: &Target, request: &RequestOptions) -> FetchResult<ProbeReport>;

    /// Open a connection-like session for reads.
    async fn open(
        &self,
        target: &Target,
        request: &RequestOptions,
    ) -> FetchResult<Box<dyn ProtocolSession>>;
}

/// Registry mapping URL schemes to handlers.
pub struct HandlerRegistry {
    handlers: Vec<Arc<dyn ProtocolHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// Registry with the built-in HTTP/FTP/SFTP/SCP handlers.
    pub fn with_defaults(transport: &TransportOptions) -> FetchResult<Self> {
        let mut registry = Self::new();
        registry.register(Arc::new(HttpHandler::new(transport)?));
        registry.register(Arc::new(FtpHandler::new(transport)));
        registry.register(Arc::new(SshHandler::new(SshMode::Sftp, transport)));
        registry.register(Arc::new(SshHandler::new(SshMode::Scp, transport)));
        Ok(registry)
    }

    /// Later registrations win, so external handlers can override the
    /// built-ins for a scheme.
    pub fn register(&mut self, handler: Arc<dyn ProtocolHandler>) {
        self.handlers.push(handler);
    }

    pub fn resolve(&self, scheme: &str) -> FetchResult<Arc<dyn ProtocolHandler>> {
        self.handlers
            .iter()
            .rev()
            .find(|h| h.schemes().contains(&scheme))
            .cloned()
            .ok_or_else(|| FetchError::UnsupportedScheme {
                scheme: scheme.to_string(),
            })
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
