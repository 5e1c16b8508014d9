/*
 * swiftfetch - High-throughput multi-protocol transfer engine.
 * Copyright (C) 2025  swiftfetch contributors
 */

//! HTTP/1.1 and HTTP/2 transport (HTTP/3 behind the `http3` feature).

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{header, Client, StatusCode};
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::{
    ByteStream, HandlerCapabilities, ProbeReport, ProtocolHandler, ProtocolSession,
    RequestOptions, Target, TransportOptions,
};
use crate::error::{FetchError, FetchResult};
use crate::tls::TlsInspector;

/// Attempts for the probe itself when the server answers 429/5xx.
const PROBE_RETRIES: u32 = 3;
/// Largest probe Retry-After we will sleep on.
const PROBE_MAX_RETRY_AFTER: Duration = Duration::from_secs(120);

/// HTTP transport over a pooled reqwest client.
pub struct HttpHandler {
    client: Client,
    transport: TransportOptions,
    inspector: TlsInspector,
    /// Hosts that advertised HTTP/3 via Alt-Svc during a probe.
    h3_hosts: Mutex<HashSet<String>>,
}

impl HttpHandler {
    pub fn new(transport: &TransportOptions) -> FetchResult<Self> {
        let mut builder = Client::builder()
            .pool_max_idle_per_host(16)
            .pool_idle_timeout(Duration::from_secs(90))
            .connect_timeout(transport.connect_timeout)
            .tcp_nodelay(true)
            .tcp_keepalive(Some(Duration::from_secs(15)))
            .user_agent(transport.user_agent.clone())
            .http2_adaptive_window(true)
            .http2_keep_alive_interval(Some(Duration::from_secs(10)))
            .http2_keep_alive_timeout(Duration::from_secs(20));

        if !transport.verify_tls {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(proxy) = &transport.proxy {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|e| FetchError::transient_with("invalid proxy", e))?;
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|e| FetchError::transient_with("failed to build HTTP client", e))?;

        let inspector = TlsInspector::new(
            transport.verify_tls,
            transport.pins.clone(),
            transport.connect_timeout,
        );

        Ok(Self {
            client,
            transport: transport.clone(),
            inspector,
            h3_hosts: Mutex::new(HashSet::new()),
        })
    }

    fn apply_request_options(
        &self,
        mut req: reqwest::RequestBuilder,
        request: &RequestOptions,
    ) -> reqwest::RequestBuilder {
        for (name, value) in &request.headers {
            req = req.header(name, value);
        }
        if let Some(cookie) = &request.cookie {
            req = req.header(header::COOKIE, cookie);
        }
        req
    }

    fn want_h3(&self, host: &str) -> bool {
        self.transport.http3 && self.h3_hosts.lock().unwrap().contains(host)
    }

    /// One probe round: HEAD, falling back to a 1-byte range GET for
    /// servers that reject HEAD. Latency covers the whole exchange so
    /// mirror ranking sees slow endpoints as slow.
    async fn probe_once(
        &self,
        target: &Target,
        request: &RequestOptions,
    ) -> FetchResult<(reqwest::Response, Duration)> {
        let started = Instant::now();
        let req = self
            .apply_request_options(self.client.head(target.as_str()), request)
            .timeout(self.transport.timeout);
        let resp = req.send().await.map_err(FetchError::from_reqwest)?;

        if matches!(resp.status().as_u16(), 403 | 405 | 501) {
            let req = self
                .apply_request_options(self.client.get(target.as_str()), request)
                .header(header::RANGE, "bytes=0-0")
                .timeout(self.transport.timeout);
            let resp = req.send().await.map_err(FetchError::from_reqwest)?;
            return Ok((resp, started.elapsed()));
        }

        Ok((resp, started.elapsed()))
    }

    /// Confirm advertised range support with a 1-byte request; only a 206
    /// counts.
    async fn confirm_range_support(
        &self,
        target: &Target,
        request: &RequestOptions,
    ) -> FetchResult<bool> {
        let req = self
            .apply_request_options(self.client.get(target.as_str()), request)
            .header(header::RANGE, "bytes=0-0")
            .timeout(self.transport.timeout);
        let resp = req.send().await.map_err(FetchError::from_reqwest)?;
        Ok(resp.status() == StatusCode::PARTIAL_CONTENT)
    }
}

#[async_trait]
impl ProtocolHandler for HttpHandler {
    fn schemes(&self) -> &'static [&'static str] {
        &["http", "https"]
    }

    fn capabilities(&self) -> HandlerCapabilities {
        HandlerCapabilities {
            supports_range: true,
            supports_resume: true,
            max_concurrent_streams: None,
        }
    }

    async fn probe(&self, target: &Target, request: &RequestOptions) -> FetchResult<ProbeReport> {
        // TLS inspection runs on a secondary socket alongside the probe.
        // Failure is fatal only when a pin must be checked.
        let tls = if target.scheme() == "https" {
            let port = target.port().unwrap_or(443);
            match self.inspector.inspect(target.host(), port).await {
                Ok(summary) => Some(summary),
                Err(err @ FetchError::PinMismatch { .. }) => return Err(err),
                Err(err) if self.inspector.has_pin(target.host()) => return Err(err),
                Err(err) => {
                    tracing::debug!(host = target.host(), error = %err, "TLS inspection failed");
                    None
                }
            }
        } else {
            None
        };

        let mut attempt = 0u32;
        let (resp, latency) = loop {
            let (resp, latency) = self.probe_once(target, request).await?;
            let status = resp.status().as_u16();

            if matches!(status, 429 | 500 | 502 | 503) && attempt < PROBE_RETRIES {
                attempt += 1;
                let delay = parse_retry_after(resp.headers())
                    .filter(|d| *d <= PROBE_MAX_RETRY_AFTER)
                    .unwrap_or_else(|| Duration::from_secs(1 << (attempt - 1).min(5)));
                tokio::time::sleep(delay).await;
                continue;
            }
            if status >= 400 {
                return Err(FetchError::from_status(
                    status,
                    parse_retry_after(resp.headers()),
                ));
            }
            break (resp, latency);
        };

        let headers = resp.headers();
        let h3_advertised = headers
            .get(header::ALT_SVC)
            .and_then(|v| v.to_str().ok())
            .map(alt_svc_advertises_h3)
            .unwrap_or(false);

        if h3_advertised {
            self.h3_hosts
                .lock()
                .unwrap()
                .insert(target.host().to_string());
        }

        // A 206 from the HEAD fallback reports the partial size; the full
        // size lives in Content-Range.
        let content_length = if resp.status() == StatusCode::PARTIAL_CONTENT {
            headers
                .get(header::CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range_total)
        } else {
            headers
                .get(header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
        };

        let advertises_ranges = headers
            .get(header::ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("bytes"))
            .unwrap_or(false);

        let mut report = ProbeReport {
            protocol: version_label(resp.version(), h3_advertised, self.transport.http3),
            peer_addr: resp.remote_addr(),
            server: headers
                .get(header::SERVER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            latency,
            tls,
            content_length,
            supports_range: false,
            content_type: headers
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            etag: headers
                .get(header::ETAG)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            last_modified: headers
                .get(header::LAST_MODIFIED)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            h3_advertised,
        };

        // Range support needs both the advertisement and a confirming 206.
        if resp.status() == StatusCode::PARTIAL_CONTENT {
            report.supports_range = true;
        } else if advertises_ranges {
            report.supports_range = self.confirm_range_support(target, request).await?;
        }

        Ok(report)
    }

    async fn open(
        &self,
        target: &Target,
        request: &RequestOptions,
    ) -> FetchResult<Box<dyn ProtocolSession>> {
        Ok(Box::new(HttpSession {
            client: self.client.clone(),
            url: target.as_str().to_string(),
            request: request.clone(),
            prefer_h3: self.want_h3(target.host()),
        }))
    }
}

/// One logical HTTP connection. The pooled client multiplexes transport
/// connections underneath; the session carries per-request state.
struct HttpSession {
    client: Client,
    url: String,
    request: RequestOptions,
    #[allow(dead_code)]
    prefer_h3: bool,
}

impl HttpSession {
    fn build_get(&self) -> reqwest::RequestBuilder {
        let mut req = self.client.get(&self.url);
        for (name, value) in &self.request.headers {
            req = req.header(name, value);
        }
        if let Some(cookie) = &self.request.cookie {
            req = req.header(header::COOKIE, cookie);
        }
        #[cfg(feature = "http3")]
        if self.prefer_h3 {
            req = req.version(reqwest::Version::HTTP_3);
        }
        req
    }
}

#[async_trait]
impl ProtocolSession for HttpSession {
    async fn read_range(&mut self, offset: u64, length: u64) -> FetchResult<ByteStream> {
        let end = offset + length - 1;
        let resp = self
            .build_get()
            .header(header::RANGE, format!("bytes={offset}-{end}"))
            .send()
            .await
            .map_err(FetchError::from_reqwest)?;

        match resp.status() {
            StatusCode::PARTIAL_CONTENT => {}
            StatusCode::OK => {
                // Full-body answer to a range request: the plan must
                // degrade to a single stream.
                return Err(FetchError::degraded(
                    "server returned the full body for a range request",
                ));
            }
            status => {
                return Err(FetchError::from_status(
                    status.as_u16(),
                    parse_retry_after(resp.headers()),
                ));
            }
        }

        Ok(Box::pin(
            resp.bytes_stream().map(|r| r.map_err(FetchError::from_reqwest)),
        ))
    }

    async fn read_all(&mut self) -> FetchResult<ByteStream> {
        let resp = self
            .build_get()
            .send()
            .await
            .map_err(FetchError::from_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::from_status(
                status.as_u16(),
                parse_retry_after(resp.headers()),
            ));
        }

        Ok(Box::pin(
            resp.bytes_stream().map(|r| r.map_err(FetchError::from_reqwest)),
        ))
    }

    async fn close(&mut self) {
        // Connections return to the pool on drop.
    }
}

/// Parse the seconds form of Retry-After. The HTTP-date form is rare on
/// throttle responses and is treated as absent.
fn parse_retry_after(headers: &header::HeaderMap) -> Option<Duration> {
    headers
        .get(header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Total size from a Content-Range header ("bytes 0-0/12345").
fn parse_content_range_total(value: &str) -> Option<u64> {
    value.rsplit('/').next()?.trim().parse().ok()
}

/// Whether an Alt-Svc header advertises HTTP/3.
fn alt_svc_advertises_h3(value: &str) -> bool {
    value
        .split(',')
        .filter_map(|entry| entry.trim().split('=').next())
        .any(|proto| {
            let proto = proto.trim_matches('"');
            proto == "h3" || proto.starts_with("h3-")
        })
}

fn version_label(version: reqwest::Version, h3_advertised: bool, h3_enabled: bool) -> String {
    if h3_advertised && h3_enabled && cfg!(feature = "http3") {
        return "HTTP/3".to_string();
    }
    match version {
        reqwest::Version::HTTP_3 => "HTTP/3".to_string(),
        reqwest::Version::HTTP_2 => "HTTP/2".to_string(),
        reqwest::Version::HTTP_11 => "HTTP/1.1".to_string(),
        reqwest::Version::HTTP_10 => "HTTP/1.0".to_string(),
        other => format!("{other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alt_svc_detection() {
        assert!(alt_svc_advertises_h3("h3=\":443\"; ma=86400"));
        assert!(alt_svc_advertises_h3("h3-29=\":443\", h2=\":443\""));
        assert!(alt_svc_advertises_h3("h2=\":443\", h3=\":443\""));
        assert!(!alt_svc_advertises_h3("h2=\":443\""));
        assert!(!alt_svc_advertises_h3("clear"));
    }

    #[test]
    fn test_content_range_total() {
        assert_eq!(parse_content_range_total("bytes 0-0/12345"), Some(12345));
        assert_eq!(parse_content_range_total("bytes 5-9/100"), Some(100));
        assert_eq!(parse_content_range_total("bytes 0-0/*"), None);
    }

    #[test]
    fn test_retry_after_seconds() {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::RETRY_AFTER, "7".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(7)));

        headers.insert(
            header::RETRY_AFTER,
            "Wed, 21 Oct 2015 07:28:00 GMT".parse().unwrap(),
        );
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[test]
    fn test_version_labels() {
        assert_eq!(
            version_label(reqwest::Version::HTTP_11, false, false),
            "HTTP/1.1"
        );
        assert_eq!(
            version_label(reqwest::Version::HTTP_2, false, false),
            "HTTP/2"
        );
        // Advertised but disabled stays on the negotiated version.
        assert_eq!(
            version_label(reqwest::Version::HTTP_2, true, false),
            "HTTP/2"
        );
    }
}
