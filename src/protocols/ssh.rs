/*
 * swiftfetch - High-throughput multi-protocol transfer engine.
 * Copyright (C) 2025  swiftfetch contributors
 */

//! SFTP and SCP transport over a shared SSH connection.
//!
//! SFTP supports ranged reads (seek + read on a remote handle); SCP has no
//! restart mechanism and always forces single-stream transfers.

use async_trait::async_trait;
use bytes::Bytes;
use russh::client;
use russh::ChannelMsg;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;

use super::{
    ByteStream, HandlerCapabilities, ProbeReport, ProtocolHandler, ProtocolSession,
    RequestOptions, Target, TransportOptions,
};
use crate::error::{FetchError, FetchResult};

const READ_BLOCK: usize = 64 * 1024;

/// Which SSH file-transfer flavor a handler instance speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SshMode {
    Sftp,
    Scp,
}

/// SFTP/SCP protocol handler.
pub struct SshHandler {
    mode: SshMode,
    timeout: Duration,
}

impl SshHandler {
    pub fn new(mode: SshMode, transport: &TransportOptions) -> Self {
        Self {
            mode,
            timeout: transport.timeout,
        }
    }

    async fn connect(&self, target: &Target) -> FetchResult<client::Handle<ClientHandler>> {
        let host = target.host().to_string();
        let port = target.port().unwrap_or(22);
        let config = Arc::new(client::Config {
            inactivity_timeout: Some(self.timeout),
            ..client::Config::default()
        });

        let mut handle = tokio::time::timeout(
            self.timeout,
            client::connect(config, (host.clone(), port), ClientHandler),
        )
        .await
        .map_err(|_| FetchError::transient(format!("SSH connect timeout to {host}:{port}")))?
        .map_err(|e| FetchError::TlsFailure {
            host: host.clone(),
            message: format!("SSH handshake failed: {e}"),
        })?;

        let url = target.url();
        let user = if url.username().is_empty() {
            std::env::var("USER").unwrap_or_else(|_| "root".to_string())
        } else {
            url.username().to_string()
        };

        let authed = if let Some(password) = url.password() {
            handle
                .authenticate_password(&user, password)
                .await
                .map_err(|e| ssh_auth_error(&host, e))?
        } else {
            authenticate_with_default_keys(&mut handle, &user, &host).await?
        };

        if !authed {
            return Err(FetchError::TlsFailure {
                host,
                message: "SSH authentication failed".into(),
            });
        }
        Ok(handle)
    }
}

/// Try the usual key files in order.
async fn authenticate_with_default_keys(
    handle: &mut client::Handle<ClientHandler>,
    user: &str,
    host: &str,
) -> FetchResult<bool> {
    let Some(home) = dirs::home_dir() else {
        return Ok(false);
    };
    for name in ["id_ed25519", "id_rsa"] {
        let path = home.join(".ssh").join(name);
        if !path.exists() {
            continue;
        }
        let Ok(key) = russh_keys::load_secret_key(&path, None) else {
            continue;
        };
        let authed = handle
            .authenticate_publickey(user, Arc::new(key))
            .await
            .map_err(|e| ssh_auth_error(host, e))?;
        if authed {
            return Ok(true);
        }
    }
    Ok(false)
}

fn ssh_auth_error(host: &str, err: russh::Error) -> FetchError {
    FetchError::TlsFailure {
        host: host.to_string(),
        message: format!("SSH authentication failed: {err}"),
    }
}

struct ClientHandler;

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

#[async_trait]
impl ProtocolHandler for SshHandler {
    fn schemes(&self) -> &'static [&'static str] {
        match self.mode {
            SshMode::Sftp => &["sftp"],
            SshMode::Scp => &["scp"],
        }
    }

    fn capabilities(&self) -> HandlerCapabilities {
        match self.mode {
            SshMode::Sftp => HandlerCapabilities {
                supports_range: true,
                supports_resume: true,
                max_concurrent_streams: None,
            },
            // SCP cannot restart; it always forces SINGLE mode.
            SshMode::Scp => HandlerCapabilities {
                supports_range: false,
                supports_resume: false,
                max_concurrent_streams: Some(1),
            },
        }
    }

    async fn probe(&self, target: &Target, _request: &RequestOptions) -> FetchResult<ProbeReport> {
        let peer_addr = tokio::net::lookup_host((target.host(), target.port().unwrap_or(22)))
            .await
            .ok()
            .and_then(|mut addrs| addrs.next());

        let started = Instant::now();
        let handle = self.connect(target).await?;
        let path = target.url().path().to_string();

        let report = match self.mode {
            SshMode::Sftp => {
                let channel = handle
                    .channel_open_session()
                    .await
                    .map_err(|e| FetchError::transient_with("SSH channel open failed", e))?;
                channel
                    .request_subsystem(true, "sftp")
                    .await
                    .map_err(|e| FetchError::transient_with("SFTP subsystem refused", e))?;
                let sftp = russh_sftp::client::SftpSession::new(channel.into_stream())
                    .await
                    .map_err(|e| FetchError::transient_with("SFTP session failed", e))?;

                let attrs = sftp
                    .metadata(&path)
                    .await
                    .map_err(|e| FetchError::transient_with("SFTP stat failed", e))?;

                ProbeReport {
                    protocol: "SFTP".to_string(),
                    peer_addr,
                    latency: started.elapsed(),
                    content_length: attrs.size,
                    supports_range: true,
                    last_modified: attrs.mtime.map(|m| m.to_string()),
                    ..ProbeReport::default()
                }
            }
            SshMode::Scp => {
                let size = scp_probe_size(&handle, &path).await?;
                ProbeReport {
                    protocol: "SCP".to_string(),
                    peer_addr,
                    latency: started.elapsed(),
                    content_length: size,
                    supports_range: false,
                    ..ProbeReport::default()
                }
            }
        };

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await;
        Ok(report)
    }

    async fn open(
        &self,
        target: &Target,
        _request: &RequestOptions,
    ) -> FetchResult<Box<dyn ProtocolSession>> {
        let handle = self.connect(target).await?;
        let path = target.url().path().to_string();

        match self.mode {
            SshMode::Sftp => {
                let channel = handle
                    .channel_open_session()
                    .await
                    .map_err(|e| FetchError::transient_with("SSH channel open failed", e))?;
                channel
                    .request_subsystem(true, "sftp")
                    .await
                    .map_err(|e| FetchError::transient_with("SFTP subsystem refused", e))?;
                let sftp = russh_sftp::client::SftpSession::new(channel.into_stream())
                    .await
                    .map_err(|e| FetchError::transient_with("SFTP session failed", e))?;
                Ok(Box::new(SftpSessionWrapper {
                    handle: Some(handle),
                    sftp,
                    path,
                }))
            }
            SshMode::Scp => Ok(Box::new(ScpSession {
                handle: Some(handle),
                path,
            })),
        }
    }
}

/// One SFTP channel over the fetch's SSH connection.
struct SftpSessionWrapper {
    handle: Option<client::Handle<ClientHandler>>,
    sftp: russh_sftp::client::SftpSession,
    path: String,
}

impl SftpSessionWrapper {
    async fn open_at(&self, offset: u64) -> FetchResult<russh_sftp::client::fs::File> {
        let mut file = self
            .sftp
            .open_with_flags(&self.path, russh_sftp::protocol::OpenFlags::READ)
            .await
            .map_err(|e| FetchError::transient_with("SFTP open failed", e))?;
        if offset > 0 {
            file.seek(std::io::SeekFrom::Start(offset))
                .await
                .map_err(|e| FetchError::transient_with("SFTP seek failed", e))?;
        }
        Ok(file)
    }

    /// Stream from `offset`, bounded to `limit` bytes when given.
    fn stream_from(file: russh_sftp::client::fs::File, limit: Option<u64>) -> ByteStream {
        let (tx, rx) = mpsc::channel::<FetchResult<Bytes>>(8);
        tokio::spawn(async move {
            let mut file = file;
            let mut remaining = limit;
            let mut buf = vec![0u8; READ_BLOCK];
            loop {
                let want = match remaining {
                    Some(0) => break,
                    Some(r) => (r as usize).min(READ_BLOCK),
                    None => READ_BLOCK,
                };
                match file.read(&mut buf[..want]).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Some(r) = remaining.as_mut() {
                            *r -= n as u64;
                        }
                        if tx.send(Ok(Bytes::copy_from_slice(&buf[..n]))).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = tx
                            .send(Err(FetchError::transient_with("SFTP read failed", e)))
                            .await;
                        break;
                    }
                }
            }
        });

        Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        }))
    }
}

#[async_trait]
impl ProtocolSession for SftpSessionWrapper {
    async fn read_range(&mut self, offset: u64, length: u64) -> FetchResult<ByteStream> {
        let file = self.open_at(offset).await?;
        Ok(Self::stream_from(file, Some(length)))
    }

    async fn read_all(&mut self) -> FetchResult<ByteStream> {
        let file = self.open_at(0).await?;
        Ok(Self::stream_from(file, None))
    }

    async fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle
                .disconnect(russh::Disconnect::ByApplication, "", "en")
                .await;
        }
    }
}

/// SCP source-mode session: exec `scp -f` and speak the classic sink side.
struct ScpSession {
    handle: Option<client::Handle<ClientHandler>>,
    path: String,
}

#[async_trait]
impl ProtocolSession for ScpSession {
    async fn read_range(&mut self, _offset: u64, _length: u64) -> FetchResult<ByteStream> {
        Err(FetchError::degraded("SCP does not support range reads"))
    }

    async fn read_all(&mut self) -> FetchResult<ByteStream> {
        let handle = self
            .handle
            .as_ref()
            .ok_or_else(|| FetchError::transient("SCP session already closed"))?;

        let mut channel = handle
            .channel_open_session()
            .await
            .map_err(|e| FetchError::transient_with("SSH channel open failed", e))?;
        channel
            .exec(true, format!("scp -f {}", shell_quote(&self.path)))
            .await
            .map_err(|e| FetchError::transient_with("SCP exec failed", e))?;

        // Kick the source side and read the file header.
        channel
            .data(&[0u8][..])
            .await
            .map_err(|e| FetchError::transient_with("SCP ack failed", e))?;
        let (size, mut leftover) = scp_read_header(&mut channel).await?;
        channel
            .data(&[0u8][..])
            .await
            .map_err(|e| FetchError::transient_with("SCP ack failed", e))?;

        let (tx, rx) = mpsc::channel::<FetchResult<Bytes>>(8);
        tokio::spawn(async move {
            let mut remaining = size;

            // Header reads may have already pulled body bytes.
            if !leftover.is_empty() {
                let take = (leftover.len() as u64).min(remaining) as usize;
                remaining -= take as u64;
                let chunk: Vec<u8> = leftover.drain(..take).collect();
                if tx.send(Ok(Bytes::from(chunk))).await.is_err() {
                    return;
                }
            }

            while remaining > 0 {
                match channel.wait().await {
                    Some(ChannelMsg::Data { data }) => {
                        let take = (data.len() as u64).min(remaining) as usize;
                        remaining -= take as u64;
                        if tx
                            .send(Ok(Bytes::copy_from_slice(&data[..take])))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                        if remaining > 0 {
                            let _ = tx
                                .send(Err(FetchError::transient("SCP stream ended early")))
                                .await;
                        }
                        return;
                    }
                    Some(_) => {}
                }
            }
            // Final status byte and ack; errors here no longer matter.
            let _ = channel.data(&[0u8][..]).await;
        });

        Ok(Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })))
    }

    async fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle
                .disconnect(russh::Disconnect::ByApplication, "", "en")
                .await;
        }
    }
}

/// Read the scp file header ("C0644 <size> <name>\n"), returning the size
/// and any body bytes that arrived in the same message.
async fn scp_read_header(
    channel: &mut russh::Channel<client::Msg>,
) -> FetchResult<(u64, Vec<u8>)> {
    let mut header = Vec::new();
    loop {
        match channel.wait().await {
            Some(ChannelMsg::Data { data }) => {
                if let Some(pos) = data.iter().position(|b| *b == b'\n') {
                    header.extend_from_slice(&data[..pos]);
                    let leftover = data[pos + 1..].to_vec();
                    let size = parse_scp_header(&header)?;
                    return Ok((size, leftover));
                }
                header.extend_from_slice(&data);
            }
            Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                return Err(FetchError::transient("SCP source closed before header"));
            }
            Some(_) => {}
        }
    }
}

fn parse_scp_header(header: &[u8]) -> FetchResult<u64> {
    let text = String::from_utf8_lossy(header);
    // Error responses start with \x01 or \x02 followed by a message.
    if text.starts_with('\u{1}') || text.starts_with('\u{2}') {
        return Err(FetchError::transient(format!(
            "SCP error: {}",
            text.trim_start_matches(['\u{1}', '\u{2}']).trim()
        )));
    }
    if !text.starts_with('C') {
        return Err(FetchError::degraded(format!(
            "unexpected SCP header: {text}"
        )));
    }
    text.split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| FetchError::degraded("malformed SCP header"))
}

/// Probe the object size via the header of a transfer we never ack.
async fn scp_probe_size(
    handle: &client::Handle<ClientHandler>,
    path: &str,
) -> FetchResult<Option<u64>> {
    let mut channel = handle
        .channel_open_session()
        .await
        .map_err(|e| FetchError::transient_with("SSH channel open failed", e))?;
    channel
        .exec(true, format!("scp -f {}", shell_quote(path)))
        .await
        .map_err(|e| FetchError::transient_with("SCP exec failed", e))?;
    channel
        .data(&[0u8][..])
        .await
        .map_err(|e| FetchError::transient_with("SCP ack failed", e))?;

    let (size, _) = scp_read_header(&mut channel).await?;
    let _ = channel.close().await;
    Ok(Some(size))
}

fn shell_quote(path: &str) -> String {
    format!("'{}'", path.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scp_header() {
        assert_eq!(parse_scp_header(b"C0644 12345 file.bin").unwrap(), 12345);
        assert_eq!(parse_scp_header(b"C0755 0 empty").unwrap(), 0);
    }

    #[test]
    fn test_parse_scp_error_response() {
        let err = parse_scp_header(b"\x01scp: no such file").unwrap_err();
        assert!(format!("{err}").contains("no such file"));
    }

    #[test]
    fn test_parse_scp_garbage() {
        assert!(parse_scp_header(b"garbage").is_err());
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/plain/path"), "'/plain/path'");
        assert_eq!(shell_quote("/with'quote"), "'/with'\\''quote'");
    }

    #[test]
    fn test_scp_capabilities_force_single() {
        let handler = SshHandler::new(SshMode::Scp, &TransportOptions::default());
        let caps = handler.capabilities();
        assert!(!caps.supports_range);
        assert_eq!(caps.max_concurrent_streams, Some(1));
    }
}
