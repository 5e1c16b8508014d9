/*
 * swiftfetch - High-throughput multi-protocol transfer engine.
 * Copyright (C) 2025  swiftfetch contributors
 */

//! Deep TLS inspection on a secondary socket.
//!
//! Runs a raw handshake alongside the HTTPS probe to extract the
//! negotiated version, cipher, certificate chain details, and the leaf
//! SHA-256 fingerprint used for pinning.

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

use crate::error::{FetchError, FetchResult};

/// Summary of an inspected TLS endpoint.
#[derive(Debug, Clone, Default)]
pub struct TlsSummary {
    pub version: String,
    pub cipher: String,
    pub issuer: String,
    pub not_after: String,
    pub san: Vec<String>,
    pub fingerprint_sha256: String,
    /// Days until certificate expiry; negative when already expired.
    pub expires_in_days: Option<i64>,
}

impl TlsSummary {
    /// Warning string when the certificate expires within `warn_days`.
    pub fn expiry_warning(&self, warn_days: i64) -> Option<String> {
        let remaining = self.expires_in_days?;
        if remaining < 0 {
            Some(format!("certificate expired {} days ago", -remaining))
        } else if remaining < warn_days {
            Some(format!("certificate expires in {remaining} days"))
        } else {
            None
        }
    }
}

/// Inspects TLS endpoints and enforces per-host certificate pins.
#[derive(Debug, Clone)]
pub struct TlsInspector {
    verify: bool,
    pins: HashMap<String, String>,
    timeout: Duration,
}

impl TlsInspector {
    pub fn new(verify: bool, pins: HashMap<String, String>, timeout: Duration) -> Self {
        Self {
            verify,
            pins,
            timeout,
        }
    }

    /// Handshake with `host:port` and summarize the session. A configured
    /// pin that does not match the leaf fingerprint fails the inspection.
    pub async fn inspect(&self, host: &str, port: u16) -> FetchResult<TlsSummary> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| FetchError::TlsFailure {
                host: host.to_string(),
                message: e.to_string(),
            })?;

        let config = if self.verify {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            builder.with_root_certificates(roots).with_no_client_auth()
        } else {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerification(provider)))
                .with_no_client_auth()
        };

        let server_name = ServerName::try_from(host.to_string()).map_err(|_| {
            FetchError::TlsFailure {
                host: host.to_string(),
                message: "invalid server name".into(),
            }
        })?;

        let tcp = tokio::time::timeout(self.timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| FetchError::transient(format!("connect timeout to {host}:{port}")))?
            .map_err(|e| FetchError::transient_with(format!("connect to {host}:{port}"), e))?;

        let connector = TlsConnector::from(Arc::new(config));
        let stream = tokio::time::timeout(self.timeout, connector.connect(server_name, tcp))
            .await
            .map_err(|_| FetchError::transient(format!("TLS handshake timeout for {host}")))?
            .map_err(|e| FetchError::TlsFailure {
                host: host.to_string(),
                message: e.to_string(),
            })?;

        let (_, session) = stream.get_ref();

        let version = match session.protocol_version() {
            Some(rustls::ProtocolVersion::TLSv1_3) => "TLS 1.3".to_string(),
            Some(rustls::ProtocolVersion::TLSv1_2) => "TLS 1.2".to_string(),
            Some(v) => format!("{v:?}"),
            None => String::new(),
        };
        let cipher = session
            .negotiated_cipher_suite()
            .map(|s| format!("{:?}", s.suite()))
            .unwrap_or_default();

        let mut summary = TlsSummary {
            version,
            cipher,
            ..TlsSummary::default()
        };

        if let Some(certs) = session.peer_certificates() {
            if let Some(leaf) = certs.first() {
                summary.fingerprint_sha256 = hex::encode(Sha256::digest(leaf.as_ref()));
                self.describe_leaf(leaf, &mut summary);
            }
        }

        self.check_pin(host, &summary.fingerprint_sha256)?;
        Ok(summary)
    }

    /// Verify an already-observed fingerprint against the configured pin.
    pub fn check_pin(&self, host: &str, fingerprint: &str) -> FetchResult<()> {
        if let Some(expected) = self.pins.get(host) {
            if !expected.eq_ignore_ascii_case(fingerprint) {
                return Err(FetchError::PinMismatch {
                    host: host.to_string(),
                    expected: expected.clone(),
                    actual: fingerprint.to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn has_pin(&self, host: &str) -> bool {
        self.pins.contains_key(host)
    }

    fn describe_leaf(&self, leaf: &CertificateDer<'_>, summary: &mut TlsSummary) {
        let Ok((_, cert)) = X509Certificate::from_der(leaf.as_ref()) else {
            return;
        };

        summary.issuer = cert.issuer().to_string();
        summary.not_after = cert.validity().not_after.to_string();
        summary.expires_in_days = Some(
            (cert.validity().not_after.timestamp() - chrono::Utc::now().timestamp()) / 86_400,
        );

        if let Ok(Some(san)) = cert.subject_alternative_name() {
            for name in &san.value.general_names {
                if let GeneralName::DNSName(dns) = name {
                    summary.san.push(dns.to_string());
                }
            }
        }
    }
}

/// Certificate verifier that accepts everything; used for `--no-verify`
/// so inspection still reports certificate details.
#[derive(Debug)]
struct NoVerification(Arc<rustls::crypto::CryptoProvider>);

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inspector_with_pin(host: &str, pin: &str) -> TlsInspector {
        let mut pins = HashMap::new();
        pins.insert(host.to_string(), pin.to_string());
        TlsInspector::new(true, pins, Duration::from_secs(5))
    }

    #[test]
    fn test_pin_match_case_insensitive() {
        let inspector = inspector_with_pin("example.com", "AABBCC");
        assert!(inspector.check_pin("example.com", "aabbcc").is_ok());
    }

    #[test]
    fn test_pin_mismatch() {
        let inspector = inspector_with_pin("example.com", "aabbcc");
        let err = inspector.check_pin("example.com", "ddeeff").unwrap_err();
        assert!(matches!(err, FetchError::PinMismatch { .. }));
    }

    #[test]
    fn test_unpinned_host_passes() {
        let inspector = inspector_with_pin("example.com", "aabbcc");
        assert!(inspector.check_pin("other.com", "whatever").is_ok());
        assert!(!inspector.has_pin("other.com"));
    }

    #[test]
    fn test_expiry_warning() {
        let summary = TlsSummary {
            expires_in_days: Some(10),
            ..TlsSummary::default()
        };
        assert!(summary.expiry_warning(30).unwrap().contains("10 days"));

        let expired = TlsSummary {
            expires_in_days: Some(-3),
            ..TlsSummary::default()
        };
        assert!(expired.expiry_warning(30).unwrap().contains("expired"));

        let fine = TlsSummary {
            expires_in_days: Some(200),
            ..TlsSummary::default()
        };
        assert!(fine.expiry_warning(30).is_none());
    }
}
