//! TLS certificate pinning
//!
//! Fingerprints are compared as normalized lowercase hex. The verifier below
//! replaces chain validation entirely: a `wss://` peer is trusted if and only
//! if its leaf certificate hashes to the pinned value.

use std::sync::Arc;

use parking_lot::Mutex;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// Canonicalize a fingerprint for comparison
///
/// Strips an optional `sha256:` / `SHA-256` prefix, drops separators and
/// lowercases. `"SHA256:AB:cd-01"` and `"abcd01"` normalize identically.
#[must_use]
pub fn normalize_fingerprint(input: &str) -> String {
    let lowered = input.trim().to_ascii_lowercase();
    let body = lowered
        .strip_prefix("sha-256")
        .or_else(|| lowered.strip_prefix("sha256"))
        .unwrap_or(&lowered);
    body.chars().filter(char::is_ascii_hexdigit).collect()
}

/// SHA-256 fingerprint of a DER certificate, lowercase hex
#[must_use]
pub fn cert_fingerprint(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

/// Certificate verifier that accepts exactly one leaf fingerprint
#[derive(Debug)]
pub struct PinnedCertVerifier {
    expected: String,
    algorithms: WebPkiSupportedAlgorithms,
    mismatch: Mutex<Option<String>>,
}

impl PinnedCertVerifier {
    #[must_use]
    pub fn new(expected: &str, provider: &CryptoProvider) -> Self {
        Self {
            expected: normalize_fingerprint(expected),
            algorithms: provider.signature_verification_algorithms,
            mismatch: Mutex::new(None),
        }
    }

    /// Normalized pin
    #[must_use]
    pub fn expected(&self) -> &str {
        &self.expected
    }

    /// Fingerprint of the last rejected certificate, if any
    pub fn take_mismatch(&self) -> Option<String> {
        self.mismatch.lock().take()
    }
}

impl ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let actual = cert_fingerprint(end_entity.as_ref());
        if !self.expected.is_empty() && actual == self.expected {
            return Ok(ServerCertVerified::assertion());
        }

        tracing::warn!(expected = %self.expected, actual = %actual, "tls fingerprint mismatch");
        *self.mismatch.lock() = Some(actual);
        Err(rustls::Error::InvalidCertificate(
            CertificateError::ApplicationVerificationFailure,
        ))
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Client config that trusts only the pinned certificate
///
/// # Errors
///
/// Returns error if the provider rejects the default protocol versions
pub fn pinned_client_config(expected: &str) -> Result<(Arc<ClientConfig>, Arc<PinnedCertVerifier>)> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let verifier = Arc::new(PinnedCertVerifier::new(expected, &provider));

    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Config(format!("tls setup failed: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(verifier.clone())
        .with_no_client_auth();

    Ok((Arc::new(config), verifier))
}

/// Client config validating against the bundled web PKI roots
///
/// # Errors
///
/// Returns error if the provider rejects the default protocol versions
pub fn webpki_client_config() -> Result<Arc<ClientConfig>> {
    let roots: RootCertStore = webpki_roots::TLS_SERVER_ROOTS.iter().cloned().collect();
    let config = ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Config(format!("tls setup failed: {e}")))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}
