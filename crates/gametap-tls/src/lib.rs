//! Certificate machinery for the gametap intercepting proxy.
//!
//! Two pieces: a long-lived root [`CertificateAuthority`] that is loaded from
//! (or persisted to) disk, and a [`LeafCertificateStore`] that mints and
//! caches per-host leaf certificates signed by that root. The store hands out
//! ready-to-use `rustls::ServerConfig`s so the tunnel layer never touches key
//! material directly.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use thiserror::Error;

mod ca;
mod leaf;

pub use ca::{CaOptions, CertificateAuthority};
pub use leaf::{IssuedServerConfig, LeafCacheStatus, LeafCertificateStore, LeafMetricsSnapshot};

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("certificate authority parse failed: {0}")]
    CaParse(String),
    #[error("key generation failed: {0}")]
    KeyGen(rcgen::Error),
    #[error("certificate signing failed: {0}")]
    Sign(rcgen::Error),
    #[error("client hello carried no server name")]
    MissingSni,
    #[error("leaf cache lock poisoned")]
    LockPoisoned,
    #[error("TLS config build failed: {0}")]
    ConfigBuild(#[from] rustls::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Client-side TLS config for origin connections.
///
/// Verification is off by default for this proxy's use case (origins behind
/// game launchers frequently pin or use private CAs); callers flip `verify`
/// on to chain against the webpki root set instead.
pub fn build_origin_client_config(verify: bool) -> Arc<ClientConfig> {
    let mut config = if verify {
        let roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    } else {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
            .with_no_client_auth()
    };

    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Arc::new(config)
}

#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
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
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
        ]
    }
}
