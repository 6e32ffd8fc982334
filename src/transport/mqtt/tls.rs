//! TLS configuration for the dialer
//!
//! [`TlsSettings`] captures the certificate material from [`ClientConfig`] and
//! decides the authentication mode. [`init_dialer_tls`] turns it into a rustls
//! client configuration and installs it on a [`Dialer`].
//!
//! Mutual TLS is only used when both a client certificate and a key are
//! supplied. A CA chain, when given, becomes the only trust anchor; without one
//! the broker certificate is accepted unverified.

use super::client::Dialer;
use crate::config::{ClientConfig, KeyPassphrase, PemBuffer};
use rumqttc::tokio_rustls::rustls;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Peer authentication mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    /// No client certificate presented
    None,
    /// Client certificate and key installed (mutual TLS)
    Required,
}

/// Client certificate, key and optional passphrase
#[derive(Debug, Clone)]
pub struct OwnCert {
    pub cert: PemBuffer,
    pub key: PemBuffer,
    pub passphrase: Option<KeyPassphrase>,
}

/// TLS material resolved from the command line
#[derive(Debug, Clone)]
pub struct TlsSettings {
    pub auth_mode: AuthMode,
    pub ca_chain: Option<PemBuffer>,
    pub own_cert: Option<OwnCert>,
}

/// TLS configuration errors
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("Failed to parse PEM data in {what}: {source}")]
    Pem {
        what: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("No certificate found in {0}")]
    NoCertificates(&'static str),
    #[error("No private key found in client key")]
    NoPrivateKey,
    #[error("Encrypted private keys are not supported, decrypt the key before use")]
    EncryptedKeyUnsupported,
    #[error("TLS configuration rejected: {0}")]
    Rustls(#[from] rustls::Error),
}

impl TlsSettings {
    /// Decide auth mode from the supplied material
    pub fn new(
        ca_chain: Option<PemBuffer>,
        cert: Option<PemBuffer>,
        key: Option<PemBuffer>,
        passphrase: Option<KeyPassphrase>,
    ) -> Self {
        let own_cert = match (cert, key) {
            (Some(cert), Some(key)) => Some(OwnCert {
                cert,
                key,
                passphrase,
            }),
            (Some(_), None) | (None, Some(_)) => {
                warn!("Client certificate and key must be given together, ignoring the one supplied");
                None
            }
            (None, None) => None,
        };

        let auth_mode = if own_cert.is_some() {
            AuthMode::Required
        } else {
            AuthMode::None
        };

        Self {
            auth_mode,
            ca_chain,
            own_cert,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(
            config.cacert.clone(),
            config.cert.clone(),
            config.key.clone(),
            config.keypass.clone(),
        )
    }

    /// Whether a CA chain will be installed as trust anchor
    pub fn has_trust_anchor(&self) -> bool {
        self.ca_chain.is_some()
    }

    /// Build the rustls client configuration
    pub fn build_client_config(&self) -> Result<rustls::ClientConfig, TlsError> {
        let builder = rustls::ClientConfig::builder();

        let builder = match &self.ca_chain {
            Some(ca) => {
                let mut roots = RootCertStore::empty();
                for cert in parse_certs(ca.as_bytes(), "CA chain")? {
                    roots.add(cert)?;
                }
                builder.with_root_certificates(roots)
            }
            None => {
                warn!("No CA certificate configured, broker certificate will not be verified");
                builder
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(NoServerVerification))
            }
        };

        let config = match (self.auth_mode, &self.own_cert) {
            (AuthMode::Required, Some(own)) => {
                let certs = parse_certs(own.cert.as_bytes(), "client certificate")?;
                let key = parse_private_key(own.key.as_bytes(), own.passphrase.as_ref())?;
                builder.with_client_auth_cert(certs, key)?
            }
            _ => builder.with_no_client_auth(),
        };

        Ok(config)
    }
}

/// Build the TLS context from `settings` and attach it to `dialer`
pub fn init_dialer_tls(dialer: &mut Dialer, settings: &TlsSettings) -> Result<(), TlsError> {
    let config = settings.build_client_config()?;
    info!(
        auth_mode = ?settings.auth_mode,
        trust_anchor = settings.has_trust_anchor(),
        "TLS enabled on dialer"
    );
    dialer.set_tls_config(Arc::new(config));
    Ok(())
}

fn parse_certs(pem: &[u8], what: &'static str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Pem { what, source })?;

    if certs.is_empty() {
        return Err(TlsError::NoCertificates(what));
    }
    Ok(certs)
}

fn parse_private_key(
    pem: &[u8],
    passphrase: Option<&KeyPassphrase>,
) -> Result<PrivateKeyDer<'static>, TlsError> {
    let key = rustls_pemfile::private_key(&mut &pem[..]).map_err(|source| TlsError::Pem {
        what: "client key",
        source,
    })?;

    match key {
        Some(key) => {
            if passphrase.is_some() {
                warn!("Key passphrase supplied for an unencrypted key, ignoring it");
            }
            Ok(key)
        }
        None if is_encrypted_key(pem) => Err(TlsError::EncryptedKeyUnsupported),
        None => Err(TlsError::NoPrivateKey),
    }
}

fn is_encrypted_key(pem: &[u8]) -> bool {
    const MARKERS: [&[u8]; 2] = [b"ENCRYPTED PRIVATE KEY", b"Proc-Type: 4,ENCRYPTED"];
    MARKERS
        .iter()
        .any(|marker| pem.windows(marker.len()).any(|w| w == *marker))
}

/// Accepts any broker certificate; used only when no CA chain is configured
#[derive(Debug)]
struct NoServerVerification;

impl ServerCertVerifier for NoServerVerification {
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
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}
