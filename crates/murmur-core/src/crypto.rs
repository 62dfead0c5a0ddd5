//! Certificates and TLS configuration for murmur.
//!
//! Provides two things:
//!   1. Self-signed peer certificates generated at start-up (rcgen)
//!   2. rustls client/server configs for mutual TLS between peers
//!
//! There is no certificate authority. A client pins the server to exactly
//! the certificate learned during the greet handshake. A server accepts any
//! client that proves possession of its certificate's key; binding that
//! certificate to a peer id happens in the transport after the hello frame.
//!
//! The private key is held in `Zeroizing` memory and wiped on drop.

use std::sync::Arc;

use rand::{CryptoRng, RngCore};
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, KeyPair,
    KeyUsagePurpose, SerialNumber,
};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use thiserror::Error;
use zeroize::Zeroizing;

/// Server name presented in the ClientHello. Peers are identified by
/// certificate pinning, never by name, so this is a fixed placeholder.
pub const PEER_SERVER_NAME: &str = "peer.murmur";

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("certificate generation failed: {0}")]
    Generate(#[from] rcgen::Error),

    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("tls configuration failed: {0}")]
    Tls(#[from] rustls::Error),
}

// ── Identity ──────────────────────────────────────────────────────────────────

/// A peer's certificate and private key.
pub struct Identity {
    cert_pem: String,
    cert_der: CertificateDer<'static>,
    /// PKCS#8 private key, zeroized on drop, never serialized.
    key_der: Zeroizing<Vec<u8>>,
}

impl Identity {
    /// Generate a self-signed certificate whose common name is `common_name`,
    /// usable for both client and server authentication.
    ///
    /// The serial number is drawn from `rng`; the key pair comes from the
    /// crypto provider's system randomness.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R, common_name: &str) -> Result<Self, CryptoError> {
        let mut params = CertificateParams::new(Vec::<String>::new())?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        params.distinguished_name = dn;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];

        let mut serial = [0u8; 16];
        rng.fill_bytes(&mut serial);
        // Positive integer: clear the sign bit.
        serial[0] &= 0x7f;
        params.serial_number = Some(SerialNumber::from(serial.to_vec()));

        let key_pair = KeyPair::generate()?;
        let cert = params.self_signed(&key_pair)?;

        Ok(Self {
            cert_pem: cert.pem(),
            cert_der: cert.der().clone(),
            key_der: Zeroizing::new(key_pair.serialize_der()),
        })
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der.to_vec()))
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Short BLAKE3 fingerprint (first 8 bytes, hex) for log fields.
pub fn fingerprint(data: &[u8]) -> String {
    hex::encode(&blake3::hash(data).as_bytes()[..8])
}

/// Parse the first certificate from PEM text.
pub fn parse_certificate(pem: &str) -> Result<CertificateDer<'static>, CryptoError> {
    match rustls_pemfile::certs(&mut pem.as_bytes()).next() {
        Some(Ok(der)) => Ok(der),
        Some(Err(e)) => Err(CryptoError::InvalidCertificate(e.to_string())),
        None => Err(CryptoError::InvalidCertificate("no certificate in PEM".into())),
    }
}

/// Does `presented` encode exactly the certificate in `pem`?
pub fn matches_certificate(pem: &str, presented: &CertificateDer<'_>) -> bool {
    parse_certificate(pem)
        .map(|expected| expected.as_ref() == presented.as_ref())
        .unwrap_or(false)
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

// ── Configs ───────────────────────────────────────────────────────────────────

/// Server config for the secure message port: presents our certificate
/// and requires every client to present one.
pub fn server_config(identity: &Identity) -> Result<ServerConfig, CryptoError> {
    let provider = provider();
    let verifier = AnyPeerVerifier {
        algorithms: provider.signature_verification_algorithms,
    };

    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_client_cert_verifier(Arc::new(verifier))
        .with_single_cert(vec![identity.cert_der.clone()], identity.private_key())?;

    Ok(config)
}

/// Client config for one outbound connection, trusting only
/// `peer_cert_pem` and authenticating with our own certificate.
pub fn client_config(identity: &Identity, peer_cert_pem: &str) -> Result<ClientConfig, CryptoError> {
    let pinned = parse_certificate(peer_cert_pem)?;
    let provider = provider();
    let verifier = PinnedVerifier {
        pinned,
        algorithms: provider.signature_verification_algorithms,
    };

    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_client_auth_cert(vec![identity.cert_der.clone()], identity.private_key())?;

    Ok(config)
}

/// The server name to connect with.
pub fn peer_server_name() -> Result<ServerName<'static>, CryptoError> {
    ServerName::try_from(PEER_SERVER_NAME)
        .map_err(|e| CryptoError::InvalidCertificate(format!("server name: {e}")))
}

// ── Verifiers ─────────────────────────────────────────────────────────────────

/// Accepts exactly one server certificate.
#[derive(Debug)]
struct PinnedVerifier {
    pinned: CertificateDer<'static>,
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for PinnedVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if end_entity.as_ref() != self.pinned.as_ref() {
            return Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ));
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Requires a client certificate and proof of its key, nothing more.
#[derive(Debug)]
struct AnyPeerVerifier {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ClientCertVerifier for AnyPeerVerifier {
    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        if end_entity.as_ref().is_empty() {
            return Err(rustls::Error::InvalidCertificate(CertificateError::BadEncoding));
        }
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
