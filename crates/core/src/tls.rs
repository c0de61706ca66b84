// Redis Tunnel - TLS Module
// rustls client configuration for TLS-wrapped Redis connections:
// webpki roots by default, or a pinned certificate fingerprint

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, Error as TlsError, RootCertStore, SignatureScheme};
use sha2::{Digest, Sha256};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use redis_tunnel_common::TransportError;

/// Certificate verifier that trusts exactly one certificate, by SHA-256 fingerprint
#[derive(Debug)]
struct FingerprintVerifier {
    expected_fingerprint: String,
    provider: Arc<CryptoProvider>,
}

impl FingerprintVerifier {
    fn new(fingerprint: &str, provider: Arc<CryptoProvider>) -> Self {
        Self {
            expected_fingerprint: normalize_fingerprint(fingerprint),
            provider,
        }
    }
}

impl ServerCertVerifier for FingerprintVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        let actual_fingerprint = certificate_fingerprint(end_entity);
        if actual_fingerprint == self.expected_fingerprint {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(TlsError::General(format!(
                "certificate fingerprint mismatch: expected {}, got {}",
                self.expected_fingerprint, actual_fingerprint
            )))
        }
    }

    // Signatures are still checked so the peer must hold the pinned key.
    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// SHA-256 of a DER certificate as colon-separated uppercase hex
pub fn certificate_fingerprint(cert: &CertificateDer<'_>) -> String {
    Sha256::digest(cert.as_ref())
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Accept "aa:bb", "AABB" and "AA BB" spellings
fn normalize_fingerprint(raw: &str) -> String {
    let hex: Vec<char> = raw
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .map(|c| c.to_ascii_uppercase())
        .collect();
    hex.chunks(2)
        .map(|pair| pair.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join(":")
}

/// Build the rustls client config, pinned when a fingerprint is given
pub fn client_config(fingerprint: Option<&str>) -> ClientConfig {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    // Installing is a no-op when another crate already picked a provider.
    let _ = CryptoProvider::install_default((*provider).clone());

    match fingerprint {
        Some(fp) => ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(FingerprintVerifier::new(fp, provider)))
            .with_no_client_auth(),
        None => {
            let mut root_store = RootCertStore::empty();
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth()
        }
    }
}

/// Run the TLS handshake over an established TCP stream
pub async fn wrap(
    stream: TcpStream,
    host: &str,
    fingerprint: Option<&str>,
) -> Result<TlsStream<TcpStream>, TransportError> {
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| TransportError::Tls(format!("invalid server name {}: {}", host, e)))?;
    let connector = TlsConnector::from(Arc::new(client_config(fingerprint)));

    debug!("Starting TLS handshake with {}", host);
    connector
        .connect(server_name, stream)
        .await
        .map_err(|e| TransportError::Tls(e.to_string()))
}
