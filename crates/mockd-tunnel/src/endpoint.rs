//! QUIC endpoint setup for the relay connection.
//!
//! The agent is a pure client: one endpoint bound to an ephemeral UDP port,
//! ALPN `mockd-relay`, 30 s idle timeout and 10 s keep-alives so NAT
//! bindings stay warm between requests.

use std::sync::Arc;
use std::time::Duration;

use quinn::crypto::rustls::QuicClientConfig;
use rustls::pki_types::CertificateDer;

use crate::client::TunnelError;

/// ALPN protocol the relay expects.
pub const ALPN: &[u8] = b"mockd-relay";

const MAX_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Build a client endpoint for dialling the relay.
///
/// `insecure` skips relay certificate verification; development only.
pub fn client_endpoint(insecure: bool) -> Result<quinn::Endpoint, TunnelError> {
    let mut crypto = if insecure {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureCertVerifier))
            .with_no_client_auth()
    } else {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    };
    crypto.alpn_protocols = vec![ALPN.to_vec()];
    crypto.enable_early_data = true;

    let mut client_config = quinn::ClientConfig::new(Arc::new(
        QuicClientConfig::try_from(crypto).map_err(|e| TunnelError::Tls(e.to_string()))?,
    ));

    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(Some(
        quinn::IdleTimeout::try_from(MAX_IDLE_TIMEOUT)
            .map_err(|e| TunnelError::Tls(e.to_string()))?,
    ));
    transport.keep_alive_interval(Some(KEEP_ALIVE_INTERVAL));
    client_config.transport_config(Arc::new(transport));

    let mut endpoint = quinn::Endpoint::client("0.0.0.0:0".parse().unwrap())?;
    endpoint.set_default_client_config(client_config);
    Ok(endpoint)
}

/// A certificate verifier that accepts any certificate.
/// Used when the relay runs with a self-signed certificate in development.
#[derive(Debug)]
struct InsecureCertVerifier;

impl rustls::client::danger::ServerCertVerifier for InsecureCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insecure_endpoint_binds_ephemeral_port() {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let endpoint = client_endpoint(true).unwrap();
        assert!(endpoint.local_addr().unwrap().port() > 0);
        endpoint.close(quinn::VarInt::from_u32(0), b"");
    }

    #[tokio::test]
    async fn verifying_endpoint_binds_ephemeral_port() {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let endpoint = client_endpoint(false).unwrap();
        assert!(endpoint.local_addr().unwrap().port() > 0);
        endpoint.close(quinn::VarInt::from_u32(0), b"");
    }
}
