//! TLS client identity for device sessions.
//!
//! Devices authenticate the host by the certificate stored in the pair
//! record and present a self-signed certificate of their own, which is
//! accepted without chain validation. Handshake signatures are still
//! verified with the provider's algorithms.

use std::fmt;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, DigitallySignedStruct, SignatureScheme};

use crate::{Error, Result};

/// Host certificate and key used to open TLS sessions with a device.
#[derive(Clone)]
pub struct TlsIdentity {
    /// Shared client configuration.
    config: Arc<ClientConfig>,
}

impl fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsIdentity").finish_non_exhaustive()
    }
}

impl TlsIdentity {
    /// Builds an identity from PEM-encoded certificate and private key.
    pub fn from_pem(certificate: &[u8], private_key: &[u8]) -> Result<Self> {
        let certs = CertificateDer::pem_slice_iter(certificate)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Ssl(format!("host certificate: {e}")))?;
        if certs.is_empty() {
            return Err(Error::Ssl("host certificate: no PEM certificate found".into()));
        }
        let key = PrivateKeyDer::from_pem_slice(private_key)
            .map_err(|e| Error::Ssl(format!("host private key: {e}")))?;

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let verifier = Arc::new(AcceptDeviceCert(Arc::clone(&provider)));
        let mut config = ClientConfig::builder_with_provider(provider)
            .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
            .map_err(|e| Error::Ssl(e.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_client_auth_cert(certs, key)
            .map_err(|e| Error::Ssl(e.to_string()))?;
        config.enable_sni = false;

        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Starts a new client-side TLS state machine.
    pub(crate) fn client(&self) -> Result<ClientConnection> {
        let name = ServerName::try_from("device").map_err(|e| Error::Ssl(e.to_string()))?;
        ClientConnection::new(Arc::clone(&self.config), name).map_err(|e| Error::Ssl(e.to_string()))
    }
}

/// Accepts the device's self-signed certificate.
#[derive(Debug)]
struct AcceptDeviceCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptDeviceCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_missing_certificate() {
        let err = TlsIdentity::from_pem(b"", b"").unwrap_err();
        assert!(matches!(err, Error::Ssl(_)));
        assert_eq!(err.code(), -6);
    }

    #[test]
    fn rejects_garbage_key() {
        let cert = b"-----BEGIN CERTIFICATE-----\nMA==\n-----END CERTIFICATE-----\n";
        assert!(matches!(
            TlsIdentity::from_pem(cert, b"not a key"),
            Err(Error::Ssl(_))
        ));
    }
}
