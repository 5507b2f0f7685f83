//! TLS for peer sessions.
//!
//! Peers are anonymous: every node presents a self-signed certificate and
//! clients accept whatever the server presents. TLS here provides
//! confidentiality on the wire, not authentication.

use crate::config::AetherPaths;
use anyhow::{anyhow, Context, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use std::fs;
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Name placed in the certificate and requested by clients.
pub const SERVER_NAME: &str = "aether.local";

#[derive(Clone)]
pub struct TlsConfig {
    client_config: Arc<ClientConfig>,
    server_config: Arc<ServerConfig>,
}

impl TlsConfig {
    pub fn load(paths: &AetherPaths) -> Result<Self> {
        let cert_pem = fs::read(&paths.cert_path)
            .with_context(|| format!("failed to read {}", paths.cert_path.display()))?;
        let key_pem = fs::read(&paths.key_path)
            .with_context(|| format!("failed to read {}", paths.key_path.display()))?;
        Self::from_pem(&cert_pem, &key_pem)
    }

    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
        let certs = CertificateDer::pem_slice_iter(cert_pem)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| anyhow!("failed to parse certificates: {e}"))?;
        if certs.is_empty() {
            anyhow::bail!("no certificates found");
        }
        let key = PrivateKeyDer::from_pem_slice(key_pem)
            .map_err(|e| anyhow!("failed to parse private key: {e}"))?;

        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let server_config = ServerConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .context("unsupported protocol versions")?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .context("server config error")?;

        let client_config = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .context("unsupported protocol versions")?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert { provider }))
            .with_no_client_auth();

        Ok(Self {
            client_config: Arc::new(client_config),
            server_config: Arc::new(server_config),
        })
    }

    pub fn connector(&self) -> TlsConnector {
        TlsConnector::from(self.client_config.clone())
    }

    pub fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(self.server_config.clone())
    }

    pub fn server_name() -> Result<ServerName<'static>> {
        ServerName::try_from(SERVER_NAME.to_owned()).map_err(|e| anyhow!("invalid server name: {e}"))
    }
}

/// Skips chain validation but still checks handshake signatures, so the
/// session key is bound to the presented certificate.
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

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
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
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
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ensure_tls_material;
    use tempfile::tempdir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    #[test]
    fn generated_material_loads() {
        let temp = tempdir().expect("tempdir");
        let paths = AetherPaths::from_base_dir(temp.path()).expect("paths");
        ensure_tls_material(&paths).expect("material");
        TlsConfig::load(&paths).expect("config");
    }

    #[test]
    fn garbage_pem_is_rejected() {
        assert!(TlsConfig::from_pem(b"nope", b"nope").is_err());
    }

    #[tokio::test]
    #[ignore = "requires local networking"]
    async fn self_signed_handshake_over_loopback() {
        let temp = tempdir().expect("tempdir");
        let paths = AetherPaths::from_base_dir(temp.path()).expect("paths");
        ensure_tls_material(&paths).expect("material");
        let tls = TlsConfig::load(&paths).expect("config");

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let acceptor = tls.acceptor();
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.expect("accept");
            let mut stream = acceptor.accept(tcp).await.expect("tls accept");
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.expect("read");
            buf
        });

        let tcp = TcpStream::connect(addr).await.expect("connect");
        let mut stream = tls
            .connector()
            .connect(TlsConfig::server_name().expect("name"), tcp)
            .await
            .expect("tls connect");
        stream.write_all(b"ping").await.expect("write");
        stream.flush().await.expect("flush");
        assert_eq!(&server.await.expect("join"), b"ping");
    }
}
