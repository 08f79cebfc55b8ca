use std::{fs, path::Path, sync::Arc};

use async_trait::async_trait;
use rcgen::generate_simple_self_signed;
use rustls::{
    ClientConfig, RootCertStore, ServerConfig,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::CryptoProvider,
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime},
};
use tokio::sync::Mutex;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::shadowlink::net;
use crate::shadowlink::tunnel::transport::{BoxedStream, StreamLayer, TransportError};

#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// Force TLS on plain `tcp`/`kcp`/`ws`/`http` transports.
    pub enabled: bool,
    pub cert_file: String,
    pub key_file: String,
    pub ca_file: String,
    pub insecure: bool,
    /// SNI override; defaults to the dialed host.
    pub server_name: String,
}

pub struct TlsLayer {
    opts: TlsOptions,
    acceptor: Mutex<Option<TlsAcceptor>>,
    connector: Mutex<Option<TlsConnector>>,
}

impl TlsLayer {
    pub fn new(opts: TlsOptions) -> Self {
        Self {
            opts,
            acceptor: Mutex::new(None),
            connector: Mutex::new(None),
        }
    }

    async fn acceptor(&self) -> Result<TlsAcceptor, TransportError> {
        let mut slot = self.acceptor.lock().await;
        if let Some(a) = slot.as_ref() {
            return Ok(a.clone());
        }
        let (certs, key) = load_or_generate_cert(&self.opts.cert_file, &self.opts.key_file)?;
        let cfg = server_config(certs, key)?;
        let acceptor = TlsAcceptor::from(Arc::new(cfg));
        *slot = Some(acceptor.clone());
        Ok(acceptor)
    }

    async fn connector(&self) -> Result<TlsConnector, TransportError> {
        let mut slot = self.connector.lock().await;
        if let Some(c) = slot.as_ref() {
            return Ok(c.clone());
        }
        let cfg = client_config(&self.opts)?;
        let connector = TlsConnector::from(Arc::new(cfg));
        *slot = Some(connector.clone());
        Ok(connector)
    }
}

#[async_trait]
impl StreamLayer for TlsLayer {
    async fn connect(&self, stream: BoxedStream, addr: &str) -> Result<BoxedStream, TransportError> {
        let connector = self.connector().await?;
        let host = if self.opts.server_name.trim().is_empty() {
            net::host_of(addr).to_string()
        } else {
            self.opts.server_name.trim().to_string()
        };
        let name = ServerName::try_from(host.clone())
            .map_err(|_| TransportError::Tls(format!("invalid server name {host:?}")))?;
        let tls = connector
            .connect(name, stream)
            .await
            .map_err(|e| TransportError::Handshake(format!("tls: {e}")))?;
        Ok(Box::new(tls))
    }

    async fn accept(&self, stream: BoxedStream) -> Result<BoxedStream, TransportError> {
        let acceptor = self.acceptor().await?;
        let tls = acceptor
            .accept(stream)
            .await
            .map_err(|e| TransportError::Handshake(format!("tls: {e}")))?;
        Ok(Box::new(tls))
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

pub fn load_or_generate_cert(
    cert_file: &str,
    key_file: &str,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), TransportError> {
    let cert_file = cert_file.trim();
    let key_file = key_file.trim();

    if !cert_file.is_empty() || !key_file.is_empty() {
        if cert_file.is_empty() || key_file.is_empty() {
            return Err(TransportError::Tls(
                "both cert_file and key_file are required (or neither to auto-generate)".into(),
            ));
        }
        let certs = load_certs(Path::new(cert_file))?;
        let key = load_key(Path::new(key_file))?;
        return Ok((certs, key));
    }

    tracing::info!("tunnel: no tls certificate configured; generating a self-signed one");
    let rcgen::CertifiedKey { cert, signing_key } =
        generate_simple_self_signed(["localhost".to_string()])
            .map_err(|e| TransportError::Tls(e.to_string()))?;
    let cert_der = cert.der().clone();
    let key_der = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(signing_key.serialize_der()));
    Ok((vec![cert_der], key_der))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let data = fs::read(path)
        .map_err(|e| TransportError::Tls(format!("read {}: {e}", path.display())))?;
    let mut rd = std::io::Cursor::new(&data);
    let certs = rustls_pemfile::certs(&mut rd)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::Tls(format!("parse {}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(TransportError::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TransportError> {
    let data = fs::read(path)
        .map_err(|e| TransportError::Tls(format!("read {}: {e}", path.display())))?;
    let mut rd = std::io::Cursor::new(&data);
    let key = rustls_pemfile::private_key(&mut rd)
        .map_err(|e| TransportError::Tls(format!("parse {}: {e}", path.display())))?;
    key.ok_or_else(|| TransportError::Tls(format!("no private key found in {}", path.display())))
}

fn server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<ServerConfig, TransportError> {
    ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TransportError::Tls(e.to_string()))
}

fn client_config(opts: &TlsOptions) -> Result<ClientConfig, TransportError> {
    let builder = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::Tls(e.to_string()))?;

    if opts.insecure {
        return Ok(builder
            .dangerous()
            .with_custom_certificate_verifier(SkipServerVerification::new())
            .with_no_client_auth());
    }

    let roots = if opts.ca_file.trim().is_empty() {
        RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned())
    } else {
        let mut roots = RootCertStore::empty();
        for cert in load_certs(Path::new(opts.ca_file.trim()))? {
            roots
                .add(cert)
                .map_err(|e| TransportError::Tls(e.to_string()))?;
        }
        roots
    };
    Ok(builder.with_root_certificates(roots).with_no_client_auth())
}

/// Certificate verifier that treats any certificate as valid.
///
/// NOTE: vulnerable to MITM; the inner secure channel still authenticates
/// the peer through the PSK.
#[derive(Debug)]
struct SkipServerVerification(Arc<CryptoProvider>);

impl SkipServerVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self(provider()))
    }
}

impl ServerCertVerifier for SkipServerVerification {
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
        dss: &rustls::DigitallySignedStruct,
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
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn half_configured_certificate_is_rejected() {
        let err = load_or_generate_cert("cert.pem", "").unwrap_err();
        assert!(matches!(err, TransportError::Tls(_)));
    }

    #[test]
    fn self_signed_certificate_builds_a_server_config() {
        let (certs, key) = load_or_generate_cert("", "").unwrap();
        assert_eq!(certs.len(), 1);
        server_config(certs, key).unwrap();
    }

    #[tokio::test]
    async fn verified_client_rejects_self_signed_server() {
        let server = TlsLayer::new(TlsOptions::default());
        let client = TlsLayer::new(TlsOptions::default());
        let (a, b) = tokio::io::duplex(64 * 1024);

        let accept = tokio::spawn(async move { server.accept(Box::new(b)).await.map(|_| ()) });
        let res = client.connect(Box::new(a), "localhost:443").await;
        assert!(matches!(res, Err(TransportError::Handshake(_))));
        let _ = accept.await;
    }
}
