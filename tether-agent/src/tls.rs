//! rustls client configuration for the broker connection.
//!
//! The broker is authenticated against a pinned root CA; the device presents
//! the certificate issued during enrollment.

use std::io::BufReader;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::orchestrator::{ConnError, DeviceCredentials};

/// Parse every certificate in `pem` into a root store.
pub fn load_roots(pem: &[u8]) -> Result<RootCertStore, ConnError> {
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut BufReader::new(pem)) {
        let cert = cert.map_err(|e| ConnError::Tls(format!("root CA: {e}")))?;
        roots
            .add(cert)
            .map_err(|e| ConnError::Tls(format!("root CA: {e}")))?;
    }
    if roots.is_empty() {
        return Err(ConnError::Tls("root CA file holds no certificates".into()));
    }
    Ok(roots)
}

/// Client config presenting the device credentials.
pub fn client_config(
    roots: RootCertStore,
    credentials: &DeviceCredentials,
) -> Result<ClientConfig, ConnError> {
    let chain = rustls_pemfile::certs(&mut BufReader::new(credentials.certificate_pem.as_bytes()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConnError::Tls(format!("device certificate: {e}")))?;
    if chain.is_empty() {
        return Err(ConnError::Tls("device certificate is empty".into()));
    }

    let key = rustls_pemfile::private_key(&mut BufReader::new(
        credentials.private_key_pem.as_bytes(),
    ))
    .map_err(|e| ConnError::Tls(format!("device key: {e}")))?
    .ok_or_else(|| ConnError::Tls("device key is empty".into()))?;

    ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| ConnError::Tls(e.to_string()))?
        .with_root_certificates(roots)
        .with_client_auth_cert(chain, key)
        .map_err(|e| ConnError::Tls(format!("device credentials rejected: {e}")))
}

/// Split `host[:port]`, falling back to `default_port`.
pub fn split_endpoint(endpoint: &str, default_port: u16) -> (&str, u16) {
    match endpoint.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => match port.parse() {
            Ok(port) => (host, port),
            Err(_) => (endpoint, default_port),
        },
        _ => (endpoint, default_port),
    }
}

/// TCP connect and TLS handshake, bounded by `timeout`.
pub async fn connect(
    config: Arc<ClientConfig>,
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<TlsStream<TcpStream>, ConnError> {
    let attempt = async {
        let tcp = TcpStream::connect((host, port))
            .await
            .map_err(|e| ConnError::TransportDown(format!("{host}:{port}: {e}")))?;
        tcp.set_nodelay(true)
            .map_err(|e| ConnError::TransportDown(e.to_string()))?;
        handshake(config, host, tcp).await
    };
    tokio::time::timeout(timeout, attempt)
        .await
        .map_err(|_| ConnError::TransportDown(format!("{host}:{port}: timed out")))?
}

/// TLS handshake over an already connected stream.
pub async fn handshake<S>(
    config: Arc<ClientConfig>,
    host: &str,
    stream: S,
) -> Result<TlsStream<S>, ConnError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| ConnError::Tls(format!("{host}: {e}")))?;
    TlsConnector::from(config)
        .connect(server_name, stream)
        .await
        .map_err(|e| ConnError::Tls(format!("handshake with {host}: {e}")))
}
