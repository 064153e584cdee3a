//! Mutual-TLS transport to the collector
//!
//! One connection per request: load credentials, connect, handshake, write a
//! single HTTP/1.1 POST, read a bounded response, close. Every step maps to
//! its own [`TransportError`] variant, and the socket is released on every
//! path (graceful `close_notify` when the session got that far, drop
//! otherwise).

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::{Certificate, ClientConfig, PrivateKey, RootCertStore, ServerName};
use tokio_rustls::TlsConnector;
use tracing::debug;

use super::payload::Resource;

/// Telemetry delivery failures, one per transport step
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to load TLS credentials: {0}")]
    CertificateLoad(String),

    #[error("failed to connect to {addr}: {reason}")]
    Connect { addr: String, reason: String },

    #[error("TLS handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("failed to write request: {0}")]
    WriteFailed(String),

    #[error("failed to read response: {0}")]
    ReadFailed(String),
}

/// Where and how to reach the collector
#[derive(Debug, Clone)]
pub struct CollectorEndpoint {
    pub host: String,
    pub port: u16,
    /// Name verified against the collector certificate (DNS name or IP)
    pub server_name: String,
    /// Path prefix, e.g. `/sas-api`
    pub base_path: String,
    pub client_cert_path: PathBuf,
    pub client_key_path: PathBuf,
    pub ca_cert_path: PathBuf,
    pub connect_timeout: Duration,
    pub io_timeout: Duration,
    pub max_response_bytes: usize,
}

impl CollectorEndpoint {
    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn path(&self, resource: Resource) -> String {
        format!(
            "{}/{}",
            self.base_path.trim_end_matches('/'),
            resource.path_segment()
        )
    }
}

/// Completed exchange, body not interpreted beyond the status line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectorResponse {
    pub status: Option<u16>,
    pub bytes: usize,
}

/// Sends one request body to a collector resource
#[async_trait]
pub trait Transport: Send + Sync {
    async fn post(&self, resource: Resource, body: &[u8]) -> Result<CollectorResponse, TransportError>;
}

fn open_pem(path: &Path) -> Result<BufReader<File>, TransportError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| TransportError::CertificateLoad(format!("{}: {}", path.display(), e)))
}

fn load_certs(path: &Path) -> Result<Vec<Certificate>, TransportError> {
    let mut reader = open_pem(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .map_err(|e| TransportError::CertificateLoad(format!("{}: {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(TransportError::CertificateLoad(format!(
            "{}: no certificates found",
            path.display()
        )));
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

fn load_private_key(path: &Path) -> Result<PrivateKey, TransportError> {
    let mut reader = open_pem(path)?;
    loop {
        let item = rustls_pemfile::read_one(&mut reader)
            .map_err(|e| TransportError::CertificateLoad(format!("{}: {}", path.display(), e)))?;
        match item {
            Some(rustls_pemfile::Item::PKCS8Key(key))
            | Some(rustls_pemfile::Item::RSAKey(key))
            | Some(rustls_pemfile::Item::ECKey(key)) => return Ok(PrivateKey(key)),
            Some(_) => continue,
            None => {
                return Err(TransportError::CertificateLoad(format!(
                    "{}: no private key found",
                    path.display()
                )))
            }
        }
    }
}

/// Build the client TLS config: client chain + key, trust only the CA
pub fn load_client_config(endpoint: &CollectorEndpoint) -> Result<Arc<ClientConfig>, TransportError> {
    let mut roots = RootCertStore::empty();
    for ca in load_certs(&endpoint.ca_cert_path)? {
        roots
            .add(&ca)
            .map_err(|e| TransportError::CertificateLoad(format!("CA certificate: {:?}", e)))?;
    }

    let chain = load_certs(&endpoint.client_cert_path)?;
    let key = load_private_key(&endpoint.client_key_path)?;

    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_client_auth_cert(chain, key)
        .map_err(|e| TransportError::CertificateLoad(e.to_string()))?;
    Ok(Arc::new(config))
}

/// Format a single-shot HTTP/1.1 POST
fn build_request(host: &str, path: &str, body: &[u8]) -> Vec<u8> {
    let head = format!(
        "POST {} HTTP/1.1\r\n\
         Host: {}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n",
        path,
        host,
        body.len()
    );
    let mut request = Vec::with_capacity(head.len() + body.len());
    request.extend_from_slice(head.as_bytes());
    request.extend_from_slice(body);
    request
}

/// Status code from an HTTP status line, if there is one
fn parse_status(response: &[u8]) -> Option<u16> {
    let line_end = response.iter().position(|&b| b == b'\r' || b == b'\n')?;
    let line = std::str::from_utf8(&response[..line_end]).ok()?;
    let mut parts = line.split_whitespace();
    if !parts.next()?.starts_with("HTTP/") {
        return None;
    }
    parts.next()?.parse().ok()
}

/// One TCP connection plus one TLS client session
struct TlsSession {
    stream: TlsStream<TcpStream>,
    io_timeout: Duration,
}

impl TlsSession {
    /// Connect and complete the handshake
    async fn open(
        endpoint: &CollectorEndpoint,
        config: Arc<ClientConfig>,
    ) -> Result<Self, TransportError> {
        let addr = endpoint.addr();
        let server_name = ServerName::try_from(endpoint.server_name.as_str())
            .map_err(|e| TransportError::HandshakeFailed(format!("invalid server name: {}", e)))?;

        let tcp = match timeout(endpoint.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(tcp)) => tcp,
            Ok(Err(e)) => {
                return Err(TransportError::Connect {
                    addr,
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(TransportError::Connect {
                    addr,
                    reason: "timed out".to_string(),
                })
            }
        };
        let _ = tcp.set_nodelay(true);

        // On failure the TcpStream is dropped here, closing the socket
        let connector = TlsConnector::from(config);
        let stream = match timeout(endpoint.io_timeout, connector.connect(server_name, tcp)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(TransportError::HandshakeFailed(e.to_string())),
            Err(_) => return Err(TransportError::HandshakeFailed("timed out".to_string())),
        };

        Ok(Self {
            stream,
            io_timeout: endpoint.io_timeout,
        })
    }

    async fn write_request(&mut self, request: &[u8]) -> Result<(), TransportError> {
        let write = async {
            self.stream.write_all(request).await?;
            self.stream.flush().await
        };
        match timeout(self.io_timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(TransportError::WriteFailed(e.to_string())),
            Err(_) => Err(TransportError::WriteFailed("timed out".to_string())),
        }
    }

    /// Read until EOF or `max_bytes`, whichever comes first
    async fn read_response(&mut self, max_bytes: usize) -> Result<Vec<u8>, TransportError> {
        let mut response = Vec::new();
        let mut limited = (&mut self.stream).take(max_bytes as u64);
        let read = limited.read_to_end(&mut response);
        match timeout(self.io_timeout, read).await {
            Ok(Ok(_)) => Ok(response),
            // Peers that skip close_notify still delivered a full response
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof && !response.is_empty() => {
                Ok(response)
            }
            Ok(Err(e)) => Err(TransportError::ReadFailed(e.to_string())),
            Err(_) => Err(TransportError::ReadFailed("timed out".to_string())),
        }
    }

    /// Send close_notify and shut the socket
    async fn close(mut self) {
        if let Err(e) = timeout(self.io_timeout, self.stream.shutdown()).await {
            debug!("TLS shutdown timed out: {}", e);
        }
    }
}

/// Connection-per-request mutual-TLS transport
pub struct TlsTransport {
    endpoint: CollectorEndpoint,
    /// Fixed client config; credentials are reloaded per request when unset
    client_config: Option<Arc<ClientConfig>>,
}

impl TlsTransport {
    pub fn new(endpoint: CollectorEndpoint) -> Self {
        Self {
            endpoint,
            client_config: None,
        }
    }

    #[cfg(test)]
    pub fn with_client_config(endpoint: CollectorEndpoint, config: Arc<ClientConfig>) -> Self {
        Self {
            endpoint,
            client_config: Some(config),
        }
    }
}

#[async_trait]
impl Transport for TlsTransport {
    async fn post(&self, resource: Resource, body: &[u8]) -> Result<CollectorResponse, TransportError> {
        let config = match &self.client_config {
            Some(config) => config.clone(),
            None => load_client_config(&self.endpoint)?,
        };

        let mut session = TlsSession::open(&self.endpoint, config).await?;

        let request = build_request(&self.endpoint.host, &self.endpoint.path(resource), body);
        let result = match session.write_request(&request).await {
            Ok(()) => session.read_response(self.endpoint.max_response_bytes).await,
            Err(e) => Err(e),
        };
        session.close().await;

        let response = result?;
        Ok(CollectorResponse {
            status: parse_status(&response),
            bytes: response.len(),
        })
    }
}
