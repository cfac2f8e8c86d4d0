//! Outbound connection establishment.
//!
//! # Responsibilities
//! - Open a TCP connection to a backend, optionally bounded by a timeout
//! - Wrap it in TLS when the destination is secure
//! - Hand back a type-erased duplex stream
//!
//! # Design Decisions
//! - One dial, one connection: nothing here is pooled or shared
//! - Default TLS trust comes from webpki-roots; callers may supply their own config

use std::io;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::proxy::ForwardError;

/// Any duplex byte stream usable as an outbound connection.
pub trait Upstream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> Upstream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// A type-erased outbound connection.
pub type BoxedStream = Box<dyn Upstream>;

/// Client TLS configuration trusting the webpki root set.
pub fn default_client_config() -> Result<Arc<ClientConfig>, rustls::Error> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Knows how to reach one backend.
#[derive(Debug, Clone)]
pub struct Dialer {
    host: String,
    port: u16,
    secure: bool,
    tls: Option<Arc<ClientConfig>>,
    connect_timeout: Option<Duration>,
}

impl Dialer {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            secure: false,
            tls: None,
            connect_timeout: None,
        }
    }

    /// Use TLS, with `config` or the default trust store.
    pub fn secure(mut self, config: Option<Arc<ClientConfig>>) -> Self {
        self.secure = true;
        self.tls = config;
        self
    }

    pub fn connect_timeout(mut self, limit: Option<Duration>) -> Self {
        self.connect_timeout = limit;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// Open a fresh connection to the backend.
    pub async fn connect(&self) -> Result<BoxedStream, ForwardError> {
        let connect = TcpStream::connect((self.host.as_str(), self.port));
        let tcp = match self.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, connect)
                .await
                .map_err(|_| ForwardError::ConnectTimeout {
                    host: self.host.clone(),
                    port: self.port,
                    after: limit,
                })?,
            None => connect.await,
        }
        .map_err(|e| self.connect_error(e))?;

        if let Err(e) = tcp.set_nodelay(true) {
            tracing::trace!(error = %e, "Failed to set TCP_NODELAY on backend connection");
        }

        if !self.secure {
            return Ok(Box::new(tcp));
        }

        let config = match &self.tls {
            Some(config) => Arc::clone(config),
            None => default_client_config().map_err(|e| ForwardError::Tls(Arc::new(e)))?,
        };
        let server_name = ServerName::try_from(self.host.clone())
            .map_err(|e| self.connect_error(io::Error::new(io::ErrorKind::InvalidInput, e)))?;

        let stream = TlsConnector::from(config)
            .connect(server_name, tcp)
            .await
            .map_err(|e| self.connect_error(e))?;

        tracing::trace!(host = %self.host, port = self.port, "TLS session established");
        Ok(Box::new(stream))
    }

    fn connect_error(&self, source: io::Error) -> ForwardError {
        ForwardError::Connect {
            host: self.host.clone(),
            port: self.port,
            source: Arc::new(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::ErrorKind;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn connects_plain() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await.unwrap();
            buf
        });

        let mut stream = Dialer::new("127.0.0.1", addr.port()).connect().await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        assert_eq!(&accept.await.unwrap(), b"ping");
    }

    #[tokio::test]
    async fn refused_connection_is_outbound_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = match Dialer::new("127.0.0.1", port).connect().await {
            Ok(_) => panic!("connection should be refused"),
            Err(err) => err,
        };
        assert_eq!(err.kind(), ErrorKind::OutboundConnect);
        assert!(err.to_string().contains(&format!("127.0.0.1:{port}")));
    }

    #[test]
    fn default_tls_config_builds() {
        assert!(default_client_config().is_ok());
    }
}
