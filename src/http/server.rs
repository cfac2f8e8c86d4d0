//! Proxy server: accept loop and per-connection dispatch.
//!
//! # Responsibilities
//! - Accept connections under the listener's connection limit
//! - Classify each connection by its first request head
//! - Hand upgrades to `proxy_ws`, everything else to hyper and `proxy_http`
//! - Stop accepting on shutdown and drain open connections
//!
//! # Design Decisions
//! - Every connection runs in a `connection` span carrying its id and peer
//! - Only the first request of a connection can become a websocket bridge;
//!   a later upgrade request on the same connection is refused with `501`
//!   and the connection is closed

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::header::{HeaderValue, CONNECTION};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rustls::ClientConfig;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tracing::Instrument;

use crate::config::ProxyConfig;
use crate::http::request::{InboundRequest, PeerInfo};
use crate::http::response::{ResponseBody, ResponseWriter};
use crate::net::connection::ConnectionTracker;
use crate::net::connector::default_client_config;
use crate::net::listener::{Listener, ListenerError};
use crate::net::sniff::{is_upgrade, sniff, PrefixedStream, Sniffed};
use crate::proxy::{Destination, ProxyRequest};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error("failed to build backend TLS configuration: {0}")]
    Tls(#[from] rustls::Error),
}

/// State shared by every connection task.
struct Shared {
    config: ProxyConfig,
    tls: Option<Arc<ClientConfig>>,
}

impl Shared {
    fn destination(&self) -> Destination {
        let backend = &self.config.backend;
        Destination::new(backend.host.clone(), backend.port)
            .secure(backend.secure)
            .with_tls(self.tls.clone())
            .connect_timeout(self.config.timeouts.connect())
    }

    fn peer(&self, addr: SocketAddr) -> PeerInfo {
        PeerInfo::new(addr, self.config.listener.inbound_secure)
    }
}

/// Forwards every inbound connection to the configured backend.
pub struct ProxyServer {
    shared: Arc<Shared>,
    tracker: ConnectionTracker,
}

impl ProxyServer {
    /// Build the server. Loads the backend TLS roots when the backend is secure.
    pub fn new(config: ProxyConfig) -> Result<Self, ServerError> {
        let tls = if config.backend.secure {
            Some(default_client_config()?)
        } else {
            None
        };

        Ok(Self {
            shared: Arc::new(Shared { config, tls }),
            tracker: ConnectionTracker::new(),
        })
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.shared.config
    }

    pub fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }

    /// Accept until `shutdown` fires, then drain for the configured grace period.
    pub async fn run(
        self,
        listener: Listener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        tracing::info!(
            address = ?listener.local_addr().ok(),
            backend_host = %self.shared.config.backend.host,
            backend_port = self.shared.config.backend.port,
            backend_secure = self.shared.config.backend.secure,
            "Proxy server starting"
        );

        loop {
            let (stream, addr, permit) = tokio::select! {
                _ = shutdown.recv() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(ListenerError::Accept(e)) => {
                        tracing::warn!(error = %e, "Accept failed");
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                },
            };

            let guard = self.tracker.track();
            let span = tracing::info_span!("connection", id = %guard.id(), peer = %addr);
            let shared = Arc::clone(&self.shared);
            let shutdown = shutdown.resubscribe();

            tokio::spawn(
                async move {
                    let _permit = permit;
                    let _guard = guard;
                    serve_connection(shared, stream, addr, shutdown).await;
                }
                .instrument(span),
            );
        }

        let grace = self.shared.config.timeouts.shutdown_grace();
        tracing::info!(
            active_connections = self.tracker.active_count(),
            grace_secs = grace.as_secs(),
            "Shutdown requested, draining connections"
        );
        if self.tracker.drain(grace).await {
            tracing::info!("All connections drained");
        } else {
            tracing::warn!(
                remaining = self.tracker.active_count(),
                "Grace period elapsed with connections still open"
            );
        }
        Ok(())
    }
}

async fn serve_connection(
    shared: Arc<Shared>,
    stream: TcpStream,
    addr: SocketAddr,
    shutdown: broadcast::Receiver<()>,
) {
    let peer = shared.peer(addr);
    let max_head_bytes = shared.config.listener.max_head_bytes;

    match sniff(stream, peer, max_head_bytes).await {
        Ok(Sniffed::Http(stream)) => serve_http(shared, stream, peer, shutdown).await,
        Ok(Sniffed::Upgrade {
            stream,
            head,
            buffered,
        }) => {
            let destination = shared.destination().with_head(buffered);
            let outcome = ProxyRequest::new(InboundRequest::new(head, ()), stream)
                .proxy_ws(destination)
                .wait()
                .await;
            if let Err(e) = outcome {
                tracing::debug!(error = %e, "Websocket connection finished with error");
            }
        }
        Ok(Sniffed::Closed) => tracing::trace!("Peer closed before sending a request"),
        Err(e) => tracing::debug!(error = %e, "Failed to read request head"),
    }
}

async fn serve_http(
    shared: Arc<Shared>,
    stream: PrefixedStream<TcpStream>,
    peer: PeerInfo,
    mut shutdown: broadcast::Receiver<()>,
) {
    let service = service_fn(move |request: Request<Incoming>| {
        let destination = shared.destination();
        async move {
            if is_upgrade(request.headers()) {
                tracing::warn!(
                    path = %request.uri(),
                    "Upgrade requested after the first request on a connection, refusing"
                );
                return Ok(upgrade_refused());
            }

            let (writer, pending) = ResponseWriter::channel();
            // The operation keeps running after the head is returned to hyper.
            let _handle = ProxyRequest::new(InboundRequest::from_http(request, Some(peer)), writer)
                .proxy_http(destination);
            Ok::<_, Infallible>(pending.into_response().await)
        }
    });

    let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = shutdown.recv() => {
            conn.as_mut().graceful_shutdown();
            conn.as_mut().await
        }
    };

    if let Err(e) = result {
        tracing::debug!(error = %e, "HTTP connection closed with error");
    }
}

/// `501` for an upgrade that arrived on an already established HTTP connection.
fn upgrade_refused() -> Response<ResponseBody> {
    let mut response = Response::new(ResponseBody::empty());
    *response.status_mut() = StatusCode::NOT_IMPLEMENTED;
    response
        .headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("close"));
    response
}
