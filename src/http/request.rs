//! Inbound request representation.
//!
//! # Responsibilities
//! - Capture the parts of a client request the forwarding core reads
//!   (method, path, headers, peer)
//! - Build that view from a hyper request or from a raw head parsed by
//!   the connection sniffer
//!
//! # Design Decisions
//! - The head is immutable for the duration of one forwarding operation
//! - Peer information is optional: a torn-down connection has none

use std::net::SocketAddr;

use http::{HeaderMap, HeaderName, HeaderValue, Method};

/// Connection-layer details of the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerInfo {
    /// Remote address and port of the client.
    pub addr: SocketAddr,
    /// Whether the inbound hop is already secure (TLS terminated upstream of us).
    pub secure: bool,
}

impl PeerInfo {
    pub fn new(addr: SocketAddr, secure: bool) -> Self {
        Self { addr, secure }
    }
}

/// Method, target and headers of an inbound request.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    /// Path and query, e.g. `/search?q=1`.
    pub path: String,
    pub headers: HeaderMap,
    pub peer: Option<PeerInfo>,
}

impl RequestHead {
    pub fn new(method: Method, path: impl Into<String>, headers: HeaderMap) -> Self {
        Self {
            method,
            path: path.into(),
            headers,
            peer: None,
        }
    }

    /// Attach the client's connection details.
    pub fn with_peer(mut self, peer: PeerInfo) -> Self {
        self.peer = Some(peer);
        self
    }

    /// Build from the parts of a request received by hyper.
    pub fn from_parts(parts: &http::request::Parts, peer: Option<PeerInfo>) -> Self {
        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        Self {
            method: parts.method.clone(),
            path,
            headers: parts.headers.clone(),
            peer,
        }
    }

    /// Build from a request head parsed with httparse.
    ///
    /// Returns `None` when the method is missing or not a valid token.
    /// Header lines that are not valid HTTP header names or values are skipped.
    pub fn from_httparse(req: &httparse::Request<'_, '_>, peer: Option<PeerInfo>) -> Option<Self> {
        let method = Method::from_bytes(req.method?.as_bytes()).ok()?;
        let path = req.path.unwrap_or("/").to_string();

        let mut headers = HeaderMap::with_capacity(req.headers.len());
        for header in req.headers.iter() {
            let Ok(name) = HeaderName::from_bytes(header.name.as_bytes()) else {
                continue;
            };
            let Ok(value) = HeaderValue::from_bytes(header.value) else {
                continue;
            };
            headers.append(name, value);
        }

        Some(Self {
            method,
            path,
            headers,
            peer,
        })
    }
}

/// An inbound request: its head plus a body stream.
///
/// WebSocket upgrades carry no body; use `()` there.
#[derive(Debug)]
pub struct InboundRequest<B> {
    pub head: RequestHead,
    pub body: B,
}

impl<B> InboundRequest<B> {
    pub fn new(head: RequestHead, body: B) -> Self {
        Self { head, body }
    }

    /// Split a hyper request into head and body.
    pub fn from_http(request: http::Request<B>, peer: Option<PeerInfo>) -> Self {
        let (parts, body) = request.into_parts();
        Self {
            head: RequestHead::from_parts(&parts, peer),
            body,
        }
    }
}
