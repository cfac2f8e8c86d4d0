//! Outbound request construction.
//!
//! A [`Destination`] names the backend for one call; combined with the
//! inbound request head it yields an [`OutgoingDescriptor`], the immutable
//! recipe for the single outbound request of that call.

use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use http::{HeaderMap, Method};
use rustls::ClientConfig;

use crate::http::request::RequestHead;
use crate::net::connector::{BoxedStream, Dialer};
use crate::proxy::headers::{forwarded_headers, Protocol};
use crate::proxy::ForwardError;

/// Backend to forward one request to.
#[derive(Debug, Clone)]
pub struct Destination {
    pub host: String,
    pub port: u16,
    /// Use TLS on the outbound leg.
    pub secure: bool,
    /// Bytes the inbound transport already read past the upgrade head
    /// (websocket only).
    pub head: Bytes,
    /// TLS client config overriding the default trust store.
    pub tls: Option<Arc<ClientConfig>>,
    pub connect_timeout: Option<Duration>,
}

impl Destination {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            secure: false,
            head: Bytes::new(),
            tls: None,
            connect_timeout: None,
        }
    }

    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn with_head(mut self, head: Bytes) -> Self {
        self.head = head;
        self
    }

    pub fn with_tls(mut self, config: Option<Arc<ClientConfig>>) -> Self {
        self.tls = config;
        self
    }

    pub fn connect_timeout(mut self, limit: Option<Duration>) -> Self {
        self.connect_timeout = limit;
        self
    }

    pub(crate) fn dialer(&self) -> Dialer {
        let dialer = Dialer::new(self.host.clone(), self.port).connect_timeout(self.connect_timeout);
        if self.secure {
            dialer.secure(self.tls.clone())
        } else {
            dialer
        }
    }
}

/// Per-call connection agent for HTTP forwarding.
///
/// Each outbound HTTP request gets its own agent, so connection reuse is
/// decided per call: an agent opens exactly one connection and that
/// connection lives and dies with its forwarding operation.
#[derive(Debug, Clone)]
pub enum ConnectionAgent {
    Plain(Dialer),
    Secure(Dialer),
}

impl ConnectionAgent {
    fn for_destination(destination: &Destination) -> Self {
        let dialer = destination.dialer();
        if destination.secure {
            ConnectionAgent::Secure(dialer)
        } else {
            ConnectionAgent::Plain(dialer)
        }
    }

    pub fn is_secure(&self) -> bool {
        matches!(self, ConnectionAgent::Secure(_))
    }

    pub fn dialer(&self) -> &Dialer {
        match self {
            ConnectionAgent::Plain(dialer) | ConnectionAgent::Secure(dialer) => dialer,
        }
    }

    pub async fn connect(&self) -> Result<BoxedStream, ForwardError> {
        self.dialer().connect().await
    }
}

/// Everything needed to issue the outbound request of one forwarding call.
#[derive(Debug, Clone)]
pub struct OutgoingDescriptor {
    pub host: String,
    pub port: u16,
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    /// Present for HTTP only; the websocket path dials its own raw socket.
    pub agent: Option<ConnectionAgent>,
}

impl OutgoingDescriptor {
    pub fn build(head: &RequestHead, destination: &Destination, protocol: Protocol) -> Self {
        let agent = match protocol {
            Protocol::Http => Some(ConnectionAgent::for_destination(destination)),
            Protocol::Ws => None,
        };

        Self {
            host: destination.host.clone(),
            port: destination.port,
            method: head.method.clone(),
            path: head.path.clone(),
            headers: forwarded_headers(&head.headers, head.peer.as_ref(), protocol),
            agent,
        }
    }

    /// Serialise the request line and headers for a raw connection.
    pub fn encode_head(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(256);
        buf.put_slice(self.method.as_str().as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(self.path.as_bytes());
        buf.put_slice(b" HTTP/1.1\r\n");
        for (name, value) in &self.headers {
            buf.put_slice(name.as_str().as_bytes());
            buf.put_slice(b": ");
            buf.put_slice(value.as_bytes());
            buf.put_slice(b"\r\n");
        }
        buf.put_slice(b"\r\n");
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::request::PeerInfo;

    fn head() -> RequestHead {
        let mut headers = HeaderMap::new();
        headers.insert("host", "front.example".parse().unwrap());
        RequestHead::new(Method::GET, "/chat?room=1", headers)
            .with_peer(PeerInfo::new("192.168.1.9:51000".parse().unwrap(), false))
    }

    #[test]
    fn http_descriptor_carries_agent() {
        let destination = Destination::new("backend.internal", 9000);
        let out = OutgoingDescriptor::build(&head(), &destination, Protocol::Http);

        assert_eq!(out.host, "backend.internal");
        assert_eq!(out.port, 9000);
        assert_eq!(out.method, Method::GET);
        assert_eq!(out.path, "/chat?room=1");
        assert_eq!(out.headers["x-forwarded-for"], "192.168.1.9");
        assert_eq!(out.headers["x-forwarded-proto"], "http");

        let agent = out.agent.expect("http descriptor has an agent");
        assert!(!agent.is_secure());
        assert_eq!(agent.dialer().host(), "backend.internal");
        assert_eq!(agent.dialer().port(), 9000);
    }

    #[test]
    fn secure_destination_selects_secure_agent() {
        let destination = Destination::new("backend.internal", 443).secure(true);
        let out = OutgoingDescriptor::build(&head(), &destination, Protocol::Http);
        assert!(out.agent.unwrap().is_secure());
    }

    #[test]
    fn websocket_descriptor_has_no_agent() {
        let destination = Destination::new("backend.internal", 9000).secure(true);
        let out = OutgoingDescriptor::build(&head(), &destination, Protocol::Ws);
        assert!(out.agent.is_none());
        assert_eq!(out.headers["x-forwarded-proto"], "ws");
    }

    #[test]
    fn encodes_request_head() {
        let destination = Destination::new("backend.internal", 9000);
        let out = OutgoingDescriptor::build(&head(), &destination, Protocol::Ws);
        let raw = out.encode_head();

        let mut headers = [httparse::EMPTY_HEADER; 8];
        let mut req = httparse::Request::new(&mut headers);
        let status = req.parse(&raw).unwrap();
        assert!(status.is_complete());
        assert_eq!(status.unwrap(), raw.len());
        assert_eq!(req.method, Some("GET"));
        assert_eq!(req.path, Some("/chat?room=1"));
        assert!(req
            .headers
            .iter()
            .any(|h| h.name == "x-forwarded-port" && h.value == b"51000"));
    }
}
