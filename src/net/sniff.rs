//! First-request sniffing.
//!
//! # Responsibilities
//! - Read the head of the first request on a fresh connection
//! - Split websocket upgrades from plain HTTP traffic
//! - Replay consumed bytes to hyper for plain HTTP
//!
//! # Design Decisions
//! - Upgrades keep the raw socket: the backend's handshake reply is relayed
//!   by the forwarding core, not produced by hyper
//! - Anything unparsable is handed to hyper unchanged, which answers with
//!   the appropriate 4xx

use std::cmp::min;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use http::header::{CONNECTION, UPGRADE};
use http::HeaderMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

use crate::http::request::{PeerInfo, RequestHead};

/// A stream that yields `prefix` before reading from `inner`.
#[derive(Debug)]
pub struct PrefixedStream<S> {
    inner: S,
    prefix: Bytes,
}

impl<S> PrefixedStream<S> {
    pub fn new(inner: S, prefix: Bytes) -> Self {
        Self { inner, prefix }
    }

    pub fn into_inner(self) -> (S, Bytes) {
        (self.inner, self.prefix)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() && buf.remaining() > 0 {
            let n = min(self.prefix.len(), buf.remaining());
            let chunk = self.prefix.split_to(n);
            buf.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// What the first request on a connection turned out to be.
#[derive(Debug)]
pub enum Sniffed<S> {
    /// Plain HTTP; serve with hyper.
    Http(PrefixedStream<S>),
    /// Websocket upgrade; `buffered` holds bytes read past the request head.
    Upgrade {
        stream: S,
        head: RequestHead,
        buffered: Bytes,
    },
    /// Peer closed before sending anything.
    Closed,
}

enum Parsed {
    Incomplete,
    Plain,
    Upgrade { len: usize, head: RequestHead },
}

/// Read the first request head from `stream` and classify the connection.
pub async fn sniff<S>(mut stream: S, peer: PeerInfo, max_head_bytes: usize) -> io::Result<Sniffed<S>>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);

    loop {
        if stream.read_buf(&mut buf).await? == 0 {
            if buf.is_empty() {
                return Ok(Sniffed::Closed);
            }
            return Ok(Sniffed::Http(PrefixedStream::new(stream, buf.freeze())));
        }

        match parse(&buf, peer) {
            Parsed::Incomplete if buf.len() < max_head_bytes => continue,
            Parsed::Incomplete | Parsed::Plain => {
                return Ok(Sniffed::Http(PrefixedStream::new(stream, buf.freeze())));
            }
            Parsed::Upgrade { len, head } => {
                let buffered = buf.split_off(len).freeze();
                tracing::debug!(path = %head.path, buffered = buffered.len(), "Upgrade request received");
                return Ok(Sniffed::Upgrade {
                    stream,
                    head,
                    buffered,
                });
            }
        }
    }
}

fn parse(buf: &[u8], peer: PeerInfo) -> Parsed {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut req = httparse::Request::new(&mut headers);
    let len = match req.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Parsed::Incomplete,
        Err(e) => {
            tracing::debug!(error = %e, "Unparsable request head, leaving it to the HTTP server");
            return Parsed::Plain;
        }
    };

    match RequestHead::from_httparse(&req, Some(peer)) {
        Some(head) if is_upgrade(&head.headers) => Parsed::Upgrade { len, head },
        _ => Parsed::Plain,
    }
}

/// `Connection: upgrade` plus an `Upgrade` header.
pub fn is_upgrade(headers: &HeaderMap) -> bool {
    let connection_upgrade = headers.get_all(CONNECTION).iter().any(|value| {
        value
            .to_str()
            .map(|v| v.split(',').any(|token| token.trim().eq_ignore_ascii_case("upgrade")))
            .unwrap_or(false)
    });
    connection_upgrade && headers.contains_key(UPGRADE)
}
