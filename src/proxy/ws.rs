//! WebSocket upgrade forwarding.
//!
//! ```text
//! idle ──▶ dispatched ──▶ awaitingUpgrade ─────────┐
//!              │                                   ├──▶ bridging ──▶ terminated
//!              └──────▶ awaitingHandshakeBytes ────┘
//! ```
//!
//! The upgrade request is written by hand onto a raw backend connection,
//! followed by the bytes the inbound transport had already read past the
//! client's request head. The backend reply is scanned for the end of its
//! head block. A reply that signals the upgrade (`101` with an `Upgrade`
//! header) is relayed verbatim. Anything else is the legacy variant: a `101`
//! without upgrade framing is replaced by a synthesized switching-protocols
//! head, other statuses are relayed as they are. Bytes after the head block
//! open the bridged stream, which then copies both directions until either
//! side closes.
//!
//! The client socket is read throughout the handshake. If it closes first,
//! the backend connection is dropped and the operation fails with
//! `InboundAbort`.

use bytes::{BufMut, Bytes, BytesMut};
use http::header::{HeaderName, HeaderValue, SEC_WEBSOCKET_ACCEPT, UPGRADE};
use http::HeaderMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::http::request::RequestHead;
use crate::net::connector::{BoxedStream, Dialer};
use crate::proxy::fault::FaultBoundary;
use crate::proxy::headers::Protocol;
use crate::proxy::outgoing::{Destination, OutgoingDescriptor};
use crate::proxy::{ForwardError, Hooks};

const TERMINATOR: &[u8] = b"\r\n\r\n";

/// Largest backend handshake reply accepted before giving up.
pub const MAX_HANDSHAKE_BYTES: usize = 64 * 1024;

/// Progress of reading the backend's handshake reply.
#[derive(Debug, Default)]
pub struct HandshakeState {
    /// Status code of the reply, once parsed.
    pub status: Option<u16>,
    /// Headers of the reply, once parsed.
    pub headers: HeaderMap,
    /// The reply did not signal a protocol upgrade and needs rewriting.
    pub legacy: bool,
    cursor: usize,
    boundary: Option<usize>,
}

impl HandshakeState {
    /// Look for the end of the head block in `buf`, which holds every byte
    /// received so far. Returns the offset just past `\r\n\r\n`.
    ///
    /// Scanning resumes where the previous call stopped, so a terminator
    /// split across reads is still found. Once found the answer is fixed.
    pub fn scan(&mut self, buf: &[u8]) -> Option<usize> {
        if let Some(end) = self.boundary {
            return Some(end);
        }

        let start = self.cursor.saturating_sub(TERMINATOR.len() - 1).min(buf.len());
        match buf[start..].windows(TERMINATOR.len()).position(|w| w == TERMINATOR) {
            Some(pos) => {
                let end = start + pos + TERMINATOR.len();
                self.boundary = Some(end);
                self.cursor = end;
                Some(end)
            }
            None => {
                self.cursor = buf.len();
                None
            }
        }
    }

    /// Bytes of the reply consumed by scanning so far.
    pub fn consumed(&self) -> usize {
        self.cursor
    }

    /// Parse the head block and record status, headers and the legacy flag.
    pub fn capture(&mut self, block: &[u8]) -> Result<(), ForwardError> {
        let mut raw_headers = [httparse::EMPTY_HEADER; 64];
        let mut response = httparse::Response::new(&mut raw_headers);
        match response.parse(block) {
            Ok(httparse::Status::Complete(_)) => {}
            Ok(httparse::Status::Partial) => {
                return Err(ForwardError::ProtocolMismatch(
                    "incomplete handshake reply".to_string(),
                ))
            }
            Err(e) => {
                return Err(ForwardError::ProtocolMismatch(format!(
                    "malformed handshake reply: {e}"
                )))
            }
        }

        let mut headers = HeaderMap::with_capacity(response.headers.len());
        for header in response.headers.iter() {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(header.name.as_bytes()),
                HeaderValue::from_bytes(header.value),
            ) {
                headers.append(name, value);
            }
        }

        self.status = response.code;
        self.legacy = !(self.status == Some(101) && headers.contains_key(UPGRADE));
        self.headers = headers;
        Ok(())
    }

    /// Bytes to send the client in place of the backend's head block.
    pub fn reply(&self, block: &[u8]) -> Bytes {
        if self.legacy && self.status == Some(101) {
            let accept = self
                .headers
                .get(SEC_WEBSOCKET_ACCEPT)
                .map(HeaderValue::as_bytes)
                .unwrap_or_default();
            legacy_upgrade_reply(accept)
        } else {
            Bytes::copy_from_slice(block)
        }
    }
}

fn legacy_upgrade_reply(accept: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(128 + accept.len());
    buf.put_slice(b"HTTP/1.1 101 Switching Protocols\r\n");
    buf.put_slice(b"Upgrade: websocket\r\n");
    buf.put_slice(b"Connection: Upgrade\r\n");
    buf.put_slice(b"Sec-WebSocket-Accept: ");
    buf.put_slice(accept);
    buf.put_slice(b"\r\n\r\n");
    buf.freeze()
}

/// Drive one websocket forwarding operation to its single terminal outcome.
///
/// Clean closure of either side after the handshake is success; on failure
/// both connections are dropped before the error is reported.
pub(crate) async fn forward<S>(
    head: RequestHead,
    socket: S,
    destination: Destination,
    mut hooks: Hooks,
) -> Result<(), ForwardError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let descriptor = OutgoingDescriptor::build(&head, &destination, Protocol::Ws);

    tracing::debug!(
        host = %descriptor.host,
        port = descriptor.port,
        path = %descriptor.path,
        buffered = destination.head.len(),
        "WebSocket forwarding started"
    );
    hooks.started(&descriptor);

    let (boundary, scope) = FaultBoundary::new("ws");
    scope.spawn(upgrade(
        descriptor.clone(),
        destination.dialer(),
        destination.head.clone(),
        socket,
    ));
    drop(scope);

    let outcome = boundary.settle().await;
    match &outcome {
        Ok(()) => tracing::debug!(host = %descriptor.host, port = descriptor.port, "WebSocket closed"),
        Err(err) if hooks.handles_errors() => {
            tracing::warn!(error = %err, host = %descriptor.host, port = descriptor.port, "WebSocket forwarding failed")
        }
        Err(err) => tracing::error!(
            error = %err,
            host = %descriptor.host,
            port = descriptor.port,
            "Unhandled WebSocket forwarding failure, both sides closed"
        ),
    }

    hooks.finish(&outcome, &descriptor);
    outcome
}

/// Backend connection whose handshake reply has been read completely.
struct Handshaken {
    upstream: BoxedStream,
    /// What the client receives in place of the backend's head block.
    reply: Bytes,
    /// Bytes the backend sent after its head block.
    trailing: BytesMut,
}

/// Run the handshake while watching the client socket.
///
/// If the client closes before the backend has answered, the dial or the
/// handshake in progress is dropped, closing the backend connection.
/// Bytes the client sends meanwhile are held back and forwarded once the
/// handshake completes.
async fn upgrade<S>(
    descriptor: OutgoingDescriptor,
    dialer: Dialer,
    head: Bytes,
    mut socket: S,
) -> Result<(), ForwardError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut early = BytesMut::with_capacity(1024);
    let handshake = handshake(&descriptor, dialer, head);
    tokio::pin!(handshake);

    let Handshaken {
        mut upstream,
        reply,
        trailing,
    } = loop {
        tokio::select! {
            done = &mut handshake => break done?,
            read = socket.read_buf(&mut early), if early.len() < MAX_HANDSHAKE_BYTES => match read {
                Ok(0) | Err(_) => {
                    tracing::debug!(
                        host = %descriptor.host,
                        port = descriptor.port,
                        "Client closed during websocket handshake, dropping backend connection"
                    );
                    return Err(ForwardError::InboundAbort);
                }
                Ok(_) => {}
            },
        }
    };

    socket
        .write_all(&reply)
        .await
        .map_err(|_| ForwardError::WriteFailure)?;
    if !trailing.is_empty() {
        socket.write_all(&trailing).await.map_err(|_| ForwardError::WriteFailure)?;
    }
    socket.flush().await.map_err(|_| ForwardError::WriteFailure)?;

    if !early.is_empty() {
        upstream.write_all(&early).await.map_err(ForwardError::upstream_io)?;
    }

    bridge(socket, upstream).await
}

async fn handshake(
    descriptor: &OutgoingDescriptor,
    dialer: Dialer,
    head: Bytes,
) -> Result<Handshaken, ForwardError> {
    let mut upstream = dialer.connect().await?;

    upstream
        .write_all(&descriptor.encode_head())
        .await
        .map_err(ForwardError::upstream_io)?;
    if !head.is_empty() {
        upstream.write_all(&head).await.map_err(ForwardError::upstream_io)?;
    }
    upstream.flush().await.map_err(ForwardError::upstream_io)?;

    let mut state = HandshakeState::default();
    let mut buf = BytesMut::with_capacity(4096);
    let end = loop {
        let read = upstream
            .read_buf(&mut buf)
            .await
            .map_err(ForwardError::upstream_io)?;
        if read == 0 {
            return Err(ForwardError::ProtocolMismatch(format!(
                "backend closed after {} bytes without completing the handshake",
                buf.len()
            )));
        }
        if let Some(end) = state.scan(&buf) {
            break end;
        }
        if state.consumed() > MAX_HANDSHAKE_BYTES {
            return Err(ForwardError::ProtocolMismatch(format!(
                "handshake reply exceeds {MAX_HANDSHAKE_BYTES} bytes"
            )));
        }
    };

    let block = buf.split_to(end);
    state.capture(&block)?;
    tracing::debug!(status = ?state.status, legacy = state.legacy, "Backend handshake received");

    Ok(Handshaken {
        upstream,
        reply: state.reply(&block),
        trailing: buf,
    })
}

#[derive(Debug, Clone, Copy)]
enum ClosedBy {
    Client,
    Backend,
}

/// Copy bytes both ways until either side closes, then close the other.
pub async fn bridge<A, B>(inbound: A, upstream: B) -> Result<(), ForwardError>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut inbound_rx, mut inbound_tx) = tokio::io::split(inbound);
    let (mut upstream_rx, mut upstream_tx) = tokio::io::split(upstream);

    let result = tokio::select! {
        sent = tokio::io::copy(&mut inbound_rx, &mut upstream_tx) => sent.map(|n| (ClosedBy::Client, n)),
        received = tokio::io::copy(&mut upstream_rx, &mut inbound_tx) => received.map(|n| (ClosedBy::Backend, n)),
    };

    let _ = inbound_tx.shutdown().await;
    let _ = upstream_tx.shutdown().await;

    match result {
        Ok((closed_by, bytes)) => {
            tracing::debug!(closed_by = ?closed_by, bytes, "Bridge closed");
            Ok(())
        }
        Err(e) => Err(ForwardError::bridge(e)),
    }
}
