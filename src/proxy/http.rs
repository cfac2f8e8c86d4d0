//! HTTP request/response forwarding.
//!
//! ```text
//! idle ──▶ dispatched ──▶ headersReceived ──▶ streaming ──▶ terminated
//!            │                  │                 │
//!            └──────────────────┴─────────────────┴──▶ terminated (error / inbound close)
//! ```
//!
//! One call opens one backend connection through the descriptor's agent,
//! streams the inbound body to it and streams the response back. The
//! exchange, the connection driver and the inbound-close watcher all run
//! under one fault boundary, so the first of them to finish decides the
//! outcome and the rest are torn down.

use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_TYPE};
use http::{HeaderMap, HeaderValue, Method, Request, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::BodyExt;
use hyper::body::Body;
use hyper_util::rt::TokioIo;

use crate::http::request::InboundRequest;
use crate::http::response::ResponseWriter;
use crate::proxy::fault::{FaultBoundary, FaultScope};
use crate::proxy::headers::Protocol;
use crate::proxy::outgoing::{Destination, OutgoingDescriptor};
use crate::proxy::{BoxError, ForwardError, Hooks};

type OutboundBody = UnsyncBoxBody<Bytes, BoxError>;

/// Drive one HTTP forwarding operation to its single terminal outcome.
pub(crate) async fn forward<B>(
    request: InboundRequest<B>,
    writer: ResponseWriter,
    destination: Destination,
    mut hooks: Hooks,
) -> Result<(), ForwardError>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    let InboundRequest { head, body } = request;
    let descriptor = OutgoingDescriptor::build(&head, &destination, Protocol::Http);

    tracing::debug!(
        method = %descriptor.method,
        host = %descriptor.host,
        port = descriptor.port,
        path = %descriptor.path,
        "HTTP forwarding started"
    );
    hooks.started(&descriptor);

    let (boundary, scope) = FaultBoundary::new("http");

    let closed = writer.closed();
    scope.watch(async move {
        closed.await;
        tracing::debug!("Inbound connection closed, aborting backend request");
        Err(ForwardError::InboundAbort)
    });

    let body: OutboundBody = body.map_err(Into::into).boxed_unsync();
    scope.spawn(exchange(descriptor.clone(), body, writer.clone(), scope.clone()));
    drop(scope);

    let outcome = boundary.settle().await;
    match &outcome {
        Ok(()) => tracing::debug!(
            method = %descriptor.method,
            host = %descriptor.host,
            port = descriptor.port,
            path = %descriptor.path,
            "HTTP forwarding finished"
        ),
        Err(err) => tracing::warn!(
            error = %err,
            host = %descriptor.host,
            port = descriptor.port,
            "HTTP forwarding failed"
        ),
    }

    let unhandled = outcome.is_err() && !hooks.handles_errors();
    hooks.finish(&outcome, &descriptor);

    if unhandled {
        write_fallback(&head.method, &writer).await;
    } else if outcome.is_err() && writer.headers_sent() {
        writer.abort();
    }
    outcome
}

/// Issue the backend request and pipe its response into `writer`.
async fn exchange(
    descriptor: OutgoingDescriptor,
    body: OutboundBody,
    writer: ResponseWriter,
    scope: FaultScope,
) -> Result<(), ForwardError> {
    let Some(agent) = &descriptor.agent else {
        return Err(ForwardError::MissingAgent);
    };
    let stream = agent.connect().await?;

    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(ForwardError::upstream)?;
    scope.watch(async move { connection.await.map_err(ForwardError::upstream) });

    let mut request = Request::builder()
        .method(descriptor.method.clone())
        .uri(descriptor.path.as_str())
        .body(body)?;
    *request.headers_mut() = descriptor.headers.clone();

    let response = sender
        .send_request(request)
        .await
        .map_err(ForwardError::upstream)?;

    let (mut parts, mut incoming) = response.into_parts();
    reconcile_connection(&mut parts.headers, descriptor.headers.get(CONNECTION));
    tracing::trace!(status = %parts.status, "Backend response head received");
    if incoming.is_end_stream() {
        return writer.write_empty(parts.status, parts.headers);
    }
    writer.write_head(parts.status, parts.headers)?;

    while let Some(frame) = incoming.frame().await {
        let frame = frame.map_err(ForwardError::upstream)?;
        if let Ok(chunk) = frame.into_data() {
            if !chunk.is_empty() {
                writer.write(chunk).await?;
            }
        }
    }
    writer.end().await
}

/// Keep the client's connection intent: a backend `connection` header is
/// replaced by the client's value, or by `close` when the client sent none.
fn reconcile_connection(response_headers: &mut HeaderMap, inbound: Option<&HeaderValue>) {
    if !response_headers.contains_key(CONNECTION) {
        return;
    }
    let value = inbound
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("close"));
    response_headers.insert(CONNECTION, value);
}

/// Generic 500 for callers that registered no error handling.
/// Failures while writing it are swallowed.
async fn write_fallback(method: &Method, writer: &ResponseWriter) {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));

    if writer
        .write_head(StatusCode::INTERNAL_SERVER_ERROR, headers)
        .is_err()
    {
        // Head already went out or the client is gone; break the body instead.
        writer.abort();
        return;
    }
    if *method != Method::HEAD {
        let _ = writer.write(Bytes::from_static(b"500 error")).await;
    }
    let _ = writer.end().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_connection_value_wins() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("close"));
        let inbound = HeaderValue::from_static("keep-alive");

        reconcile_connection(&mut headers, Some(&inbound));
        assert_eq!(headers[CONNECTION], "keep-alive");
    }

    #[test]
    fn backend_only_connection_is_forced_closed() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));

        reconcile_connection(&mut headers, None);
        assert_eq!(headers[CONNECTION], "close");
    }

    #[test]
    fn absent_backend_connection_stays_absent() {
        let mut headers = HeaderMap::new();
        let inbound = HeaderValue::from_static("keep-alive");

        reconcile_connection(&mut headers, Some(&inbound));
        assert!(!headers.contains_key(CONNECTION));
    }

    #[tokio::test]
    async fn descriptor_without_agent_is_rejected() {
        use crate::http::request::RequestHead;

        let head = RequestHead::new(Method::GET, "/", HeaderMap::new());
        let descriptor =
            OutgoingDescriptor::build(&head, &Destination::new("127.0.0.1", 1), Protocol::Ws);
        assert!(descriptor.agent.is_none());

        let body: OutboundBody = http_body_util::Empty::<Bytes>::new()
            .map_err(|never| -> BoxError { match never {} })
            .boxed_unsync();
        let (writer, _pending) = ResponseWriter::channel();
        let (_boundary, scope) = FaultBoundary::new("test");

        let err = exchange(descriptor, body, writer, scope).await.unwrap_err();
        assert!(matches!(err, ForwardError::MissingAgent));
    }

    #[tokio::test]
    async fn fallback_for_head_has_no_body() {
        let (writer, pending) = ResponseWriter::channel();
        write_fallback(&Method::HEAD, &writer).await;

        let response = pending.into_response().await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.headers()[CONTENT_TYPE], "text/plain");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn fallback_after_head_is_swallowed() {
        let (writer, pending) = ResponseWriter::channel();
        writer.write_head(StatusCode::OK, HeaderMap::new()).unwrap();
        write_fallback(&Method::GET, &writer).await;

        let response = pending.into_response().await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.into_body().collect().await.is_err());
    }
}
