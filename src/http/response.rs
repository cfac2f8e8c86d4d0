//! Writable inbound response.
//!
//! # Responsibilities
//! - Give the forwarding core a `write_head` / `write` / `end` surface
//!   over a response hyper is serving to the client
//! - Stream body chunks through a bounded channel (no whole-body buffering)
//! - Report when the client went away before the response ended
//!
//! # Design Decisions
//! - A body whose writer disappears without `end` fails with an I/O error,
//!   so a truncated response is never presented as complete
//! - A response whose head is never written becomes `502 Bad Gateway`

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use http::{HeaderMap, Response, StatusCode};
use hyper::body::{Body, Frame};
use tokio::sync::{mpsc, oneshot, watch};

use crate::proxy::ForwardError;

/// Chunks buffered between the forwarder and hyper before `write` waits.
const BODY_CHANNEL_CAPACITY: usize = 16;

enum BodyEvent {
    Data(Bytes),
    End,
    Abort,
}

struct WriterShared {
    head: Mutex<Option<oneshot::Sender<http::response::Parts>>>,
    body: mpsc::Sender<BodyEvent>,
    alive: watch::Receiver<()>,
    ended: AtomicBool,
}

/// The inbound response of one HTTP forwarding operation.
///
/// Cheap to clone; all clones write to the same response.
#[derive(Clone)]
pub struct ResponseWriter {
    shared: Arc<WriterShared>,
}

/// The hyper-facing half of a [`ResponseWriter`].
pub struct PendingResponse {
    head: oneshot::Receiver<http::response::Parts>,
    body: ResponseBody,
}

/// Streaming response body fed by a [`ResponseWriter`].
pub struct ResponseBody {
    rx: Option<mpsc::Receiver<BodyEvent>>,
    _alive: Option<watch::Sender<()>>,
}

impl ResponseWriter {
    /// Create a connected writer / pending response pair.
    pub fn channel() -> (ResponseWriter, PendingResponse) {
        let (head_tx, head_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
        let (alive_tx, alive_rx) = watch::channel(());

        let writer = ResponseWriter {
            shared: Arc::new(WriterShared {
                head: Mutex::new(Some(head_tx)),
                body: body_tx,
                alive: alive_rx,
                ended: AtomicBool::new(false),
            }),
        };
        let pending = PendingResponse {
            head: head_rx,
            body: ResponseBody {
                rx: Some(body_rx),
                _alive: Some(alive_tx),
            },
        };
        (writer, pending)
    }

    /// Send the status line and headers. Fails if they were already sent
    /// or the client is gone.
    pub fn write_head(&self, status: StatusCode, headers: HeaderMap) -> Result<(), ForwardError> {
        let sender = self
            .shared
            .head
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(ForwardError::WriteFailure)?;

        let mut response = Response::new(());
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        let (parts, ()) = response.into_parts();

        sender.send(parts).map_err(|_| ForwardError::WriteFailure)
    }

    /// Send the head of a response that has no body and end it at once.
    pub fn write_empty(&self, status: StatusCode, headers: HeaderMap) -> Result<(), ForwardError> {
        // hyper may drop a bodiless response right after the head.
        if self.shared.ended.swap(true, Ordering::AcqRel) {
            return Err(ForwardError::WriteFailure);
        }
        let _ = self.shared.body.try_send(BodyEvent::End);
        self.write_head(status, headers)
    }

    /// Whether the head has been handed over already.
    pub fn headers_sent(&self) -> bool {
        self.shared
            .head
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Queue one body chunk, waiting while the client is slower than the backend.
    pub async fn write(&self, chunk: Bytes) -> Result<(), ForwardError> {
        if self.is_ended() {
            return Err(ForwardError::WriteFailure);
        }
        self.shared
            .body
            .send(BodyEvent::Data(chunk))
            .await
            .map_err(|_| ForwardError::WriteFailure)
    }

    /// Finish the body.
    pub async fn end(&self) -> Result<(), ForwardError> {
        // Must be visible before hyper can observe the end and drop the body.
        if self.shared.ended.swap(true, Ordering::AcqRel) {
            return Err(ForwardError::WriteFailure);
        }
        self.shared
            .body
            .send(BodyEvent::End)
            .await
            .map_err(|_| ForwardError::WriteFailure)
    }

    /// Terminate the body with an error so the client sees a broken response.
    pub fn abort(&self) {
        if self.shared.ended.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shared.body.try_send(BodyEvent::Abort);
    }

    pub fn is_ended(&self) -> bool {
        self.shared.ended.load(Ordering::Acquire)
    }

    /// Resolves when the client side went away before the response ended.
    ///
    /// Never resolves for a response that was ended normally.
    pub fn closed(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let mut alive = self.shared.alive.clone();
        let shared = Arc::clone(&self.shared);
        async move {
            while alive.changed().await.is_ok() {}
            if shared.ended.load(Ordering::Acquire) {
                std::future::pending::<()>().await;
            }
        }
    }
}

impl std::fmt::Debug for ResponseWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseWriter")
            .field("headers_sent", &self.headers_sent())
            .field("ended", &self.is_ended())
            .finish()
    }
}

impl PendingResponse {
    /// Wait for the head and assemble the response hyper should serve.
    pub async fn into_response(self) -> Response<ResponseBody> {
        let PendingResponse { head, body } = self;
        match head.await {
            Ok(parts) => Response::from_parts(parts, body),
            Err(_) => {
                let mut response = Response::new(ResponseBody::empty());
                *response.status_mut() = StatusCode::BAD_GATEWAY;
                response
            }
        }
    }
}

impl ResponseBody {
    /// A body with no data.
    pub fn empty() -> Self {
        Self {
            rx: None,
            _alive: None,
        }
    }
}

impl Body for ResponseBody {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let Some(rx) = self.rx.as_mut() else {
            return Poll::Ready(None);
        };

        match ready!(rx.poll_recv(cx)) {
            Some(BodyEvent::Data(chunk)) => Poll::Ready(Some(Ok(Frame::data(chunk)))),
            Some(BodyEvent::End) => {
                self.rx = None;
                Poll::Ready(None)
            }
            Some(BodyEvent::Abort) | None => {
                self.rx = None;
                Poll::Ready(Some(Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "forwarding terminated before the response completed",
                ))))
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.rx.is_none()
    }
}
