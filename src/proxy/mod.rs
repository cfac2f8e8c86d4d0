//! Forwarding core.
//!
//! # Data Flow
//! ```text
//! ProxyRequest (inbound request + response writer or raw socket)
//!     → outgoing.rs (descriptor: host, port, method, path, headers, agent)
//!         → headers.rs (x-forwarded-* provenance)
//!     → http.rs / ws.rs (outbound call, streaming / bridging)
//!     → fault.rs (every async step reports into one boundary)
//!     → exactly one of on_end / on_error (+ completion callback)
//! ```
//!
//! # Design Decisions
//! - `proxy_http` / `proxy_ws` return immediately; the work runs on its own task
//! - Observers are registered before dispatch, so `on_start` can never be missed
//! - Nothing is shared between operations: each owns its backend connection

pub mod error;
pub mod fault;
pub mod headers;
pub mod http;
pub mod outgoing;
pub mod ws;

use bytes::Bytes;
use hyper::body::Body;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;

use crate::http::request::{InboundRequest, RequestHead};
use crate::http::response::ResponseWriter;

pub use error::{ErrorKind, ForwardError};
pub use fault::{FaultBoundary, FaultScope};
pub use headers::{forwarded_headers, Protocol};
pub use outgoing::{ConnectionAgent, Destination, OutgoingDescriptor};

/// Boxed error accepted from inbound request bodies.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

type DescriptorHook = Box<dyn Fn(&OutgoingDescriptor) + Send + Sync>;
type ErrorHook = Box<dyn Fn(&ForwardError, &OutgoingDescriptor) + Send + Sync>;
type Completion = Box<dyn FnOnce(Result<(), ForwardError>) + Send>;

/// Observers and completion callback of one forwarding operation.
#[derive(Default)]
pub(crate) struct Hooks {
    start: Vec<DescriptorHook>,
    end: Vec<DescriptorHook>,
    error: Vec<ErrorHook>,
    completion: Option<Completion>,
}

impl Hooks {
    pub(crate) fn started(&self, descriptor: &OutgoingDescriptor) {
        for hook in &self.start {
            hook(descriptor);
        }
    }

    /// Whether a failure will reach someone: an error observer or a callback.
    pub(crate) fn handles_errors(&self) -> bool {
        !self.error.is_empty() || self.completion.is_some()
    }

    /// Emit the terminal signal. The callback is consumed, so it can only run once.
    pub(crate) fn finish(&mut self, outcome: &Result<(), ForwardError>, descriptor: &OutgoingDescriptor) {
        match outcome {
            Ok(()) => {
                for hook in &self.end {
                    hook(descriptor);
                }
            }
            Err(err) => {
                for hook in &self.error {
                    hook(err, descriptor);
                }
            }
        }
        if let Some(callback) = self.completion.take() {
            callback(outcome.clone());
        }
    }
}

/// One inbound request paired with its responder, ready to be forwarded.
///
/// `R` is a [`ResponseWriter`] for plain HTTP or the raw client socket for
/// a websocket upgrade.
pub struct ProxyRequest<B, R> {
    request: InboundRequest<B>,
    responder: R,
    hooks: Hooks,
}

impl<B, R> ProxyRequest<B, R> {
    pub fn new(request: InboundRequest<B>, responder: R) -> Self {
        Self {
            request,
            responder,
            hooks: Hooks::default(),
        }
    }

    pub fn head(&self) -> &RequestHead {
        &self.request.head
    }

    /// Called once, with the outgoing descriptor, before the backend is contacted.
    pub fn on_start<F>(mut self, hook: F) -> Self
    where
        F: Fn(&OutgoingDescriptor) + Send + Sync + 'static,
    {
        self.hooks.start.push(Box::new(hook));
        self
    }

    /// Called when the operation completed successfully.
    pub fn on_end<F>(mut self, hook: F) -> Self
    where
        F: Fn(&OutgoingDescriptor) + Send + Sync + 'static,
    {
        self.hooks.end.push(Box::new(hook));
        self
    }

    /// Called when the operation failed. Registering one suppresses the
    /// generic 500 written for unhandled HTTP failures.
    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ForwardError, &OutgoingDescriptor) + Send + Sync + 'static,
    {
        self.hooks.error.push(Box::new(hook));
        self
    }

    fn with_completion<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(Result<(), ForwardError>) + Send + 'static,
    {
        self.hooks.completion = Some(Box::new(callback));
        self
    }
}

impl<B> ProxyRequest<B, ResponseWriter>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    /// Forward as a plain HTTP request/response exchange.
    pub fn proxy_http(self, destination: Destination) -> ForwardHandle {
        let ProxyRequest {
            request,
            responder,
            hooks,
        } = self;
        ForwardHandle::spawn(http::forward(request, responder, destination, hooks))
    }

    /// Like [`proxy_http`](Self::proxy_http), also invoking `callback` with the outcome.
    pub fn proxy_http_with<F>(self, destination: Destination, callback: F) -> ForwardHandle
    where
        F: FnOnce(Result<(), ForwardError>) + Send + 'static,
    {
        self.with_completion(callback).proxy_http(destination)
    }
}

impl<B, S> ProxyRequest<B, S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Forward a websocket upgrade over the raw client socket.
    ///
    /// `destination.head` must hold the bytes already read past the
    /// client's upgrade request head.
    pub fn proxy_ws(self, destination: Destination) -> ForwardHandle {
        let ProxyRequest {
            request,
            responder,
            hooks,
        } = self;
        ForwardHandle::spawn(ws::forward(request.head, responder, destination, hooks))
    }

    /// Like [`proxy_ws`](Self::proxy_ws), also invoking `callback` with the outcome.
    pub fn proxy_ws_with<F>(self, destination: Destination, callback: F) -> ForwardHandle
    where
        F: FnOnce(Result<(), ForwardError>) + Send + 'static,
    {
        self.with_completion(callback).proxy_ws(destination)
    }
}

/// Handle to a dispatched forwarding operation.
#[derive(Debug)]
pub struct ForwardHandle {
    task: JoinHandle<Result<(), ForwardError>>,
}

impl ForwardHandle {
    fn spawn<F>(operation: F) -> Self
    where
        F: std::future::Future<Output = Result<(), ForwardError>> + Send + 'static,
    {
        Self {
            task: tokio::spawn(operation),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the terminal outcome.
    pub async fn wait(self) -> Result<(), ForwardError> {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(error = %e, "Forwarding task did not finish");
                Err(ForwardError::Abandoned)
            }
        }
    }
}
