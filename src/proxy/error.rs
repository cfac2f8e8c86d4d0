//! Forwarding errors.
//!
//! Every failure of a forwarding operation is funnelled through one
//! [`ForwardError`] and delivered exactly once, together with the outgoing
//! descriptor, to the operation's observers.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Coarse classification of a forwarding failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Backend unreachable, reset, or failed mid-exchange.
    OutboundConnect,
    /// Client went away before the operation completed.
    InboundAbort,
    /// Backend reply could not be read as a websocket handshake.
    ProtocolMismatch,
    /// Writing to the inbound side failed.
    WriteFailure,
    /// Malformed request or a task that vanished without reporting.
    Internal,
}

/// Terminal error of one forwarding operation.
///
/// Sources are shared so the same error can be handed to every observer
/// and to the completion callback.
#[derive(Debug, Clone, Error)]
pub enum ForwardError {
    #[error("failed to connect to backend {host}:{port}: {source}")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("timed out connecting to backend {host}:{port} after {after:?}")]
    ConnectTimeout {
        host: String,
        port: u16,
        after: Duration,
    },

    #[error("tls client setup failed: {0}")]
    Tls(#[source] Arc<rustls::Error>),

    #[error("backend exchange failed: {0}")]
    Upstream(#[source] Arc<hyper::Error>),

    #[error("backend stream failed: {0}")]
    UpstreamIo(#[source] Arc<io::Error>),

    #[error("inbound connection closed before forwarding completed")]
    InboundAbort,

    #[error("websocket handshake failed: {0}")]
    ProtocolMismatch(String),

    #[error("inbound connection is no longer writable")]
    WriteFailure,

    #[error("bridged stream failed: {0}")]
    Bridge(#[source] Arc<io::Error>),

    #[error("invalid outbound request: {0}")]
    InvalidRequest(#[source] Arc<http::Error>),

    #[error("forwarding task ended without reporting an outcome")]
    Abandoned,

    #[error("http descriptor carries no connection agent")]
    MissingAgent,
}

impl ForwardError {
    pub(crate) fn upstream(err: hyper::Error) -> Self {
        ForwardError::Upstream(Arc::new(err))
    }

    pub(crate) fn upstream_io(err: io::Error) -> Self {
        ForwardError::UpstreamIo(Arc::new(err))
    }

    pub(crate) fn bridge(err: io::Error) -> Self {
        ForwardError::Bridge(Arc::new(err))
    }

    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ForwardError::Connect { .. }
            | ForwardError::ConnectTimeout { .. }
            | ForwardError::Tls(_)
            | ForwardError::Upstream(_)
            | ForwardError::UpstreamIo(_) => ErrorKind::OutboundConnect,
            ForwardError::InboundAbort => ErrorKind::InboundAbort,
            ForwardError::ProtocolMismatch(_) => ErrorKind::ProtocolMismatch,
            ForwardError::WriteFailure | ForwardError::Bridge(_) => ErrorKind::WriteFailure,
            ForwardError::InvalidRequest(_) | ForwardError::Abandoned | ForwardError::MissingAgent => {
                ErrorKind::Internal
            }
        }
    }
}

impl From<http::Error> for ForwardError {
    fn from(err: http::Error) -> Self {
        ForwardError::InvalidRequest(Arc::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_cover_transport_failures() {
        let refused = ForwardError::Connect {
            host: "localhost".into(),
            port: 1,
            source: Arc::new(io::Error::from(io::ErrorKind::ConnectionRefused)),
        };
        assert_eq!(refused.kind(), ErrorKind::OutboundConnect);
        assert_eq!(ForwardError::InboundAbort.kind(), ErrorKind::InboundAbort);
        assert_eq!(
            ForwardError::bridge(io::Error::from(io::ErrorKind::BrokenPipe)).kind(),
            ErrorKind::WriteFailure
        );
    }

    #[test]
    fn connect_error_names_backend() {
        let err = ForwardError::ConnectTimeout {
            host: "10.0.0.1".into(),
            port: 8080,
            after: Duration::from_secs(5),
        };
        assert!(err.to_string().contains("10.0.0.1:8080"));
    }
}
