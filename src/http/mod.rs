//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (accept loop, sniff, hyper http1 or raw upgrade)
//!     → request.rs (method, path, headers, peer)
//!     → proxy::ProxyRequest (forwarding core)
//!     → response.rs (writer adapter streamed back through hyper)
//!     → Send to client
//! ```

pub mod request;
pub mod response;
pub mod server;

pub use request::{InboundRequest, PeerInfo, RequestHead};
pub use response::{PendingResponse, ResponseBody, ResponseWriter};
pub use server::{ProxyServer, ServerError};
