//! Request forwarding proxy.
//!
//! Forwards inbound HTTP requests and websocket upgrades to a single backend,
//! adding `x-forwarded-*` provenance headers and reporting every operation's
//! outcome exactly once through observers and an optional callback.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client                ┌───────────────────────────────────────────────┐
//!     ──────────────────────┼─▶ net::listener → net::sniff                  │
//!                           │        │                │                     │
//!                           │   plain HTTP        upgrade                   │
//!                           │        ▼                ▼                     │
//!                           │  http::server      raw socket                 │
//!                           │  (hyper http1)          │                     │
//!                           │        ▼                ▼                     │
//!                           │  proxy::ProxyRequest::{proxy_http, proxy_ws}  │
//!                           │        │  outgoing descriptor + headers       │
//!                           │        ▼                                      │
//!                           │  net::connector (TCP / TLS) ─────────────────┼──▶ Backend
//!                           └───────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod proxy;

pub use config::schema::ProxyConfig;
pub use http::server::ProxyServer;
pub use lifecycle::Shutdown;
pub use proxy::{Destination, ForwardError, ForwardHandle, ProxyRequest};
