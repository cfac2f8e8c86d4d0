//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, connection limits)
//!     → connection.rs (id, drain tracking)
//!     → sniff.rs (first request head: upgrade or plain HTTP)
//!     → Hand off to the forwarding core
//!
//! Outgoing:
//!     connector.rs (TCP dial, optional TLS) → backend
//! ```

pub mod connection;
pub mod connector;
pub mod listener;
pub mod sniff;
