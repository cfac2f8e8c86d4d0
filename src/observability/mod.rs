//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → tracing events with structured fields
//!     → a `connection` span per inbound connection (id, peer)
//!
//! Consumers:
//!     → logging.rs subscriber (fmt or JSON on stdout)
//! ```

pub mod logging;
