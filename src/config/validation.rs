//! Configuration validation.
//!
//! # Design Decisions
//! - Returns all validation errors, not just the first
//! - Pure function: `&ProxyConfig → Result<(), Vec<ValidationError>>`

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::ProxyConfig;

/// Smallest head buffer that still fits a realistic request line and headers.
pub const MIN_HEAD_BYTES: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("listener.bind_address {0:?} is not a socket address")]
    BindAddress(String),

    #[error("listener.max_connections must be greater than zero")]
    ZeroConnections,

    #[error("listener.max_head_bytes must be at least {min}, got {0}", min = MIN_HEAD_BYTES)]
    HeadLimit(usize),

    #[error("backend.host must not be empty")]
    EmptyHost,

    #[error("backend.port must not be zero")]
    ZeroPort,
}

pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::BindAddress(
            config.listener.bind_address.clone(),
        ));
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::ZeroConnections);
    }
    if config.listener.max_head_bytes < MIN_HEAD_BYTES {
        errors.push(ValidationError::HeadLimit(config.listener.max_head_bytes));
    }
    if config.backend.host.trim().is_empty() {
        errors.push(ValidationError::EmptyHost);
    }
    if config.backend.port == 0 {
        errors.push(ValidationError::ZeroPort);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
