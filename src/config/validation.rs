//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, window > 0)
//! - Check addresses, protocol names and allow-list entries parse
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GatewayConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::GatewayConfig;
use crate::pool::ProtocolVersion;
use crate::security::IpAllowList;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{field}: '{value}' is not a valid socket address")]
    BadAddress { field: &'static str, value: String },

    #[error("router.via_name '{0}' must be a hostname or HTTP token")]
    BadViaName(String),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("router.supported_protocols must not be empty")]
    NoProtocols,

    #[error("router.supported_protocols: unknown protocol '{0}'")]
    UnknownProtocol(String),

    #[error("registration.allowed_ips: {0}")]
    AllowList(String),
}

pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    check_address(&mut errors, "listener.bind_address", &config.listener.bind_address);
    if config.admin.enabled {
        check_address(&mut errors, "admin.bind_address", &config.admin.bind_address);
    }
    if config.observability.metrics_enabled {
        check_address(
            &mut errors,
            "observability.metrics_address",
            &config.observability.metrics_address,
        );
    }

    let router = &config.router;
    if !is_valid_via_name(&router.via_name) {
        errors.push(ValidationError::BadViaName(router.via_name.clone()));
    }
    if router.connector_max_wait_ms == 0 {
        errors.push(ValidationError::Zero("router.connector_max_wait_ms"));
    }
    if router.idle_read_timeout_ms == 0 {
        errors.push(ValidationError::Zero("router.idle_read_timeout_ms"));
    }
    if router.v3_initial_window == 0 {
        errors.push(ValidationError::Zero("router.v3_initial_window"));
    }
    if router.supported_protocols.is_empty() {
        errors.push(ValidationError::NoProtocols);
    }
    for name in &router.supported_protocols {
        if ProtocolVersion::from_name(name).is_none() {
            errors.push(ValidationError::UnknownProtocol(name.clone()));
        }
    }

    if let Err(e) = IpAllowList::from_entries(&config.registration.allowed_ips) {
        errors.push(ValidationError::AllowList(e.to_string()));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// A hostname or HTTP token: `[0-9a-zA-Z!#$%&'*+-.^_`|~:]+`.
pub fn is_valid_via_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~:".contains(&b))
}

fn check_address(errors: &mut Vec<ValidationError>, field: &'static str, value: &str) {
    if value.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::BadAddress {
            field,
            value: value.to_string(),
        });
    }
}
