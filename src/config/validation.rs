//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (intervals > 0, addresses parse)
//! - Check listener requirements (TLS for secure kinds, trust lists)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Gateway-wide checks and per-listener checks are separate, so one bad
//!   listener is reported without blocking the others

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::{AllowProxyHeaders, ClientAuth, GatewayConfig, ListenerConfig, ListenerKind};

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Validate gateway-wide settings. Listener sections are checked separately
/// by [`validate_listener`] when the listener set is built.
pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listeners.is_empty() {
        errors.push(ValidationError::new("listeners", "at least one listener is required"));
    }

    if config.filters.poll_interval_secs == 0 {
        errors.push(ValidationError::new("filters.poll_interval_secs", "must be greater than zero"));
    }

    if config.origin.address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "origin.address",
            format!("`{}` is not a socket address", config.origin.address),
        ));
    }
    if config.origin.request_timeout_secs == 0 {
        errors.push(ValidationError::new("origin.request_timeout_secs", "must be greater than zero"));
    }

    if config.engine.filter_timeout_ms == Some(0) {
        errors.push(ValidationError::new("engine.filter_timeout_ms", "must be greater than zero when set"));
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("`{}` is not a socket address", config.observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Validate one listener section.
pub fn validate_listener(name: &str, listener: &ListenerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let field = |suffix: &str| format!("listeners.{name}.{suffix}");

    if listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            field("bind_address"),
            format!("`{}` is not a socket address", listener.bind_address),
        ));
    }

    if listener.max_connections == 0 {
        errors.push(ValidationError::new(field("max_connections"), "must be greater than zero"));
    }

    match &listener.tls {
        None if listener.kind.requires_tls() => {
            errors.push(ValidationError::new(
                field("tls"),
                format!("`{}` listeners require a TLS section", listener.kind.as_str()),
            ));
        }
        Some(tls) => {
            let needs_trust_store =
                listener.kind == ListenerKind::MutualTls || tls.client_auth != ClientAuth::None;
            if needs_trust_store && tls.trust_store_path.is_none() {
                errors.push(ValidationError::new(
                    field("tls.trust_store_path"),
                    "client authentication requires a trust store",
                ));
            }
            if tls.protocols.is_empty() {
                errors.push(ValidationError::new(field("tls.protocols"), "must not be empty"));
            }
            if let Some(alpn) = &tls.alpn {
                if alpn.is_empty() {
                    errors.push(ValidationError::new(field("tls.alpn"), "must not be empty when set"));
                }
                if listener.kind == ListenerKind::Http2 && !alpn.iter().any(|p| p == "h2") {
                    errors.push(ValidationError::new(field("tls.alpn"), "`http2` listeners must offer `h2`"));
                }
            }
        }
        None => {}
    }

    if listener.allow_proxy_headers == AllowProxyHeaders::Allowlist && listener.trusted_peers.is_empty() {
        errors.push(ValidationError::new(
            field("trusted_peers"),
            "the `allowlist` policy needs at least one trusted peer",
        ));
    }
    if listener.allow_proxy_headers == AllowProxyHeaders::MutualTls && listener.tls.is_none() {
        errors.push(ValidationError::new(
            field("allow_proxy_headers"),
            "the `mutual_tls` policy needs a TLS section",
        ));
    }

    let timeouts = &listener.timeouts;
    if !(0.0..1.0).contains(&timeouts.max_age_jitter) {
        errors.push(ValidationError::new(field("timeouts.max_age_jitter"), "must be in [0, 1)"));
    }
    if timeouts.drain_secs == 0 {
        errors.push(ValidationError::new(field("timeouts.drain_secs"), "must be greater than zero"));
    }

    if listener.http2.max_concurrent_streams == 0 {
        errors.push(ValidationError::new(field("http2.max_concurrent_streams"), "must be greater than zero"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
