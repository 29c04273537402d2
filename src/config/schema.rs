//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gateway.
//! All types derive Serde traits for deserialization from config files.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration for the gateway.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    /// Named listeners. Each one gets its own connection pipeline.
    pub listeners: BTreeMap<String, ListenerConfig>,

    /// Where filter definitions are loaded from.
    pub filters: FilterSourceConfig,

    /// Filter chain engine settings.
    pub engine: EngineSettings,

    /// Backend that receives requests after the routing phase.
    pub origin: OriginConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Kind of listener. Selects the terminal stage and lifecycle defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ListenerKind {
    /// Plain HTTP/1.1 (TLS optional).
    #[default]
    Http,
    /// HTTP/2 over TLS, negotiated with ALPN.
    Http2,
    /// HTTP/1.1 over TLS with a required client certificate.
    MutualTls,
    /// Long-lived push connections (HTTP/1.1, no idle timeout by default).
    Push,
}

impl ListenerKind {
    /// Whether this kind of listener cannot run without TLS.
    pub fn requires_tls(&self) -> bool {
        matches!(self, ListenerKind::Http2 | ListenerKind::MutualTls)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ListenerKind::Http => "http",
            ListenerKind::Http2 => "http2",
            ListenerKind::MutualTls => "mutual_tls",
            ListenerKind::Push => "push",
        }
    }
}

/// When `X-Forwarded-*` style headers from the client are honored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AllowProxyHeaders {
    /// Always trust them (e.g. behind a load balancer that sets them).
    Always,
    /// Never trust them; they are stripped from every request.
    #[default]
    Never,
    /// Trust them only from peers that presented a verified client certificate.
    MutualTls,
    /// Trust them only from peers listed in `trusted_peers`.
    Allowlist,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:7001").
    pub bind_address: String,

    /// Listener variant.
    pub kind: ListenerKind,

    /// Optional TLS configuration. Required for `http2` and `mutual_tls`.
    pub tls: Option<TlsConfig>,

    /// Proxy header trust policy.
    pub allow_proxy_headers: AllowProxyHeaders,

    /// Peers trusted under the `allowlist` policy.
    pub trusted_peers: Vec<IpAddr>,

    /// Expect a PROXY protocol v1 header before any other bytes.
    pub proxy_protocol: bool,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,

    /// Connection lifecycle timeouts.
    pub timeouts: TimeoutConfig,

    /// HTTP/1.1 terminal settings.
    pub http1: Http1Config,

    /// HTTP/2 terminal settings.
    pub http2: Http2Config,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:7001".to_string(),
            kind: ListenerKind::Http,
            tls: None,
            allow_proxy_headers: AllowProxyHeaders::Never,
            trusted_peers: Vec::new(),
            proxy_protocol: false,
            max_connections: 10_000,
            timeouts: TimeoutConfig::default(),
            http1: Http1Config::default(),
            http2: Http2Config::default(),
        }
    }
}

/// Client certificate requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ClientAuth {
    #[default]
    None,
    Optional,
    Require,
}

/// TLS configuration for a listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate chain file (PEM).
    pub cert_path: PathBuf,

    /// Path to private key file (PEM).
    pub key_path: PathBuf,

    /// Path to trusted client CA certificates (PEM).
    #[serde(default)]
    pub trust_store_path: Option<PathBuf>,

    /// Client certificate requirement. `mutual_tls` listeners always require one.
    #[serde(default)]
    pub client_auth: ClientAuth,

    /// Supported protocol versions, e.g. `["TLSv1.3", "TLSv1.2"]`.
    #[serde(default = "default_tls_protocols")]
    pub protocols: Vec<String>,

    /// ALPN protocols to offer. Defaults depend on the listener kind.
    #[serde(default)]
    pub alpn: Option<Vec<String>>,
}

fn default_tls_protocols() -> Vec<String> {
    vec!["TLSv1.3".to_string(), "TLSv1.2".to_string()]
}

/// Connection lifecycle timeouts.
///
/// Unset values fall back to defaults for the listener kind; `0` disables a limit.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Close connections with no activity for this many seconds.
    pub idle_secs: Option<u64>,

    /// Maximum connection age in seconds.
    pub max_age_secs: Option<u64>,

    /// Fraction of `max_age_secs` subtracted at random per connection.
    pub max_age_jitter: f64,

    /// Close after serving this many requests.
    pub max_requests: Option<u64>,

    /// How long in-flight requests may run once a graceful close begins.
    pub drain_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            idle_secs: None,
            max_age_secs: None,
            max_age_jitter: 0.1,
            max_requests: None,
            drain_secs: 30,
        }
    }
}

/// HTTP/1.1 terminal settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Http1Config {
    /// Deadline for receiving a complete request head.
    pub header_read_timeout_secs: u64,
}

impl Default for Http1Config {
    fn default() -> Self {
        Self {
            header_read_timeout_secs: 30,
        }
    }
}

/// HTTP/2 terminal settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Http2Config {
    /// Guard the multiplexed stream layer and turn protocol errors into a graceful close.
    pub catch_connection_errors: bool,

    /// Maximum concurrent streams per connection.
    pub max_concurrent_streams: u32,

    /// Maximum size of a decoded header list.
    pub max_header_list_size: u32,

    /// PING interval for detecting dead peers.
    pub keep_alive_interval_secs: Option<u64>,
}

impl Default for Http2Config {
    fn default() -> Self {
        Self {
            catch_connection_errors: true,
            max_concurrent_streams: 100,
            max_header_list_size: 32_768,
            keep_alive_interval_secs: None,
        }
    }
}

/// Filter source configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FilterSourceConfig {
    /// Directory containing `*.toml` filter definitions.
    pub directory: PathBuf,

    /// Poll interval in seconds.
    pub poll_interval_secs: u64,

    /// Also poll as soon as the directory reports a change.
    pub watch_changes: bool,

    /// Filters that stay soft-disabled regardless of marker files.
    pub disabled: Vec<String>,
}

impl Default for FilterSourceConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("filters"),
            poll_interval_secs: 5,
            watch_changes: true,
            disabled: Vec::new(),
        }
    }
}

/// Filter chain engine settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct EngineSettings {
    /// Upper bound on a single filter invocation in milliseconds.
    pub filter_timeout_ms: Option<u64>,
}

/// Origin (backend) configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OriginConfig {
    /// Backend address (e.g., "127.0.0.1:8080").
    pub address: String,

    /// Connection establishment timeout in seconds.
    pub connect_timeout_secs: u64,

    /// Total time for the upstream request/response in seconds.
    pub request_timeout_secs: u64,
}

impl Default for OriginConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:8080".to_string(),
            connect_timeout_secs: 5,
            request_timeout_secs: 30,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_listener_map() {
        let config: GatewayConfig = toml::from_str(
            r#"
            [listeners.main]
            bind_address = "127.0.0.1:7001"
            allow_proxy_headers = "always"

            [listeners.secure]
            bind_address = "127.0.0.1:7443"
            kind = "http2"
            [listeners.secure.tls]
            cert_path = "server.crt"
            key_path = "server.key"
            [listeners.secure.http2]
            catch_connection_errors = false
            "#,
        )
        .unwrap();

        assert_eq!(config.listeners.len(), 2);
        let main = &config.listeners["main"];
        assert_eq!(main.kind, ListenerKind::Http);
        assert_eq!(main.allow_proxy_headers, AllowProxyHeaders::Always);
        assert!(main.tls.is_none());

        let secure = &config.listeners["secure"];
        assert_eq!(secure.kind, ListenerKind::Http2);
        let tls = secure.tls.as_ref().unwrap();
        assert_eq!(tls.protocols, vec!["TLSv1.3", "TLSv1.2"]);
        assert_eq!(tls.client_auth, ClientAuth::None);
        assert!(!secure.http2.catch_connection_errors);
        assert_eq!(secure.max_connections, 10_000);
    }

    #[test]
    fn empty_document_uses_defaults() {
        let config: GatewayConfig = toml::from_str("").unwrap();
        assert!(config.listeners.is_empty());
        assert_eq!(config.filters.poll_interval_secs, 5);
        assert_eq!(config.origin.request_timeout_secs, 30);
    }
}
