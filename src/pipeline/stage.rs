//! Pipeline stages.
//!
//! A pipeline is an immutable, ordered list of stages built once per
//! listener. Every connection on the listener walks the same list; the only
//! per-connection choice is the terminal stage picked by ALPN.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio_rustls::TlsAcceptor;

use crate::config::{ClientAuth, Http1Config, Http2Config, ListenerKind};
use crate::lifecycle::LifecyclePolicy;
use crate::pipeline::proxy_headers::ProxyHeaderTrust;

/// HTTP/1.1 terminal settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Http1Settings {
    pub header_read_timeout: Duration,
}

impl From<&Http1Config> for Http1Settings {
    fn from(config: &Http1Config) -> Self {
        Self {
            header_read_timeout: Duration::from_secs(config.header_read_timeout_secs),
        }
    }
}

/// HTTP/2 terminal settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Http2Settings {
    /// Install the connection error guard in front of the stream layer.
    /// The guard classifies connection errors as protocol errors and logs
    /// them at warn; it does not change how the connection is closed.
    pub error_guard: bool,
    pub max_concurrent_streams: u32,
    pub max_header_list_size: u32,
    pub keep_alive_interval: Option<Duration>,
}

impl From<&Http2Config> for Http2Settings {
    fn from(config: &Http2Config) -> Self {
        Self {
            error_guard: config.catch_connection_errors,
            max_concurrent_streams: config.max_concurrent_streams,
            max_header_list_size: config.max_header_list_size,
            keep_alive_interval: config.keep_alive_interval_secs.map(Duration::from_secs),
        }
    }
}

/// TLS handshake stage.
#[derive(Clone)]
pub struct TlsStage {
    pub acceptor: TlsAcceptor,
    pub client_auth: ClientAuth,
    /// ALPN protocols offered during the handshake, in preference order.
    pub alpn: Arc<[String]>,
}

impl fmt::Debug for TlsStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsStage")
            .field("client_auth", &self.client_auth)
            .field("alpn", &self.alpn)
            .finish_non_exhaustive()
    }
}

/// Placeholder for the terminal stage, resolved after the TLS handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlpnStage {
    pub http1: Http1Settings,
    pub http2: Http2Settings,
}

/// One step a connection passes through before requests are decoded.
#[derive(Debug, Clone)]
pub enum Stage {
    /// Read a PROXY protocol v1 header.
    ProxyProtocol,
    /// Decide whether forwarding headers are honored.
    ProxyHeaders(ProxyHeaderTrust),
    Tls(TlsStage),
    /// Install idle, expiry and request budget limits.
    Lifecycle(LifecyclePolicy),
    /// Fixed HTTP/1.1 terminal stage.
    Http1(Http1Settings),
    /// Defer the terminal stage until ALPN completes.
    Alpn(AlpnStage),
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::ProxyProtocol => "proxy_protocol",
            Stage::ProxyHeaders(_) => "proxy_headers",
            Stage::Tls(_) => "tls",
            Stage::Lifecycle(_) => "lifecycle",
            Stage::Http1(_) => "http1",
            Stage::Alpn(_) => "alpn",
        }
    }
}

/// The stage that decodes requests and hands them to the filter engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalStage {
    Http1(Http1Settings),
    /// Frame codec, stream multiplexer and per-stream handler, optionally
    /// guarded by the connection error stage.
    Http2(Http2Settings),
}

impl TerminalStage {
    /// Names of the stages this terminal expands into.
    pub fn stage_names(&self) -> Vec<&'static str> {
        match self {
            TerminalStage::Http1(_) => vec!["http1_codec", "http1_handler"],
            TerminalStage::Http2(settings) => {
                let mut names = Vec::with_capacity(4);
                if settings.error_guard {
                    names.push("http2_connection_error_guard");
                }
                names.extend(["http2_frame_codec", "http2_multiplexer", "http2_stream_handler"]);
                names
            }
        }
    }
}

/// The ordered stage list of one listener.
#[derive(Debug, Clone)]
pub struct Pipeline {
    name: Arc<str>,
    kind: ListenerKind,
    stages: Arc<[Stage]>,
}

impl Pipeline {
    pub fn new(name: impl Into<Arc<str>>, kind: ListenerKind, stages: Vec<Stage>) -> Self {
        Self {
            name: name.into(),
            kind,
            stages: stages.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn shared_name(&self) -> Arc<str> {
        Arc::clone(&self.name)
    }

    pub fn kind(&self) -> ListenerKind {
        self.kind
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(Stage::name).collect()
    }

    pub fn terminates_tls(&self) -> bool {
        self.stages.iter().any(|s| matches!(s, Stage::Tls(_)))
    }

    pub fn lifecycle(&self) -> Option<&LifecyclePolicy> {
        self.stages.iter().find_map(|s| match s {
            Stage::Lifecycle(policy) => Some(policy),
            _ => None,
        })
    }
}
